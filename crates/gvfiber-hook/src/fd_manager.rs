//! Per-descriptor state for hooked I/O
//!
//! The hook layer needs to know, for every fd it sees, whether it is a
//! socket, whether the *user* asked for nonblocking mode (the runtime
//! always forces it on sockets) and how long reads and writes may wait.
//!
//! Locking: one `RwLock` over a sparse table indexed by fd. Lookups take the
//! read lock; creation takes the write lock and re-checks the slot, growing
//! the table by half when `fd` is past its end. Per-fd fields are atomics,
//! so no lock is held while using an `FdCtx`.

use parking_lot::RwLock;
use std::fmt;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Initial number of table slots
const INITIAL_SLOTS: usize = 64;

/// Stored in place of a timeout when there is none
const NO_TIMEOUT: u64 = u64::MAX;

/// Which direction a timeout applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// `SO_RCVTIMEO`: read, recv*, accept
    Recv,
    /// `SO_SNDTIMEO`: write, send*
    Send,
}

impl TimeoutKind {
    /// Map a `SOL_SOCKET` option name to a timeout kind.
    pub fn from_optname(optname: libc::c_int) -> Option<TimeoutKind> {
        match optname {
            libc::SO_RCVTIMEO => Some(TimeoutKind::Recv),
            libc::SO_SNDTIMEO => Some(TimeoutKind::Send),
            _ => None,
        }
    }
}

/// State of one descriptor
pub struct FdCtx {
    fd: RawFd,
    initialized: AtomicBool,
    socket: AtomicBool,
    /// Nonblocking forced on by the runtime
    sys_nonblock: AtomicBool,
    /// Nonblocking requested by the user through fcntl/ioctl
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout: AtomicU64,
    send_timeout: AtomicU64,
}

impl FdCtx {
    fn new(fd: RawFd) -> FdCtx {
        let ctx = FdCtx {
            fd,
            initialized: AtomicBool::new(false),
            socket: AtomicBool::new(false),
            sys_nonblock: AtomicBool::new(false),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout: AtomicU64::new(NO_TIMEOUT),
            send_timeout: AtomicU64::new(NO_TIMEOUT),
        };
        ctx.init();
        ctx
    }

    /// Probe the fd. Sockets are switched to O_NONBLOCK once, here.
    fn init(&self) -> bool {
        if self.initialized.load(Ordering::Acquire) {
            return true;
        }

        // Safety: `stat` is plain old data and fstat only writes into it.
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        let is_socket = if unsafe { libc::fstat(self.fd, &mut st) } == -1 {
            self.initialized.store(false, Ordering::Release);
            false
        } else {
            self.initialized.store(true, Ordering::Release);
            st.st_mode & libc::S_IFMT == libc::S_IFSOCK
        };
        self.socket.store(is_socket, Ordering::Release);

        if is_socket {
            // Safety: fcntl on an fd we just stat'ed; failures are harmless.
            unsafe {
                let flags = libc::fcntl(self.fd, libc::F_GETFL, 0);
                if flags != -1 && flags & libc::O_NONBLOCK == 0 {
                    libc::fcntl(self.fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                }
            }
        }
        self.sys_nonblock.store(is_socket, Ordering::Release);
        self.user_nonblock.store(false, Ordering::Release);
        self.closed.store(false, Ordering::Release);
        self.initialized.load(Ordering::Acquire)
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// fstat succeeded when the context was created
    pub fn is_init(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn is_socket(&self) -> bool {
        self.socket.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    pub fn set_user_nonblock(&self, v: bool) {
        self.user_nonblock.store(v, Ordering::Release);
    }

    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Acquire)
    }

    pub fn set_sys_nonblock(&self, v: bool) {
        self.sys_nonblock.store(v, Ordering::Release);
    }

    /// Timeout in milliseconds, `None` for "wait forever"
    pub fn timeout(&self, kind: TimeoutKind) -> Option<u64> {
        let ms = self.timeout_slot(kind).load(Ordering::Acquire);
        (ms != NO_TIMEOUT).then_some(ms)
    }

    pub fn set_timeout(&self, kind: TimeoutKind, ms: Option<u64>) {
        self.timeout_slot(kind)
            .store(ms.unwrap_or(NO_TIMEOUT), Ordering::Release);
    }

    fn timeout_slot(&self, kind: TimeoutKind) -> &AtomicU64 {
        match kind {
            TimeoutKind::Recv => &self.recv_timeout,
            TimeoutKind::Send => &self.send_timeout,
        }
    }
}

impl fmt::Debug for FdCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FdCtx")
            .field("fd", &self.fd)
            .field("socket", &self.is_socket())
            .field("sys_nonblock", &self.sys_nonblock())
            .field("user_nonblock", &self.user_nonblock())
            .field("closed", &self.is_closed())
            .field("recv_timeout", &self.timeout(TimeoutKind::Recv))
            .field("send_timeout", &self.timeout(TimeoutKind::Send))
            .finish()
    }
}

/// Sparse fd → `FdCtx` table
pub struct FdManager {
    slots: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

impl FdManager {
    pub fn new() -> FdManager {
        FdManager {
            slots: RwLock::new(vec![None; INITIAL_SLOTS]),
        }
    }

    /// The process-wide table used by the hooked syscalls
    pub fn global() -> &'static FdManager {
        static GLOBAL: OnceLock<FdManager> = OnceLock::new();
        GLOBAL.get_or_init(FdManager::new)
    }

    /// Context for `fd`; created (and the fd probed) when absent and
    /// `auto_create` is set.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdCtx>> {
        let idx = usize::try_from(fd).ok()?;
        {
            let slots = self.slots.read();
            match slots.get(idx) {
                Some(Some(ctx)) => return Some(ctx.clone()),
                _ if !auto_create => return None,
                _ => {}
            }
        }

        let mut slots = self.slots.write();
        if idx >= slots.len() {
            let len = (idx * 3 / 2).max(idx + 1);
            slots.resize(len, None);
        }
        // Another thread may have created it in between.
        let ctx = slots[idx].get_or_insert_with(|| Arc::new(FdCtx::new(fd)));
        Some(ctx.clone())
    }

    /// Forget `fd`. The table never shrinks.
    pub fn del(&self, fd: RawFd) {
        let Ok(idx) = usize::try_from(fd) else {
            return;
        };
        if let Some(slot) = self.slots.write().get_mut(idx) {
            *slot = None;
        }
    }
}

impl Default for FdManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FdManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.read();
        f.debug_struct("FdManager")
            .field("capacity", &slots.len())
            .field("tracked", &slots.iter().flatten().count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, UdpSocket};
    use std::os::fd::AsRawFd;

    fn nonblocking(fd: RawFd) -> bool {
        // Safety: F_GETFL on an fd owned by the test.
        unsafe { libc::fcntl(fd, libc::F_GETFL, 0) & libc::O_NONBLOCK != 0 }
    }

    #[test]
    fn test_socket_is_forced_nonblocking() {
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let fd = sock.as_raw_fd();
        assert!(!nonblocking(fd));

        let mgr = FdManager::new();
        let ctx = mgr.get(fd, true).unwrap();
        assert!(ctx.is_init());
        assert!(ctx.is_socket());
        assert!(ctx.sys_nonblock());
        assert!(!ctx.user_nonblock());
        assert!(nonblocking(fd));
    }

    #[test]
    fn test_regular_file_is_left_alone() {
        let file = std::fs::File::open(concat!(env!("CARGO_MANIFEST_DIR"), "/Cargo.toml")).unwrap();
        let mgr = FdManager::new();
        let ctx = mgr.get(file.as_raw_fd(), true).unwrap();
        assert!(ctx.is_init());
        assert!(!ctx.is_socket());
        assert!(!ctx.sys_nonblock());
    }

    #[test]
    fn test_get_without_create_and_del() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let fd = listener.as_raw_fd();
        let mgr = FdManager::new();

        assert!(mgr.get(fd, false).is_none());
        let a = mgr.get(fd, true).unwrap();
        let b = mgr.get(fd, false).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        mgr.del(fd);
        assert!(mgr.get(fd, false).is_none());
        // Deleting twice or out of range is harmless
        mgr.del(fd);
        mgr.del(10_000);
        mgr.del(-1);
        assert!(mgr.get(-1, true).is_none());
    }

    #[test]
    fn test_table_grows_by_half() {
        let mgr = FdManager::new();
        // fstat fails, but the slot is still created
        let ctx = mgr.get(5000, true).unwrap();
        assert_eq!(ctx.fd(), 5000);
        assert!(!ctx.is_init());
        assert_eq!(mgr.slots.read().len(), 7500);
        assert!(mgr.get(5000, false).is_some());
    }

    #[test]
    fn test_timeouts_default_to_none() {
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mgr = FdManager::new();
        let ctx = mgr.get(sock.as_raw_fd(), true).unwrap();
        assert_eq!(ctx.timeout(TimeoutKind::Recv), None);
        assert_eq!(ctx.timeout(TimeoutKind::Send), None);

        ctx.set_timeout(TimeoutKind::Recv, Some(100));
        assert_eq!(ctx.timeout(TimeoutKind::Recv), Some(100));
        assert_eq!(ctx.timeout(TimeoutKind::Send), None);
        ctx.set_timeout(TimeoutKind::Recv, None);
        assert_eq!(ctx.timeout(TimeoutKind::Recv), None);
    }

    #[test]
    fn test_timeout_kind_from_optname() {
        assert_eq!(TimeoutKind::from_optname(libc::SO_RCVTIMEO), Some(TimeoutKind::Recv));
        assert_eq!(TimeoutKind::from_optname(libc::SO_SNDTIMEO), Some(TimeoutKind::Send));
        assert_eq!(TimeoutKind::from_optname(libc::SO_REUSEADDR), None);
    }
}
