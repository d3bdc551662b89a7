//! Fiber-aware versions of blocking calls
//!
//! Every function here has the signature and error convention of its libc
//! namesake (-1 and `errno` on failure). On a thread with hooking enabled,
//! inside a fiber of an `IoManager`, a call that would block parks the fiber
//! on the reactor instead of the thread:
//!
//! ```text
//!   read(fd) ─▶ EAGAIN ─▶ add_event(fd, READ) [+ timeout timer] ─▶ yield
//!      ▲                                                            │
//!      └──────── retry ◀── resumed by readiness ◀───────────────────┘
//!                          or by the timer (→ -1, ETIMEDOUT)
//! ```
//!
//! Anywhere else the native call is made unchanged. Only descriptors created
//! through [`socket`] or [`accept`] (or registered with `FdManager`) get this
//! treatment.

use crate::fd_manager::{FdManager, TimeoutKind};
use gvfiber_runtime::{tcp_connect_timeout, Event, Fiber, IoManager, Timer};
use nix::errno::Errno;
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Once};

use libc::{c_int, c_uint, c_ulong, c_void, msghdr, sockaddr, socklen_t, ssize_t};

/// Cached `tcp.connect.timeout`, kept current by a config listener
static CONNECT_TIMEOUT_MS: AtomicU64 = AtomicU64::new(0);
static CONNECT_TIMEOUT_INIT: Once = Once::new();

/// Timeout used by [`connect`]; `None` when `tcp.connect.timeout` is 0.
pub fn connect_timeout() -> Option<u64> {
    CONNECT_TIMEOUT_INIT.call_once(|| {
        let var = tcp_connect_timeout();
        var.add_listener(|old, new| {
            tracing::info!(old_ms = *old, new_ms = *new, "tcp connect timeout changed");
            CONNECT_TIMEOUT_MS.store(*new, Ordering::Relaxed);
        });
        CONNECT_TIMEOUT_MS.store(var.get(), Ordering::Relaxed);
    });
    match CONNECT_TIMEOUT_MS.load(Ordering::Relaxed) {
        0 => None,
        ms => Some(ms),
    }
}

/// Shared between a parked call and its timeout timer. Non-zero once the
/// timer has fired, holding the errno to report.
#[derive(Default)]
struct TimerInfo {
    cancelled: AtomicI32,
}

impl TimerInfo {
    fn cancel_with(&self, errno: c_int) -> bool {
        self.cancelled
            .compare_exchange(0, errno, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn cancelled(&self) -> Option<c_int> {
        match self.cancelled.load(Ordering::Acquire) {
            0 => None,
            errno => Some(errno),
        }
    }
}

#[inline]
fn set_errno(errno: c_int) {
    // Safety: the errno location is valid for the calling thread.
    unsafe { *libc::__errno_location() = errno };
}

/// The reactor to park on, if this call may be hooked.
fn reactor() -> Option<Arc<IoManager>> {
    if !gvfiber_runtime::is_hook_enabled() {
        return None;
    }
    let iom = IoManager::current()?;
    Fiber::current_is_stackful().then_some(iom)
}

/// Arm a one-shot timer that aborts the wait on `fd` with ETIMEDOUT.
fn arm_timeout(iom: &Arc<IoManager>, ms: u64, fd: RawFd, event: Event, info: &Arc<TimerInfo>) -> Arc<Timer> {
    let winfo = Arc::downgrade(info);
    let wiom = Arc::downgrade(iom);
    iom.add_condition_timer(
        ms,
        move || {
            let Some(info) = winfo.upgrade() else {
                return;
            };
            if !info.cancel_with(libc::ETIMEDOUT) {
                return;
            }
            if let Some(iom) = wiom.upgrade() {
                iom.cancel_event(fd, event);
            }
        },
        Arc::downgrade(info),
        false,
    )
}

/// Park the calling fiber until `event` fires on `fd` or `timeout` passes.
///
/// Returns the errno to report if the wait did not end with readiness.
fn wait_for(iom: &Arc<IoManager>, fd: RawFd, event: Event, timeout: Option<u64>, op: &'static str) -> Option<c_int> {
    let info = Arc::new(TimerInfo::default());
    let timer = timeout.map(|ms| arm_timeout(iom, ms, fd, event, &info));
    let res = park_on(iom, fd, event, &info, op);
    if let Some(timer) = timer {
        timer.cancel();
    }
    res
}

/// Arm `event` for the calling fiber and yield until it fires or is cancelled.
fn park_on(iom: &Arc<IoManager>, fd: RawFd, event: Event, info: &TimerInfo, op: &'static str) -> Option<c_int> {
    if let Err(e) = iom.add_event(fd, event, None) {
        tracing::error!(fd, op, ?event, error = %e, "add_event failed");
        return Some(e.raw_os_error().unwrap_or(libc::EIO));
    }
    // A timeout that fired before the event was armed had nothing to cancel.
    // Exactly one of its cancel_event and this one finds the event and
    // reschedules the fiber, so the yield below always returns.
    if info.cancelled().is_some() {
        iom.cancel_event(fd, event);
    }

    Fiber::yield_to_hold();
    info.cancelled()
}

/// Milliseconds in a timespec, saturating at `u64::MAX`.
fn timespec_ms(ts: &libc::timespec) -> u64 {
    (ts.tv_sec as u64)
        .saturating_mul(1000)
        .saturating_add(ts.tv_nsec as u64 / 1_000_000)
}

/// Milliseconds in a timeval, saturating at `u64::MAX`; `None` if negative.
fn timeval_ms(tv: &libc::timeval) -> Option<u64> {
    if tv.tv_sec < 0 || tv.tv_usec < 0 {
        return None;
    }
    Some(
        (tv.tv_sec as u64)
            .saturating_mul(1000)
            .saturating_add(tv.tv_usec as u64 / 1000),
    )
}

/// Run a read/write-family call, parking on EAGAIN.
fn do_io<F>(fd: RawFd, op: &'static str, event: Event, kind: TimeoutKind, mut call: F) -> ssize_t
where
    F: FnMut() -> ssize_t,
{
    let Some(iom) = reactor() else {
        return call();
    };
    let Some(ctx) = FdManager::global().get(fd, false) else {
        return call();
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return call();
    }

    let timeout = ctx.timeout(kind);
    loop {
        let mut n = call();
        while n == -1 && Errno::last() == Errno::EINTR {
            n = call();
        }
        if n != -1 || Errno::last() != Errno::EAGAIN {
            return n;
        }
        if let Some(errno) = wait_for(&iom, fd, event, timeout, op) {
            set_errno(errno);
            return -1;
        }
        // Woken by close(); the fd number may already belong to someone else.
        if ctx.is_closed() {
            set_errno(libc::EBADF);
            return -1;
        }
    }
}

/// Yield the current fiber for `ms` milliseconds.
fn park_for(iom: &Arc<IoManager>, ms: u64) {
    let fiber = Fiber::current();
    let weak = Arc::downgrade(iom);
    iom.add_timer(
        ms,
        move || {
            if let Some(iom) = weak.upgrade() {
                iom.schedule(fiber.clone(), None);
            }
        },
        false,
    );
    Fiber::yield_to_hold();
}

pub fn sleep(seconds: c_uint) -> c_uint {
    match reactor() {
        Some(iom) => {
            park_for(&iom, u64::from(seconds) * 1000);
            0
        }
        // Safety: plain libc call.
        None => unsafe { libc::sleep(seconds) },
    }
}

pub fn usleep(usec: libc::useconds_t) -> c_int {
    match reactor() {
        Some(iom) => {
            park_for(&iom, u64::from(usec) / 1000);
            0
        }
        // Safety: plain libc call.
        None => unsafe { libc::usleep(usec) },
    }
}

/// # Safety
///
/// `rem` must be null or valid for writes, as for `nanosleep(2)`.
pub unsafe fn nanosleep(req: &libc::timespec, rem: *mut libc::timespec) -> c_int {
    if req.tv_sec < 0 || !(0..1_000_000_000).contains(&req.tv_nsec) {
        set_errno(libc::EINVAL);
        return -1;
    }
    match reactor() {
        Some(iom) => {
            park_for(&iom, timespec_ms(req));
            0
        }
        None => unsafe { libc::nanosleep(req, rem) },
    }
}

pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> RawFd {
    // Safety: plain libc call.
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if fd != -1 && gvfiber_runtime::is_hook_enabled() {
        FdManager::global().get(fd, true);
    }
    fd
}

/// `connect` bounded by `timeout_ms` (`None` waits as long as the kernel does).
///
/// # Safety
///
/// `addr` must point to `addrlen` readable bytes, as for `connect(2)`.
pub unsafe fn connect_with_timeout(
    fd: RawFd,
    addr: *const sockaddr,
    addrlen: socklen_t,
    timeout_ms: Option<u64>,
) -> c_int {
    if !gvfiber_runtime::is_hook_enabled() {
        return unsafe { libc::connect(fd, addr, addrlen) };
    }
    let ctx = match FdManager::global().get(fd, false) {
        Some(ctx) if !ctx.is_closed() => ctx,
        _ => {
            set_errno(libc::EBADF);
            return -1;
        }
    };
    if !ctx.is_socket() || ctx.user_nonblock() {
        return unsafe { libc::connect(fd, addr, addrlen) };
    }

    let n = unsafe { libc::connect(fd, addr, addrlen) };
    if n == 0 || Errno::last() != Errno::EINPROGRESS {
        return n;
    }
    let Some(iom) = reactor() else {
        return n;
    };
    if let Some(errno) = wait_for(&iom, fd, Event::WRITE, timeout_ms, "connect") {
        set_errno(errno);
        return -1;
    }

    let mut error: c_int = 0;
    let mut len = std::mem::size_of::<c_int>() as socklen_t;
    // Safety: SO_ERROR writes one c_int into `error`.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            (&mut error as *mut c_int).cast(),
            &mut len,
        )
    };
    if rc == -1 {
        return -1;
    }
    if error != 0 {
        set_errno(error);
        return -1;
    }
    0
}

/// `connect` bounded by `tcp.connect.timeout`.
///
/// # Safety
///
/// As for [`connect_with_timeout`].
pub unsafe fn connect(fd: RawFd, addr: *const sockaddr, addrlen: socklen_t) -> c_int {
    unsafe { connect_with_timeout(fd, addr, addrlen, connect_timeout()) }
}

/// # Safety
///
/// `addr`/`addrlen` must be null or valid, as for `accept(2)`.
pub unsafe fn accept(fd: RawFd, addr: *mut sockaddr, addrlen: *mut socklen_t) -> RawFd {
    let n = do_io(fd, "accept", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::accept(fd, addr, addrlen) as ssize_t
    });
    let client = n as RawFd;
    if client >= 0 && gvfiber_runtime::is_hook_enabled() {
        FdManager::global().get(client, true);
    }
    client
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> ssize_t {
    do_io(fd, "read", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::read(fd, buf.as_mut_ptr().cast(), buf.len())
    })
}

pub fn readv(fd: RawFd, bufs: &mut [IoSliceMut<'_>]) -> ssize_t {
    // IoSliceMut is ABI compatible with iovec on unix.
    do_io(fd, "readv", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::readv(fd, bufs.as_mut_ptr().cast(), iov_count(bufs.len()))
    })
}

pub fn recv(fd: RawFd, buf: &mut [u8], flags: c_int) -> ssize_t {
    do_io(fd, "recv", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), flags)
    })
}

/// # Safety
///
/// `src_addr`/`addrlen` must be null or valid, as for `recvfrom(2)`.
pub unsafe fn recvfrom(
    fd: RawFd,
    buf: &mut [u8],
    flags: c_int,
    src_addr: *mut sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    do_io(fd, "recvfrom", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::recvfrom(fd, buf.as_mut_ptr().cast(), buf.len(), flags, src_addr, addrlen)
    })
}

/// # Safety
///
/// `msg` must describe valid buffers, as for `recvmsg(2)`.
pub unsafe fn recvmsg(fd: RawFd, msg: *mut msghdr, flags: c_int) -> ssize_t {
    do_io(fd, "recvmsg", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::recvmsg(fd, msg, flags)
    })
}

pub fn write(fd: RawFd, buf: &[u8]) -> ssize_t {
    do_io(fd, "write", Event::WRITE, TimeoutKind::Send, || unsafe {
        libc::write(fd, buf.as_ptr().cast(), buf.len())
    })
}

pub fn writev(fd: RawFd, bufs: &[IoSlice<'_>]) -> ssize_t {
    // IoSlice is ABI compatible with iovec on unix.
    do_io(fd, "writev", Event::WRITE, TimeoutKind::Send, || unsafe {
        libc::writev(fd, bufs.as_ptr().cast(), iov_count(bufs.len()))
    })
}

pub fn send(fd: RawFd, buf: &[u8], flags: c_int) -> ssize_t {
    do_io(fd, "send", Event::WRITE, TimeoutKind::Send, || unsafe {
        libc::send(fd, buf.as_ptr().cast(), buf.len(), flags)
    })
}

/// # Safety
///
/// `dest_addr` must point to `addrlen` readable bytes, as for `sendto(2)`.
pub unsafe fn sendto(
    fd: RawFd,
    buf: &[u8],
    flags: c_int,
    dest_addr: *const sockaddr,
    addrlen: socklen_t,
) -> ssize_t {
    do_io(fd, "sendto", Event::WRITE, TimeoutKind::Send, || unsafe {
        libc::sendto(fd, buf.as_ptr().cast(), buf.len(), flags, dest_addr, addrlen)
    })
}

/// # Safety
///
/// `msg` must describe valid buffers, as for `sendmsg(2)`.
pub unsafe fn sendmsg(fd: RawFd, msg: *const msghdr, flags: c_int) -> ssize_t {
    do_io(fd, "sendmsg", Event::WRITE, TimeoutKind::Send, || unsafe {
        libc::sendmsg(fd, msg, flags)
    })
}

/// Close `fd`, first waking every fiber parked on it.
///
/// The fd is forgotten by `FdManager` even on an unhooked thread, so a
/// later fd with the same number starts from a fresh context.
pub fn close(fd: RawFd) -> c_int {
    let fds = FdManager::global();
    if let Some(ctx) = fds.get(fd, false) {
        ctx.mark_closed();
        if gvfiber_runtime::is_hook_enabled() {
            if let Some(iom) = IoManager::current() {
                iom.cancel_all(fd);
            }
        }
        fds.del(fd);
    }
    // Safety: plain libc call.
    unsafe { libc::close(fd) }
}

/// `fcntl` with an integer (or no) argument.
///
/// `F_SETFL`/`F_GETFL` on tracked sockets keep the user's view of
/// `O_NONBLOCK` while the socket itself stays nonblocking.
pub fn fcntl(fd: RawFd, cmd: c_int, arg: c_int) -> c_int {
    let tracked = || {
        FdManager::global()
            .get(fd, false)
            .filter(|ctx| !ctx.is_closed() && ctx.is_socket())
    };
    match cmd {
        libc::F_SETFL => {
            let mut arg = arg;
            if let Some(ctx) = tracked() {
                ctx.set_user_nonblock(arg & libc::O_NONBLOCK != 0);
                if ctx.sys_nonblock() {
                    arg |= libc::O_NONBLOCK;
                } else {
                    arg &= !libc::O_NONBLOCK;
                }
            }
            // Safety: plain libc call with an integer argument.
            unsafe { libc::fcntl(fd, cmd, arg) }
        }
        libc::F_GETFL => {
            // Safety: as above.
            let flags = unsafe { libc::fcntl(fd, cmd) };
            if flags == -1 {
                return flags;
            }
            match tracked() {
                Some(ctx) if ctx.user_nonblock() => flags | libc::O_NONBLOCK,
                Some(_) => flags & !libc::O_NONBLOCK,
                None => flags,
            }
        }
        // Safety: as above.
        _ => unsafe { libc::fcntl(fd, cmd, arg) },
    }
}

/// `ioctl`; `FIONBIO` on a tracked socket only changes the user's view.
///
/// # Safety
///
/// `arg` must be valid for `request`, as for `ioctl(2)`.
pub unsafe fn ioctl(fd: RawFd, request: c_ulong, arg: *mut c_void) -> c_int {
    if request == libc::FIONBIO as c_ulong && !arg.is_null() {
        let user_nonblock = unsafe { *(arg as *const c_int) } != 0;
        if let Some(ctx) = FdManager::global().get(fd, false) {
            if !ctx.is_closed() && ctx.is_socket() {
                ctx.set_user_nonblock(user_nonblock);
                return 0;
            }
        }
    }
    unsafe { libc::ioctl(fd, request as _, arg) }
}

/// # Safety
///
/// As for `getsockopt(2)`.
pub unsafe fn getsockopt(
    fd: RawFd,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut socklen_t,
) -> c_int {
    unsafe { libc::getsockopt(fd, level, optname, optval, optlen) }
}

/// `setsockopt`; `SO_RCVTIMEO`/`SO_SNDTIMEO` are also recorded for the
/// hooked calls (a zero timeval means no timeout).
///
/// # Safety
///
/// `optval` must point to `optlen` readable bytes, as for `setsockopt(2)`.
pub unsafe fn setsockopt(
    fd: RawFd,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    if gvfiber_runtime::is_hook_enabled()
        && level == libc::SOL_SOCKET
        && optlen as usize >= std::mem::size_of::<libc::timeval>()
        && !optval.is_null()
    {
        if let Some(kind) = TimeoutKind::from_optname(optname) {
            if let Some(ctx) = FdManager::global().get(fd, false) {
                let tv = unsafe { &*(optval as *const libc::timeval) };
                let Some(ms) = timeval_ms(tv) else {
                    set_errno(libc::EINVAL);
                    return -1;
                };
                ctx.set_timeout(kind, (ms != 0).then_some(ms));
            }
        }
    }
    unsafe { libc::setsockopt(fd, level, optname, optval, optlen) }
}

/// Convenience over [`setsockopt`] for the two timeout options.
pub fn set_io_timeout(fd: RawFd, kind: TimeoutKind, ms: Option<u64>) -> c_int {
    let ms = ms.unwrap_or(0);
    let tv = libc::timeval {
        tv_sec: (ms / 1000) as libc::time_t,
        tv_usec: ((ms % 1000) * 1000) as libc::suseconds_t,
    };
    let optname = match kind {
        TimeoutKind::Recv => libc::SO_RCVTIMEO,
        TimeoutKind::Send => libc::SO_SNDTIMEO,
    };
    // Safety: `tv` is a live timeval of the advertised size.
    unsafe {
        setsockopt(
            fd,
            libc::SOL_SOCKET,
            optname,
            (&tv as *const libc::timeval).cast(),
            std::mem::size_of::<libc::timeval>() as socklen_t,
        )
    }
}

fn iov_count(n: usize) -> c_int {
    n.min(libc::c_int::MAX as usize) as c_int
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_info_first_cancel_wins() {
        let info = TimerInfo::default();
        assert_eq!(info.cancelled(), None);
        assert!(info.cancel_with(libc::ETIMEDOUT));
        assert!(!info.cancel_with(libc::ECANCELED));
        assert_eq!(info.cancelled(), Some(libc::ETIMEDOUT));
    }

    #[test]
    fn test_unhooked_thread_passes_through() {
        assert!(!gvfiber_runtime::is_hook_enabled());
        assert!(reactor().is_none());
        assert_eq!(usleep(1_000), 0);

        let mut fds = [0 as c_int; 2];
        // Safety: test-local pipe.
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        assert_eq!(write(fds[1], b"hi"), 2);
        let mut buf = [0u8; 8];
        assert_eq!(read(fds[0], &mut buf), 2);
        assert_eq!(&buf[..2], b"hi");
        assert_eq!(close(fds[0]), 0);
        assert_eq!(close(fds[1]), 0);
    }

    #[test]
    fn test_nanosleep_rejects_bad_request() {
        let req = libc::timespec {
            tv_sec: 0,
            tv_nsec: 2_000_000_000,
        };
        let rc = unsafe { nanosleep(&req, std::ptr::null_mut()) };
        assert_eq!(rc, -1);
        assert_eq!(Errno::last(), Errno::EINVAL);
    }

    #[test]
    fn test_connect_timeout_follows_config() {
        let var = tcp_connect_timeout();
        let before = var.get();
        var.set(1234);
        assert_eq!(connect_timeout(), Some(1234));
        var.set(0);
        assert_eq!(connect_timeout(), None);
        var.set(before);
    }

    #[test]
    fn test_huge_durations_saturate() {
        let ts = libc::timespec {
            tv_sec: libc::time_t::MAX,
            tv_nsec: 999_999_999,
        };
        assert_eq!(timespec_ms(&ts), u64::MAX);
        let ts = libc::timespec {
            tv_sec: 2,
            tv_nsec: 5_000_000,
        };
        assert_eq!(timespec_ms(&ts), 2005);

        let tv = libc::timeval {
            tv_sec: libc::time_t::MAX,
            tv_usec: 999_999,
        };
        assert_eq!(timeval_ms(&tv), Some(u64::MAX));
        let tv = libc::timeval {
            tv_sec: 1,
            tv_usec: 500_000,
        };
        assert_eq!(timeval_ms(&tv), Some(1500));
        let tv = libc::timeval {
            tv_sec: -1,
            tv_usec: 0,
        };
        assert_eq!(timeval_ms(&tv), None);
        let tv = libc::timeval {
            tv_sec: 0,
            tv_usec: -1,
        };
        assert_eq!(timeval_ms(&tv), None);
    }

    #[test]
    fn test_setsockopt_rejects_negative_timeout() {
        let sock = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let fd = std::os::fd::AsRawFd::as_raw_fd(&sock);
        gvfiber_runtime::set_hook_enabled(true);
        let ctx = FdManager::global().get(fd, true).unwrap();
        let set = |tv: libc::timeval| unsafe {
            setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                (&tv as *const libc::timeval).cast(),
                std::mem::size_of::<libc::timeval>() as socklen_t,
            )
        };

        let rc = set(libc::timeval {
            tv_sec: -5,
            tv_usec: 0,
        });
        assert_eq!(rc, -1);
        assert_eq!(Errno::last(), Errno::EINVAL);
        assert_eq!(ctx.timeout(TimeoutKind::Recv), None);

        let rc = set(libc::timeval {
            tv_sec: 1,
            tv_usec: 250_000,
        });
        assert_eq!(rc, 0);
        assert_eq!(ctx.timeout(TimeoutKind::Recv), Some(1250));

        gvfiber_runtime::set_hook_enabled(false);
        FdManager::global().del(fd);
    }

    #[test]
    fn test_timeout_fired_before_arming_still_wakes() {
        let iom = IoManager::new(1, false, "t-early-timeout").unwrap();
        let mut fds = [0 as c_int; 2];
        // Safety: test-local pipe.
        assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) }, 0);
        let rfd = fds[0];
        let got = Arc::new(AtomicI32::new(-1));

        let g = got.clone();
        iom.schedule_fn(move || {
            let Some(iom) = IoManager::current() else {
                return;
            };
            // The timer already fired, so nothing else will cancel the read.
            let info = TimerInfo::default();
            info.cancel_with(libc::ETIMEDOUT);
            let res = park_on(&iom, rfd, Event::READ, &info, "read");
            g.store(res.unwrap_or(0), Ordering::SeqCst);
        });
        iom.stop().unwrap();

        assert_eq!(got.load(Ordering::SeqCst), libc::ETIMEDOUT);
        assert_eq!(iom.pending_event_count(), 0);
        assert_eq!(close(fds[0]), 0);
        assert_eq!(close(fds[1]), 0);
    }
}
