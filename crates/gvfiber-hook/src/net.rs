//! TCP types on top of the hooked syscalls
//!
//! Inside an `IoManager` fiber, `accept`, `read`, `write` and `connect`
//! park the fiber instead of the thread. Elsewhere they behave like their
//! `std::net` counterparts.

use crate::fd_manager::TimeoutKind;
use crate::syscall;
use std::io::{self, Read, Write};
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, SocketAddrV4, SocketAddrV6, ToSocketAddrs};
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};
use std::time::Duration;

const LISTEN_BACKLOG: libc::c_int = 128;

fn cvt(rc: libc::c_int) -> io::Result<libc::c_int> {
    if rc == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

fn cvt_size(n: libc::ssize_t) -> io::Result<usize> {
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn resolve(addr: impl ToSocketAddrs) -> io::Result<SocketAddr> {
    addr.to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no socket address"))
}

fn to_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // Safety: all-zero is a valid sockaddr_storage.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(a) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            // Safety: sockaddr_storage is larger than and aligned for sockaddr_in.
            unsafe { (&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr_in>().write(sin) };
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(a) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: a.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: a.ip().octets(),
                },
                sin6_scope_id: a.scope_id(),
            };
            // Safety: as above, for sockaddr_in6.
            unsafe { (&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr_in6>().write(sin6) };
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

fn from_sockaddr(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            // Safety: the family says this is a sockaddr_in.
            let sin = unsafe { &*(storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in>() };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            // Safety: the family says this is a sockaddr_in6.
            let sin6 = unsafe { &*(storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in6>() };
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => Err(io::Error::new(io::ErrorKind::InvalidInput, "unsupported address family")),
    }
}

fn sockname(fd: RawFd, peer: bool) -> io::Result<SocketAddr> {
    // Safety: all-zero is a valid sockaddr_storage; the kernel fills it in.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ptr = (&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr>();
    cvt(unsafe {
        if peer {
            libc::getpeername(fd, ptr, &mut len)
        } else {
            libc::getsockname(fd, ptr, &mut len)
        }
    })?;
    from_sockaddr(&storage)
}

fn new_socket(addr: &SocketAddr) -> io::Result<Socket> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = syscall::socket(domain, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0);
    cvt(fd).map(|fd| Socket { fd })
}

/// An fd closed through the hook layer
#[derive(Debug)]
struct Socket {
    fd: RawFd,
}

impl Drop for Socket {
    fn drop(&mut self) {
        if syscall::close(self.fd) == -1 {
            tracing::debug!(fd = self.fd, error = %io::Error::last_os_error(), "close failed");
        }
    }
}

/// A listening TCP socket whose `accept` parks the calling fiber
#[derive(Debug)]
pub struct FiberTcpListener {
    sock: Socket,
}

impl FiberTcpListener {
    pub fn bind(addr: impl ToSocketAddrs) -> io::Result<FiberTcpListener> {
        let addr = resolve(addr)?;
        let sock = new_socket(&addr)?;
        let one: libc::c_int = 1;
        // Safety: SO_REUSEADDR takes one c_int.
        cvt(unsafe {
            syscall::setsockopt(
                sock.fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                (&one as *const libc::c_int).cast(),
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        })?;
        let (storage, len) = to_sockaddr(&addr);
        // Safety: `storage` holds `len` bytes of a valid address.
        cvt(unsafe { libc::bind(sock.fd, (&storage as *const libc::sockaddr_storage).cast(), len) })?;
        cvt(unsafe { libc::listen(sock.fd, LISTEN_BACKLOG) })?;
        Ok(FiberTcpListener { sock })
    }

    pub fn accept(&self) -> io::Result<(FiberTcpStream, SocketAddr)> {
        // Safety: all-zero is a valid sockaddr_storage; accept fills it in.
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = cvt(unsafe {
            syscall::accept(
                self.sock.fd,
                (&mut storage as *mut libc::sockaddr_storage).cast(),
                &mut len,
            )
        })?;
        let stream = FiberTcpStream { sock: Socket { fd } };
        Ok((stream, from_sockaddr(&storage)?))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        sockname(self.sock.fd, false)
    }

    /// Bound `accept`; `None` waits forever.
    pub fn set_accept_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        set_timeout(self.sock.fd, TimeoutKind::Recv, timeout)
    }
}

impl AsRawFd for FiberTcpListener {
    fn as_raw_fd(&self) -> RawFd {
        self.sock.fd
    }
}

/// A connected TCP stream whose reads and writes park the calling fiber
#[derive(Debug)]
pub struct FiberTcpStream {
    sock: Socket,
}

impl FiberTcpStream {
    /// Connect, bounded by `tcp.connect.timeout`.
    pub fn connect(addr: impl ToSocketAddrs) -> io::Result<FiberTcpStream> {
        let addr = resolve(addr)?;
        let sock = new_socket(&addr)?;
        let (storage, len) = to_sockaddr(&addr);
        // Safety: `storage` holds `len` bytes of a valid address.
        cvt(unsafe { syscall::connect(sock.fd, (&storage as *const libc::sockaddr_storage).cast(), len) })?;
        Ok(FiberTcpStream { sock })
    }

    pub fn connect_timeout(addr: &SocketAddr, timeout: Duration) -> io::Result<FiberTcpStream> {
        let sock = new_socket(addr)?;
        let (storage, len) = to_sockaddr(addr);
        let ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        // Safety: as in `connect`.
        cvt(unsafe {
            syscall::connect_with_timeout(
                sock.fd,
                (&storage as *const libc::sockaddr_storage).cast(),
                len,
                Some(ms),
            )
        })?;
        Ok(FiberTcpStream { sock })
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        sockname(self.sock.fd, true)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        sockname(self.sock.fd, false)
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        set_timeout(self.sock.fd, TimeoutKind::Recv, timeout)
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        set_timeout(self.sock.fd, TimeoutKind::Send, timeout)
    }

    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        let how = match how {
            Shutdown::Read => libc::SHUT_RD,
            Shutdown::Write => libc::SHUT_WR,
            Shutdown::Both => libc::SHUT_RDWR,
        };
        // Safety: plain libc call on our own fd.
        cvt(unsafe { libc::shutdown(self.sock.fd, how) }).map(drop)
    }
}

impl Read for FiberTcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        cvt_size(syscall::read(self.sock.fd, buf))
    }

    fn read_vectored(&mut self, bufs: &mut [io::IoSliceMut<'_>]) -> io::Result<usize> {
        cvt_size(syscall::readv(self.sock.fd, bufs))
    }
}

impl Write for FiberTcpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        cvt_size(syscall::send(self.sock.fd, buf, libc::MSG_NOSIGNAL))
    }

    fn write_vectored(&mut self, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
        cvt_size(syscall::writev(self.sock.fd, bufs))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for FiberTcpStream {
    fn as_raw_fd(&self) -> RawFd {
        self.sock.fd
    }
}

impl IntoRawFd for FiberTcpStream {
    fn into_raw_fd(self) -> RawFd {
        let fd = self.sock.fd;
        mem::forget(self);
        fd
    }
}

fn set_timeout(fd: RawFd, kind: TimeoutKind, timeout: Option<Duration>) -> io::Result<()> {
    if timeout == Some(Duration::ZERO) {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "zero timeout"));
    }
    let ms = timeout.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX).max(1));
    cvt(syscall::set_io_timeout(fd, kind, ms)).map(drop)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sockaddr_conversion() {
        for text in ["127.0.0.1:8080", "[::1]:443", "10.1.2.3:0"] {
            let addr: SocketAddr = text.parse().unwrap();
            let (storage, len) = to_sockaddr(&addr);
            assert!(len as usize <= mem::size_of::<libc::sockaddr_storage>());
            assert_eq!(from_sockaddr(&storage).unwrap(), addr);
        }
    }

    #[test]
    fn test_blocking_round_trip_outside_reactor() {
        let listener = FiberTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::thread::spawn(move || {
            let mut s = FiberTcpStream::connect(addr).unwrap();
            s.write_all(b"ping").unwrap();
            let mut buf = [0u8; 4];
            s.read_exact(&mut buf).unwrap();
            buf
        });

        let (mut conn, peer) = listener.accept().unwrap();
        assert_eq!(peer.ip(), addr.ip());
        assert_eq!(conn.peer_addr().unwrap(), peer);
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        conn.write_all(b"pong").unwrap();
        assert_eq!(&client.join().unwrap(), b"pong");
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let listener = FiberTcpListener::bind("127.0.0.1:0").unwrap();
        let err = listener.set_accept_timeout(Some(Duration::ZERO)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        listener.set_accept_timeout(None).unwrap();
    }
}
