//! End-to-end behaviour of hooked calls on a live IoManager

use gvfiber_hook::syscall;
use gvfiber_hook::{FiberTcpListener, FiberTcpStream, TimeoutKind};
use gvfiber_runtime::IoManager;
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, IntoRawFd};
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[test]
fn sleeping_fibers_share_one_thread() {
    init_tracing();
    let iom = IoManager::new(1, false, "sleepers").unwrap();
    let start = Instant::now();
    let done: Arc<Mutex<Vec<(&'static str, Duration)>>> = Arc::default();

    for name in ["a", "b"] {
        let done = done.clone();
        iom.schedule_fn(move || {
            assert_eq!(syscall::sleep(1), 0);
            done.lock().push((name, start.elapsed()));
        });
    }
    let d = done.clone();
    iom.schedule_fn(move || d.lock().push(("quick", start.elapsed())));

    iom.stop().unwrap();
    let total = start.elapsed();
    let done = done.lock();
    assert_eq!(done.len(), 3);
    // The quick task ran while both sleepers were parked.
    assert_eq!(done[0].0, "quick");
    assert!(done[0].1 < Duration::from_millis(500));
    for (_, at) in &done[1..] {
        assert!(*at >= Duration::from_millis(1000));
    }
    assert!(total < Duration::from_millis(1800), "sleeps did not overlap: {total:?}");
}

#[test]
fn nanosleep_and_usleep_park_the_fiber() {
    init_tracing();
    let iom = IoManager::new(1, false, "nap").unwrap();
    let start = Instant::now();
    let hits = Arc::new(AtomicUsize::new(0));

    let h = hits.clone();
    iom.schedule_fn(move || {
        let req = libc::timespec {
            tv_sec: 0,
            tv_nsec: 200_000_000,
        };
        // Safety: no remainder requested.
        assert_eq!(unsafe { syscall::nanosleep(&req, std::ptr::null_mut()) }, 0);
        h.fetch_add(1, Ordering::SeqCst);
    });
    let h = hits.clone();
    iom.schedule_fn(move || {
        assert_eq!(syscall::usleep(200_000), 0);
        h.fetch_add(1, Ordering::SeqCst);
    });

    iom.stop().unwrap();
    let elapsed = start.elapsed();
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_millis(380), "naps did not overlap: {elapsed:?}");
}

#[test]
fn recv_timeout_reports_etimedout() {
    init_tracing();
    // Nobody ever writes to the accepted side.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let iom = IoManager::new(1, false, "recv-timeout").unwrap();
    let outcome: Arc<Mutex<Option<(io::Result<usize>, Duration)>>> = Arc::default();

    let out = outcome.clone();
    iom.schedule_fn(move || {
        let mut stream = FiberTcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
        let mut buf = [0u8; 16];
        let start = Instant::now();
        let res = stream.read(&mut buf);
        *out.lock() = Some((res, start.elapsed()));
    });

    iom.stop().unwrap();
    let (res, elapsed) = outcome.lock().take().expect("reader never finished");
    let err = res.unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::ETIMEDOUT));
    assert!(elapsed >= Duration::from_millis(100), "woke early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1000), "woke late: {elapsed:?}");
    assert_eq!(iom.pending_event_count(), 0);
    assert!(iom.timers().is_empty());
    drop(listener);
}

#[test]
fn connect_succeeds_and_refused_is_reported() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let open = listener.local_addr().unwrap();
    let closed = {
        let tmp = TcpListener::bind("127.0.0.1:0").unwrap();
        tmp.local_addr().unwrap()
    };

    let iom = IoManager::new(2, false, "connect").unwrap();
    let results: Arc<Mutex<Vec<(SocketAddr, io::Result<SocketAddr>)>>> = Arc::default();
    for addr in [open, closed] {
        let results = results.clone();
        iom.schedule_fn(move || {
            let res = FiberTcpStream::connect(addr).and_then(|s| s.peer_addr());
            results.lock().push((addr, res));
        });
    }

    iom.stop().unwrap();
    let results = results.lock();
    assert_eq!(results.len(), 2);
    for (addr, res) in results.iter() {
        if *addr == open {
            assert_eq!(res.as_ref().unwrap(), &open);
        } else {
            let err = res.as_ref().unwrap_err();
            assert_eq!(err.raw_os_error(), Some(libc::ECONNREFUSED));
        }
    }
    assert_eq!(iom.pending_event_count(), 0);
}

#[test]
fn close_wakes_a_parked_reader() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let iom = IoManager::new(1, false, "close-wakes").unwrap();
    let fd = Arc::new(AtomicI32::new(-1));
    let result = Arc::new(AtomicI32::new(0));

    let (f, r) = (fd.clone(), result.clone());
    iom.schedule_fn(move || {
        let raw = FiberTcpStream::connect(addr).unwrap().into_raw_fd();
        f.store(raw, Ordering::SeqCst);
        let mut buf = [0u8; 8];
        if syscall::read(raw, &mut buf) == -1 {
            r.store(io::Error::last_os_error().raw_os_error().unwrap_or(0), Ordering::SeqCst);
        }
    });
    let f = fd.clone();
    iom.schedule_fn(move || {
        syscall::usleep(50_000);
        assert_eq!(syscall::close(f.load(Ordering::SeqCst)), 0);
    });

    iom.stop().unwrap();
    assert_eq!(result.load(Ordering::SeqCst), libc::EBADF);
    assert_eq!(iom.pending_event_count(), 0);
}

#[test]
fn fcntl_keeps_the_users_view_of_nonblock() {
    init_tracing();
    let iom = IoManager::new(1, false, "fcntl").unwrap();
    let checked = Arc::new(AtomicUsize::new(0));

    let c = checked.clone();
    iom.schedule_fn(move || {
        let fd = syscall::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0);
        assert!(fd >= 0);
        // Safety: F_GETFL on our own fd.
        let raw = || unsafe { libc::fcntl(fd, libc::F_GETFL) };

        assert_ne!(raw() & libc::O_NONBLOCK, 0);
        let flags = syscall::fcntl(fd, libc::F_GETFL, 0);
        assert_eq!(flags & libc::O_NONBLOCK, 0);

        assert_eq!(syscall::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK), 0);
        assert_ne!(syscall::fcntl(fd, libc::F_GETFL, 0) & libc::O_NONBLOCK, 0);

        assert_eq!(syscall::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK), 0);
        assert_eq!(syscall::fcntl(fd, libc::F_GETFL, 0) & libc::O_NONBLOCK, 0);
        assert_ne!(raw() & libc::O_NONBLOCK, 0);

        assert_eq!(syscall::set_io_timeout(fd, TimeoutKind::Send, Some(250)), 0);
        let ctx = gvfiber_hook::FdManager::global().get(fd, false).unwrap();
        assert_eq!(ctx.timeout(TimeoutKind::Send), Some(250));
        assert_eq!(ctx.timeout(TimeoutKind::Recv), None);

        assert_eq!(syscall::close(fd), 0);
        assert!(gvfiber_hook::FdManager::global().get(fd, false).is_none());
        c.fetch_add(1, Ordering::SeqCst);
    });

    iom.stop().unwrap();
    assert_eq!(checked.load(Ordering::SeqCst), 1);
}

#[test]
fn echo_round_trip_between_fibers() {
    init_tracing();
    let iom = IoManager::new(2, false, "echo").unwrap();
    let (addr_tx, addr_rx) = mpsc::channel();

    iom.schedule_fn(move || {
        let listener = FiberTcpListener::bind("127.0.0.1:0").unwrap();
        addr_tx.send(listener.local_addr().unwrap()).unwrap();
        let (mut conn, _) = listener.accept().unwrap();
        let mut buf = [0u8; 1024];
        loop {
            match conn.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => conn.write_all(&buf[..n]).unwrap(),
                Err(e) => panic!("echo read failed: {e}"),
            }
        }
    });
    let addr: SocketAddr = addr_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let echoed: Arc<Mutex<Vec<u8>>> = Arc::default();
    let out = echoed.clone();
    iom.schedule_fn(move || {
        let mut stream = FiberTcpStream::connect(addr).unwrap();
        assert!(stream.as_raw_fd() >= 0);
        let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
        let mut reply = vec![0u8; payload.len()];
        // Writes and reads interleave so neither side's buffer fills up.
        for (chunk, back) in payload.chunks(4096).zip(reply.chunks_mut(4096)) {
            stream.write_all(chunk).unwrap();
            stream.read_exact(back).unwrap();
        }
        stream.shutdown(std::net::Shutdown::Write).unwrap();
        assert_eq!(reply, payload);
        *out.lock() = reply;
    });

    iom.stop().unwrap();
    assert_eq!(echoed.lock().len(), 64 * 1024);
    assert_eq!(iom.pending_event_count(), 0);
}
