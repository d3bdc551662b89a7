//! gvfiber Echo Server
//!
//! TCP echo server with one fiber per connection. Reads and writes look
//! blocking but park the fiber on the reactor.
//!
//! Usage:
//!     cargo build --release -p gvfiber-echo
//!     GVF_THREADS=4 ./target/release/gvfiber-echo [port] [idle_timeout_ms]
//!
//! Test with:
//!     echo "hello" | nc localhost 9999

use gvfiber::{FiberTcpListener, FiberTcpStream, Runtime, RuntimeConfig};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::Duration;

const DEFAULT_PORT: u16 = 9999;
const BUF_SIZE: usize = 4096;

fn serve(mut conn: FiberTcpStream, peer: SocketAddr, idle: Option<Duration>) {
    if let Err(e) = conn.set_read_timeout(idle) {
        tracing::warn!(%peer, error = %e, "set_read_timeout failed");
    }
    let mut buf = [0u8; BUF_SIZE];
    let mut total = 0usize;
    loop {
        match conn.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = conn.write_all(&buf[..n]) {
                    tracing::debug!(%peer, error = %e, "write failed");
                    break;
                }
                total += n;
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                tracing::info!(%peer, "idle timeout");
                break;
            }
            Err(e) => {
                tracing::debug!(%peer, error = %e, "read failed");
                break;
            }
        }
    }
    tracing::info!(%peer, bytes = total, "connection closed");
}

fn accept_loop(port: u16, idle: Option<Duration>) {
    let listener = match FiberTcpListener::bind(("0.0.0.0", port)) {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(port, error = %e, "bind failed");
            return;
        }
    };
    tracing::info!(addr = ?listener.local_addr().ok(), "listening");
    loop {
        match listener.accept() {
            Ok((conn, peer)) => {
                tracing::debug!(%peer, "accepted");
                if let Err(e) = gvfiber::spawn(move || serve(conn, peer, idle)) {
                    tracing::error!(error = %e, "spawn failed");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                gvfiber::sleep(Duration::from_millis(10));
            }
        }
    }
}

fn main() -> gvfiber::RtResult<()> {
    gvfiber::init_logging();

    let mut args = std::env::args().skip(1);
    let port = args.next().and_then(|s| s.parse().ok()).unwrap_or(DEFAULT_PORT);
    let idle = args
        .next()
        .and_then(|s| s.parse::<u64>().ok())
        .filter(|&ms| ms > 0)
        .map(Duration::from_millis);

    let runtime = Runtime::new(RuntimeConfig::from_env().name("echo"))?;
    runtime.spawn(move || accept_loop(port, idle));
    // The accept loop never finishes; shutdown blocks until the process is killed.
    runtime.shutdown()
}
