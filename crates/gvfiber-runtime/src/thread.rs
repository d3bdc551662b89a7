//! OS thread abstraction
//!
//! Workers are spawned through `Thread`, which records the kernel thread id
//! (used for scheduling affinity) before `spawn` returns.

use gvfiber_core::error::{RtResult, RuntimeError};
use std::cell::Cell;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

/// Kernel thread id, the unit of scheduling affinity
pub type Tid = libc::pid_t;

thread_local! {
    static TID: Cell<Tid> = const { Cell::new(0) };
}

/// Kernel thread id of the calling thread (cached)
#[inline]
pub fn current_tid() -> Tid {
    TID.with(|cell| {
        if cell.get() == 0 {
            // Safety: gettid has no preconditions and cannot fail.
            cell.set(unsafe { libc::syscall(libc::SYS_gettid) } as Tid);
        }
        cell.get()
    })
}

/// Name of the calling thread
pub fn current_name() -> String {
    thread::current().name().unwrap_or("<unnamed>").to_string()
}

/// A named OS thread
pub struct Thread {
    name: String,
    tid: Tid,
    handle: Option<JoinHandle<()>>,
}

impl Thread {
    /// Spawn `f` on a new thread named `name`.
    ///
    /// Returns once the thread is running and its tid is known.
    pub fn spawn<F>(name: impl Into<String>, f: F) -> RtResult<Thread>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let (tx, rx) = mpsc::sync_channel(1);

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let _ = tx.send(current_tid());
                drop(tx);
                f();
            })
            .map_err(|source| RuntimeError::Spawn {
                name: name.clone(),
                source,
            })?;

        let tid = rx
            .recv()
            .map_err(|_| RuntimeError::ThreadPanicked(name.clone()))?;
        tracing::debug!(thread = %name, tid, "thread started");

        Ok(Thread {
            name,
            tid,
            handle: Some(handle),
        })
    }

    #[inline]
    pub fn tid(&self) -> Tid {
        self.tid
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait until the thread's closure has returned.
    pub fn join(&mut self) -> RtResult<()> {
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| RuntimeError::ThreadPanicked(self.name.clone()))?;
            tracing::debug!(thread = %self.name, tid = self.tid, "thread joined");
        }
        Ok(())
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        if self.handle.is_some() {
            tracing::debug!(thread = %self.name, tid = self.tid, "thread detached");
        }
    }
}
