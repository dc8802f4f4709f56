//! Thread B lifecycle: spawn, cooperative stop, forced cancellation, join
//!
//! `std::thread` cannot be cancelled, and a race body is often stuck inside
//! a blocking syscall or a rendezvous the main thread will never reach
//! again (e.g. after an early `break` in thread A). The worker is therefore
//! a raw POSIX thread with asynchronous cancellation enabled, so it can be
//! torn down at any instruction boundary once the grace period runs out.
//!
//! The closure and its captures are handed to the new thread through the
//! `pthread_create` argument. Nothing is stored in process-wide state, so
//! any number of pairs may run at once.

use crate::error::{FzsyncError, Result};
use nix::errno::Errno;
use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// How long thread B gets to notice the exit flag before it is cancelled
pub const STOP_GRACE: Duration = Duration::from_millis(100);

const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// `PTHREAD_CANCELED` is `(void *)-1`
const CANCELED: usize = usize::MAX;

// Not bound by the libc crate for Linux targets; values are shared by glibc
// and musl.
#[cfg(target_os = "linux")]
mod cancel {
    use std::os::raw::c_int;

    pub const PTHREAD_CANCEL_ENABLE: c_int = 0;
    pub const PTHREAD_CANCEL_DISABLE: c_int = 1;
    pub const PTHREAD_CANCEL_ASYNCHRONOUS: c_int = 1;

    extern "C" {
        pub fn pthread_setcancelstate(state: c_int, oldstate: *mut c_int) -> c_int;
        pub fn pthread_setcanceltype(kind: c_int, oldtype: *mut c_int) -> c_int;
    }
}

type Body = Box<dyn FnOnce() + Send + 'static>;
type StartRoutine = extern "C" fn(*mut c_void) -> *mut c_void;

struct Start {
    body: Body,
    finished: Arc<AtomicBool>,
}

/// How the worker thread ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The body returned
    Finished,
    /// The thread was cancelled by [`Worker::force_stop`]
    Cancelled,
}

// "C-unwind" so the forced unwind started by pthread_cancel may pass
// through this frame. A Rust panic still cannot leave the thread: there is
// no Rust frame above us to catch it, so a panicking body aborts the process.
extern "C-unwind" fn trampoline(arg: *mut c_void) -> *mut c_void {
    // SAFETY: `arg` is the `Box<Start>` leaked by `Worker::spawn` and this is
    // the only place it is reclaimed.
    let start = unsafe { Box::from_raw(arg.cast::<Start>()) };
    let Start { body, finished } = *start;

    // SAFETY: both calls only change the calling thread's cancel settings.
    unsafe {
        cancel::pthread_setcanceltype(cancel::PTHREAD_CANCEL_ASYNCHRONOUS, ptr::null_mut());
        cancel::pthread_setcancelstate(cancel::PTHREAD_CANCEL_ENABLE, ptr::null_mut());
    }

    body();

    // SAFETY: as above.
    unsafe {
        cancel::pthread_setcancelstate(cancel::PTHREAD_CANCEL_DISABLE, ptr::null_mut());
    }
    finished.store(true, Ordering::SeqCst);

    ptr::null_mut()
}

/// Owned handle to thread B
#[derive(Debug)]
pub struct Worker {
    thread: libc::pthread_t,
    finished: Arc<AtomicBool>,
    joined: bool,
}

impl Worker {
    /// Spawn a thread running `body` with asynchronous cancellation enabled
    ///
    /// # Safety
    ///
    /// `body` may be cancelled at any instruction boundary by
    /// [`force_stop`](Self::force_stop). It must not hold locks, file
    /// descriptors or any other resource whose release matters, and it must
    /// tolerate its destructors never running. A panic in `body` aborts the
    /// process.
    pub unsafe fn spawn<F>(body: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let finished = Arc::new(AtomicBool::new(false));
        let start = Box::into_raw(Box::new(Start {
            body: Box::new(body),
            finished: finished.clone(),
        }));

        // SAFETY: pthread_t is a plain integer or pointer; zeroed is a valid
        // placeholder until pthread_create fills it in.
        let mut thread: libc::pthread_t = unsafe { std::mem::zeroed() };
        // SAFETY: "C" and "C-unwind" share a calling convention; they only
        // differ in whether unwinding out of the callee is permitted.
        let routine: StartRoutine = unsafe {
            std::mem::transmute::<extern "C-unwind" fn(*mut c_void) -> *mut c_void, StartRoutine>(
                trampoline,
            )
        };
        // SAFETY: `thread` is a valid out pointer, default attributes are
        // requested, and ownership of `start` passes to the trampoline.
        let rc = unsafe { libc::pthread_create(&mut thread, ptr::null(), routine, start.cast()) };

        if rc != 0 {
            // SAFETY: the thread was not created, so `start` is still ours.
            drop(unsafe { Box::from_raw(start) });
            return Err(FzsyncError::Spawn(Errno::from_raw(rc)));
        }

        tracing::debug!("Spawned thread B");
        Ok(Self {
            thread,
            finished,
            joined: false,
        })
    }

    /// The body has returned
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Poll until the body finishes or `grace` elapses
    pub fn wait_finished(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        while !self.is_finished() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(POLL_INTERVAL);
        }
        true
    }

    /// Request asynchronous cancellation
    ///
    /// Cancelling a thread that already finished is harmless.
    pub fn force_stop(&self) -> Result<()> {
        // SAFETY: `self.thread` refers to a thread that has not been joined
        // or detached yet, so the id is still valid.
        let rc = unsafe { libc::pthread_cancel(self.thread) };
        match rc {
            0 => Ok(()),
            rc if rc == libc::ESRCH => Ok(()),
            rc => Err(FzsyncError::Cancel(Errno::from_raw(rc))),
        }
    }

    /// Wait for the thread to terminate
    pub fn join(mut self) -> Result<WorkerExit> {
        let mut retval: *mut c_void = ptr::null_mut();
        // SAFETY: the thread has not been joined or detached; `joined` is
        // set regardless of the outcome so Drop will not touch it again.
        let rc = unsafe { libc::pthread_join(self.thread, &mut retval) };
        self.joined = true;

        if rc != 0 {
            return Err(FzsyncError::Join(Errno::from_raw(rc)));
        }

        Ok(if retval as usize == CANCELED {
            WorkerExit::Cancelled
        } else {
            WorkerExit::Finished
        })
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if !self.joined {
            // SAFETY: never joined or detached, so the id is still valid.
            unsafe {
                libc::pthread_detach(self.thread);
            }
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_body_runs_and_finishes() {
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_b = ran.clone();

        // SAFETY: the body only touches an atomic.
        let worker = unsafe {
            Worker::spawn(move || {
                ran_b.fetch_add(1, Ordering::SeqCst);
            })
        }
        .unwrap();

        assert!(worker.wait_finished(Duration::from_secs(5)));
        assert_eq!(worker.join().unwrap(), WorkerExit::Finished);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_spinning_body_is_cancelled() {
        let spinning = Arc::new(AtomicBool::new(false));
        let spinning_b = spinning.clone();

        // SAFETY: the body spins on atomics and holds nothing else.
        let worker = unsafe {
            Worker::spawn(move || {
                spinning_b.store(true, Ordering::SeqCst);
                loop {
                    std::hint::spin_loop();
                }
            })
        }
        .unwrap();

        while !spinning.load(Ordering::SeqCst) {
            thread::yield_now();
        }
        assert!(!worker.wait_finished(Duration::from_millis(20)));

        worker.force_stop().unwrap();
        assert_eq!(worker.join().unwrap(), WorkerExit::Cancelled);
    }

    #[test]
    fn test_body_runs_with_async_cancellation_enabled() {
        use std::os::raw::c_int;
        use std::sync::atomic::AtomicI32;

        let kind = Arc::new(AtomicI32::new(-1));
        let state = Arc::new(AtomicI32::new(-1));
        let (kind_b, state_b) = (kind.clone(), state.clone());

        // SAFETY: the body only queries its own cancel settings.
        let worker = unsafe {
            Worker::spawn(move || {
                let mut old: c_int = -1;
                // Re-applying the expected setting reports the current one
                cancel::pthread_setcanceltype(cancel::PTHREAD_CANCEL_ASYNCHRONOUS, &mut old);
                kind_b.store(old, Ordering::SeqCst);
                cancel::pthread_setcancelstate(cancel::PTHREAD_CANCEL_ENABLE, &mut old);
                state_b.store(old, Ordering::SeqCst);
            })
        }
        .unwrap();

        assert_eq!(worker.join().unwrap(), WorkerExit::Finished);
        assert_eq!(kind.load(Ordering::SeqCst), cancel::PTHREAD_CANCEL_ASYNCHRONOUS);
        assert_eq!(state.load(Ordering::SeqCst), cancel::PTHREAD_CANCEL_ENABLE);
    }

    #[test]
    fn test_force_stop_after_finish_is_harmless() {
        // SAFETY: empty body.
        let worker = unsafe { Worker::spawn(|| {}) }.unwrap();
        assert!(worker.wait_finished(Duration::from_secs(5)));

        worker.force_stop().unwrap();
        assert_eq!(worker.join().unwrap(), WorkerExit::Finished);
    }

    #[test]
    fn test_dropping_unjoined_worker_detaches() {
        // SAFETY: empty body.
        let worker = unsafe { Worker::spawn(|| {}) }.unwrap();
        drop(worker);
    }
}
