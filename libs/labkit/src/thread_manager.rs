//! Named worker threads for threaded modules.
//!
//! Each worker owns an inbox (`crossbeam_channel`) of commands. `invoke_blocking`
//! sends a closure together with a one-slot reply channel and blocks on the reply,
//! which gives the caller a consistent before/after view of the transition it asked for.
//! Threads are never reused: a name maps to one worker for the whole life of that worker.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::contracts::panic_message;

/// Default time `join_thread` waits for a worker to finish.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Command {
    Run(Job),
    Quit,
}

#[derive(Debug, thiserror::Error)]
pub enum ThreadError {
    #[error("thread '{name}' already exists")]
    AlreadyExists { name: String },
    #[error("thread '{name}' is not managed")]
    Unknown { name: String },
    #[error("failed to spawn thread '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("thread '{name}' has stopped and cannot run more work")]
    Stopped { name: String },
    #[error("work scheduled on thread '{name}' panicked: {message}")]
    Panicked { name: String, message: String },
    #[error("thread '{name}' did not terminate within {timeout:?}")]
    JoinTimeout { name: String, timeout: Duration },
}

/// Cheap cloneable reference to a managed worker.
#[derive(Clone)]
pub struct ThreadHandle {
    name: Arc<str>,
    inbox: Sender<Command>,
    thread_id: ThreadId,
}

impl ThreadHandle {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadHandle")
            .field("name", &self.name)
            .field("thread_id", &self.thread_id)
            .finish_non_exhaustive()
    }
}

struct Worker {
    handle: ThreadHandle,
    done: Receiver<()>,
    join: JoinHandle<()>,
}

/// Creates, tracks and shuts down named worker threads.
#[derive(Default)]
pub struct ThreadManager {
    workers: Mutex<IndexMap<String, Worker>>,
}

impl ThreadManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a named worker.
    ///
    /// # Errors
    /// Returns `ThreadError::AlreadyExists` if the name is taken, `ThreadError::Spawn` if
    /// the OS refuses to create the thread.
    pub fn get_new_thread(&self, name: &str) -> Result<ThreadHandle, ThreadError> {
        let mut workers = self.workers.lock();
        if workers.contains_key(name) {
            return Err(ThreadError::AlreadyExists {
                name: name.to_owned(),
            });
        }

        let (inbox, commands) = unbounded::<Command>();
        let (done_tx, done) = bounded::<()>(0);
        let join = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                // dropped on exit, which is what join_thread waits for
                let _done = done_tx;
                for command in commands {
                    match command {
                        Command::Run(job) => job(),
                        Command::Quit => break,
                    }
                }
            })
            .map_err(|source| ThreadError::Spawn {
                name: name.to_owned(),
                source,
            })?;

        let handle = ThreadHandle {
            name: Arc::from(name),
            inbox,
            thread_id: join.thread().id(),
        };
        workers.insert(
            name.to_owned(),
            Worker {
                handle: handle.clone(),
                done,
                join,
            },
        );
        tracing::debug!(thread = %name, "Worker thread started");
        Ok(handle)
    }

    /// Run `f` on the worker and block until it returns.
    ///
    /// Runs inline when called from the worker itself.
    ///
    /// # Errors
    /// Returns `ThreadError::Unknown` if the handle is no longer managed,
    /// `ThreadError::Stopped` if the worker has exited, and `ThreadError::Panicked`
    /// if `f` panicked.
    pub fn invoke_blocking<R, F>(&self, handle: &ThreadHandle, f: F) -> Result<R, ThreadError>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        if !self.workers.lock().contains_key(handle.name()) {
            return Err(ThreadError::Unknown {
                name: handle.name().to_owned(),
            });
        }

        if thread::current().id() == handle.thread_id {
            return catch_unwind(AssertUnwindSafe(f)).map_err(|payload| ThreadError::Panicked {
                name: handle.name().to_owned(),
                message: panic_message(payload.as_ref()),
            });
        }

        let (reply_tx, reply_rx) = bounded(1);
        let job: Job = Box::new(move || {
            let outcome = catch_unwind(AssertUnwindSafe(f));
            // the caller may have given up; nothing to do then
            if reply_tx.send(outcome).is_err() {
                tracing::trace!("invoke_blocking caller went away");
            }
        });

        let stopped = || ThreadError::Stopped {
            name: handle.name().to_owned(),
        };
        handle.inbox.send(Command::Run(job)).map_err(|_| stopped())?;
        match reply_rx.recv().map_err(|_| stopped())? {
            Ok(value) => Ok(value),
            Err(payload) => Err(ThreadError::Panicked {
                name: handle.name().to_owned(),
                message: panic_message(payload.as_ref()),
            }),
        }
    }

    /// Ask a worker to exit after the work already queued.
    ///
    /// # Errors
    /// Returns `ThreadError::Unknown` if no such worker is managed.
    pub fn quit_thread(&self, name: &str) -> Result<(), ThreadError> {
        let workers = self.workers.lock();
        let worker = workers.get(name).ok_or_else(|| ThreadError::Unknown {
            name: name.to_owned(),
        })?;
        if worker.handle.inbox.send(Command::Quit).is_err() {
            tracing::debug!(thread = %name, "Worker already exited");
        }
        Ok(())
    }

    /// Wait up to `timeout` for a worker to exit. The worker is removed from
    /// bookkeeping in every case; a timeout leaks the OS thread and is reported.
    ///
    /// # Errors
    /// Returns `ThreadError::Unknown` if no such worker is managed,
    /// `ThreadError::JoinTimeout` if it did not exit in time.
    pub fn join_thread(&self, name: &str, timeout: Duration) -> Result<(), ThreadError> {
        let worker = self
            .workers
            .lock()
            .shift_remove(name)
            .ok_or_else(|| ThreadError::Unknown {
                name: name.to_owned(),
            })?;

        match worker.done.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    thread = %name,
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "Thread did not terminate in time; dropping it from bookkeeping"
                );
                Err(ThreadError::JoinTimeout {
                    name: name.to_owned(),
                    timeout,
                })
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.join.join().is_err() {
                    tracing::warn!(thread = %name, "Worker thread panicked while exiting");
                }
                tracing::debug!(thread = %name, "Worker thread joined");
                Ok(())
            }
        }
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.workers.lock().contains_key(name)
    }

    /// Names of all managed workers, in creation order.
    #[must_use]
    pub fn thread_names(&self) -> Vec<String> {
        self.workers.lock().keys().cloned().collect()
    }

    /// Quit and join every worker. Failures are logged and returned.
    pub fn quit_all(&self, timeout: Duration) -> Vec<ThreadError> {
        let names = self.thread_names();
        let mut errors = Vec::new();
        for name in &names {
            if let Err(e) = self.quit_thread(name) {
                errors.push(e);
            }
        }
        for name in &names {
            if let Err(e) = self.join_thread(name, timeout) {
                tracing::warn!(thread = %name, error = %e, "Failed to join worker thread");
                errors.push(e);
            }
        }
        errors
    }
}

impl Drop for ThreadManager {
    fn drop(&mut self) {
        for worker in self.workers.get_mut().values() {
            if worker.handle.inbox.send(Command::Quit).is_err() {
                tracing::trace!(thread = %worker.handle.name(), "Worker already exited");
            }
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tracing_test::traced_test;

    #[test]
    fn runs_work_on_the_named_thread() {
        let tm = ThreadManager::new();
        let handle = tm.get_new_thread("mod-hardware-counter").unwrap();

        let name = tm
            .invoke_blocking(&handle, || thread::current().name().map(str::to_owned))
            .unwrap();
        assert_eq!(name.as_deref(), Some("mod-hardware-counter"));

        tm.quit_thread("mod-hardware-counter").unwrap();
        tm.join_thread("mod-hardware-counter", DEFAULT_JOIN_TIMEOUT)
            .unwrap();
        assert!(tm.thread_names().is_empty());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let tm = ThreadManager::new();
        tm.get_new_thread("w").unwrap();
        assert!(matches!(
            tm.get_new_thread("w"),
            Err(ThreadError::AlreadyExists { .. })
        ));
        assert!(tm.quit_all(DEFAULT_JOIN_TIMEOUT).is_empty());
    }

    #[test]
    fn panics_are_reported_and_worker_survives() {
        let tm = ThreadManager::new();
        let handle = tm.get_new_thread("w").unwrap();

        let err = tm
            .invoke_blocking(&handle, || -> () { panic!("boom") })
            .unwrap_err();
        assert!(matches!(err, ThreadError::Panicked { ref message, .. } if message == "boom"));

        assert_eq!(tm.invoke_blocking(&handle, || 41 + 1).unwrap(), 42);
        assert!(tm.quit_all(DEFAULT_JOIN_TIMEOUT).is_empty());
    }

    #[test]
    fn nested_invoke_from_worker_runs_inline() {
        let tm = Arc::new(ThreadManager::new());
        let handle = tm.get_new_thread("w").unwrap();

        let inner_tm = Arc::clone(&tm);
        let inner_handle = handle.clone();
        let value = tm
            .invoke_blocking(&handle, move || {
                inner_tm.invoke_blocking(&inner_handle, || 7).unwrap()
            })
            .unwrap();
        assert_eq!(value, 7);
        assert!(tm.quit_all(DEFAULT_JOIN_TIMEOUT).is_empty());
    }

    #[test]
    #[traced_test]
    fn join_timeout_is_logged_and_handle_is_dropped() {
        let tm = ThreadManager::new();
        let handle = tm.get_new_thread("stuck").unwrap();
        let release = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&release);
        handle
            .inbox
            .send(Command::Run(Box::new(move || {
                while !flag.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(5));
                }
            })))
            .unwrap();

        tm.quit_thread("stuck").unwrap();
        let err = tm
            .join_thread("stuck", Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, ThreadError::JoinTimeout { .. }));
        assert!(!tm.contains("stuck"));
        assert!(logs_contain("did not terminate in time"));

        release.store(true, Ordering::SeqCst);
    }

    #[test]
    fn invoking_on_a_forgotten_handle_fails() {
        let tm = ThreadManager::new();
        let handle = tm.get_new_thread("w").unwrap();
        tm.quit_thread("w").unwrap();
        tm.join_thread("w", DEFAULT_JOIN_TIMEOUT).unwrap();

        assert!(matches!(
            tm.invoke_blocking(&handle, || ()),
            Err(ThreadError::Unknown { .. })
        ));
        assert!(matches!(
            tm.quit_thread("w"),
            Err(ThreadError::Unknown { .. })
        ));
    }
}
