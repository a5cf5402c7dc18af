//! Backup progress and completion reporting.

use crate::error::CoreError;
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Outcome reported when a backup finishes.
pub type BackupResult = Result<String, Arc<CoreError>>;

/// Lifecycle of a backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupState {
    /// Created, worker not started yet.
    Idle,
    /// Worker is writing the archive.
    Running,
    /// Archive written successfully.
    Complete,
    /// Backup aborted; the partial archive was deleted.
    Failed,
}

/// Called exactly once when a backup finishes.
///
/// Implemented for any `FnOnce(&BackupMonitor) + Send` closure.
pub trait BackupCompletionHandler: Send {
    /// Receives the finished monitor.
    fn on_complete(self: Box<Self>, monitor: &BackupMonitor);
}

impl<F> BackupCompletionHandler for F
where
    F: FnOnce(&BackupMonitor) + Send,
{
    fn on_complete(self: Box<Self>, monitor: &BackupMonitor) {
        (*self)(monitor);
    }
}

struct MonitorState {
    state: BackupState,
    progress: u8,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    result: Option<BackupResult>,
    handlers: Vec<Box<dyn BackupCompletionHandler>>,
}

/// Tracks one backup run.
///
/// Progress is a percentage held at 99 or below until the archive is
/// finalized; only completion reports 100.
pub struct BackupMonitor {
    path: PathBuf,
    future_result: Option<String>,
    state: Mutex<MonitorState>,
    done: Condvar,
}

impl BackupMonitor {
    pub(crate) fn new(path: &Path, future_result: Option<String>) -> Self {
        Self {
            path: path.to_path_buf(),
            future_result,
            state: Mutex::new(MonitorState {
                state: BackupState::Idle,
                progress: 0,
                start_time: None,
                end_time: None,
                result: None,
                handlers: Vec::new(),
            }),
            done: Condvar::new(),
        }
    }

    /// Archive file being written.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> BackupState {
        self.state.lock().state
    }

    /// Approximate progress in percent.
    #[must_use]
    pub fn progress(&self) -> u8 {
        self.state.lock().progress
    }

    /// Returns true once the backup has succeeded or failed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        matches!(
            self.state(),
            BackupState::Complete | BackupState::Failed
        )
    }

    /// When the worker started.
    #[must_use]
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.state.lock().start_time
    }

    /// When the backup finished.
    #[must_use]
    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.state.lock().end_time
    }

    /// The error that aborted the backup, if any.
    #[must_use]
    pub fn error(&self) -> Option<Arc<CoreError>> {
        match &self.state.lock().result {
            Some(Err(e)) => Some(Arc::clone(e)),
            _ => None,
        }
    }

    /// Registers a completion handler.
    ///
    /// If the backup has already finished the handler runs immediately on
    /// the calling thread.
    pub fn on_complete<H: BackupCompletionHandler + 'static>(&self, handler: H) {
        let handler: Box<dyn BackupCompletionHandler> = Box::new(handler);
        {
            let mut state = self.state.lock();
            if state.result.is_none() {
                state.handlers.push(handler);
                return;
            }
        }
        handler.on_complete(self);
    }

    /// Returns a future that resolves when the backup finishes.
    #[must_use]
    pub fn future(self: &Arc<Self>) -> BackupFuture {
        BackupFuture {
            monitor: Arc::clone(self),
        }
    }

    pub(crate) fn begin(&self) {
        let mut state = self.state.lock();
        state.state = BackupState::Running;
        state.start_time = Some(Utc::now());
    }

    pub(crate) fn set_progress(&self, written: usize, total: usize) {
        let percent = if total == 0 {
            0
        } else {
            (written.saturating_mul(100) / total).min(99)
        };
        self.state.lock().progress = percent as u8;
    }

    /// Publishes the outcome, wakes waiters and runs the handlers.
    pub(crate) fn complete(&self, outcome: Result<(), CoreError>) {
        let handlers = {
            let mut state = self.state.lock();
            state.progress = 100;
            state.end_time = Some(Utc::now());
            state.result = Some(match outcome {
                Ok(()) => {
                    state.state = BackupState::Complete;
                    Ok(self
                        .future_result
                        .clone()
                        .unwrap_or_else(|| format!("100% => {}", self.path.display())))
                }
                Err(e) => {
                    state.state = BackupState::Failed;
                    Err(Arc::new(e))
                }
            });
            std::mem::take(&mut state.handlers)
        };
        self.done.notify_all();

        for handler in handlers {
            handler.on_complete(self);
        }
    }
}

impl fmt::Display for BackupMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}% => {}", self.progress(), self.path.display())
    }
}

impl fmt::Debug for BackupMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BackupMonitor")
            .field("path", &self.path)
            .field("state", &state.state)
            .field("progress", &state.progress)
            .finish()
    }
}

/// Completion signal of a backup.
#[derive(Debug, Clone)]
pub struct BackupFuture {
    monitor: Arc<BackupMonitor>,
}

impl BackupFuture {
    /// Blocks until the backup finishes.
    pub fn wait(&self) -> BackupResult {
        let mut state = self.monitor.state.lock();
        loop {
            if let Some(result) = &state.result {
                return result.clone();
            }
            self.monitor.done.wait(&mut state);
        }
    }

    /// Blocks for at most `timeout`; `None` if the backup is still running.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<BackupResult> {
        let deadline = Instant::now() + timeout;
        let mut state = self.monitor.state.lock();
        loop {
            if let Some(result) = &state.result {
                return Some(result.clone());
            }
            if self
                .monitor
                .done
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.result.clone();
            }
        }
    }

    /// Returns the outcome without blocking.
    #[must_use]
    pub fn try_result(&self) -> Option<BackupResult> {
        self.monitor.state.lock().result.clone()
    }

    /// The monitor this future belongs to.
    #[must_use]
    pub fn monitor(&self) -> &Arc<BackupMonitor> {
        &self.monitor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn monitor() -> Arc<BackupMonitor> {
        Arc::new(BackupMonitor::new(Path::new("/tmp/b.zst"), None))
    }

    #[test]
    fn progress_clamps_below_completion() {
        let m = monitor();
        m.set_progress(0, 0);
        assert_eq!(m.progress(), 0);
        m.set_progress(5, 10);
        assert_eq!(m.progress(), 50);
        m.set_progress(10, 10);
        assert_eq!(m.progress(), 99);
        assert_eq!(m.to_string(), "99% => /tmp/b.zst");

        m.complete(Ok(()));
        assert_eq!(m.progress(), 100);
        assert_eq!(m.state(), BackupState::Complete);
    }

    #[test]
    fn default_result_is_display_string() {
        let m = monitor();
        m.complete(Ok(()));
        assert_eq!(m.future().wait().unwrap(), "100% => /tmp/b.zst");
    }

    #[test]
    fn future_result_overrides_default() {
        let m = Arc::new(BackupMonitor::new(Path::new("x"), Some("done".into())));
        m.complete(Ok(()));
        assert_eq!(m.future().try_result().unwrap().unwrap(), "done");
    }

    #[test]
    fn failure_is_captured() {
        let m = monitor();
        m.complete(Err(CoreError::invalid_state("boom")));
        assert_eq!(m.state(), BackupState::Failed);
        assert!(m.is_complete());
        assert!(m.error().is_some());
        assert!(m.future().wait().is_err());
    }

    #[test]
    fn handlers_run_once_before_or_after_completion() {
        let m = monitor();
        let calls = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&calls);
        m.on_complete(move |_: &BackupMonitor| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        m.complete(Ok(()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let c = Arc::clone(&calls);
        m.on_complete(move |mon: &BackupMonitor| {
            assert!(mon.is_complete());
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn wait_wakes_on_completion() {
        let m = monitor();
        let future = m.future();
        assert!(future.wait_timeout(Duration::from_millis(10)).is_none());

        let worker = {
            let m = Arc::clone(&m);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                m.complete(Ok(()));
            })
        };
        assert!(future.wait().is_ok());
        worker.join().unwrap();
    }
}
