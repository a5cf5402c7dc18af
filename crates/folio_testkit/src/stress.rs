//! Concurrent load helpers.

use folio_core::{Blob, CoreError, Store};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Result of a load run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Operations rejected with `ConcurrentWrite`.
    pub conflicts: usize,
    /// Operations that failed for any other reason.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
}

impl StressTestResult {
    /// Operations per second.
    pub fn ops_per_second(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.total_ops as f64 / secs
        } else {
            0.0
        }
    }
}

/// Configuration for load runs.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Operations per thread.
    pub operations: usize,
    /// Number of threads.
    pub threads: usize,
    /// Payload size in bytes.
    pub blob_size: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 1_000,
            threads: 4,
            blob_size: 256,
        }
    }
}

/// Has every thread rewrite the same blob with an expected version.
///
/// Each thread reads the blob's version and writes with it; losers of the
/// race get `ConcurrentWrite`. Every successful write bumps the version by
/// exactly one.
pub fn stress_contended_writes(
    store: &Store,
    blob: &Arc<Blob>,
    config: &StressConfig,
) -> StressTestResult {
    let start = Instant::now();
    let counts = thread::scope(|scope| {
        let workers: Vec<_> = (0..config.threads)
            .map(|t| {
                scope.spawn(move || {
                    let data = vec![t as u8; config.blob_size];
                    let (mut ok, mut conflicts, mut failed) = (0usize, 0usize, 0usize);
                    for _ in 0..config.operations {
                        let version = blob.version();
                        match store.write(blob, None, Some(&data), Some(version)) {
                            Ok(()) => ok += 1,
                            Err(CoreError::ConcurrentWrite { .. }) => conflicts += 1,
                            Err(_) => failed += 1,
                        }
                    }
                    (ok, conflicts, failed)
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|w| w.join().expect("worker panicked"))
            .collect::<Vec<_>>()
    });
    summarize(&counts, start.elapsed())
}

/// Has every thread create, append to and delete its own blobs.
pub fn stress_independent_blobs(store: &Store, config: &StressConfig) -> StressTestResult {
    let start = Instant::now();
    let counts = thread::scope(|scope| {
        let workers: Vec<_> = (0..config.threads)
            .map(|t| {
                scope.spawn(move || {
                    let data = vec![t as u8; config.blob_size];
                    let (mut ok, mut failed) = (0usize, 0usize);
                    for i in 0..config.operations {
                        let result = store.create(&[t as u8], &data).and_then(|blob| {
                            store.append(&blob, None, &data)?;
                            if i % 2 == 0 {
                                store.delete(&blob)?;
                            }
                            Ok(())
                        });
                        match result {
                            Ok(()) => ok += 1,
                            Err(_) => failed += 1,
                        }
                    }
                    (ok, 0usize, failed)
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|w| w.join().expect("worker panicked"))
            .collect::<Vec<_>>()
    });
    summarize(&counts, start.elapsed())
}

fn summarize(counts: &[(usize, usize, usize)], duration: Duration) -> StressTestResult {
    let (ok, conflicts, failed) = counts
        .iter()
        .fold((0, 0, 0), |acc, c| (acc.0 + c.0, acc.1 + c.1, acc.2 + c.2));
    StressTestResult {
        total_ops: ok + conflicts + failed,
        successful_ops: ok,
        conflicts,
        failed_ops: failed,
        duration,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::TestStore;

    #[test]
    fn contended_writes_bump_version_once_per_success() {
        let store = TestStore::new();
        let blob = store.create(b"", b"seed").unwrap();
        let before = blob.version();
        let config = StressConfig {
            operations: 50,
            threads: 4,
            blob_size: 40,
        };

        let result = stress_contended_writes(&store, &blob, &config);
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.total_ops, 200);
        assert_eq!(blob.version(), before + result.successful_ops as u64);
        assert_eq!(store.read(&blob).unwrap().len(), 40);
    }

    #[test]
    fn independent_blobs_never_fail() {
        let store = TestStore::new();
        let config = StressConfig {
            operations: 50,
            threads: 4,
            blob_size: 100,
        };

        let result = stress_independent_blobs(&store, &config);
        assert_eq!(result.failed_ops, 0);
        assert_eq!(store.len(), 100);
        // later creates may reuse tombstoned slots
        assert!(store.deleted_len() <= 100);
    }
}
