//! Checkpoint scheduling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::error::{Result, SerialDbError};
use crate::storage::wal::SerialLog;

/// Runs checkpoints on demand and, optionally, on a timer.
pub struct Checkpointer {
    /// Next checkpoint ID.
    next_checkpoint_id: AtomicU64,
    /// Block recorded by the most recent checkpoint.
    last_block: AtomicU64,
    stop: Mutex<bool>,
    stop_cond: Condvar,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Checkpointer {
    /// Creates a checkpointer with no background thread.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_checkpoint_id: AtomicU64::new(1),
            last_block: AtomicU64::new(0),
            stop: Mutex::new(false),
            stop_cond: Condvar::new(),
            thread_handle: Mutex::new(None),
        }
    }

    /// Returns and increments the next checkpoint ID.
    pub fn next_id(&self) -> u64 {
        self.next_checkpoint_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns the current checkpoint ID (without incrementing).
    #[must_use]
    pub fn current_id(&self) -> u64 {
        self.next_checkpoint_id.load(Ordering::Relaxed)
    }

    /// Block recorded by the most recent checkpoint run through this checkpointer.
    #[must_use]
    pub fn last_block(&self) -> u64 {
        self.last_block.load(Ordering::Acquire)
    }

    /// Runs one checkpoint and returns its ID.
    ///
    /// See [`SerialLog::checkpoint`] for the protocol.
    ///
    /// # Errors
    ///
    /// Returns an error if the log or a table space cannot be flushed.
    pub fn checkpoint(&self, log: &SerialLog) -> Result<u64> {
        let checkpoint_id = self.next_id();
        let block = log.checkpoint()?;
        self.last_block.fetch_max(block, Ordering::AcqRel);
        debug!(checkpoint_id, block, "checkpoint finished");
        Ok(checkpoint_id)
    }

    /// Starts a thread that checkpoints `log` every `interval`.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn start(self: &Arc<Self>, log: Arc<SerialLog>, interval: Duration) -> Result<()> {
        let this = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("serialdb-checkpoint".to_string())
            .spawn(move || this.run(&log, interval))
            .map_err(|e| SerialDbError::StorageError(format!("Failed to spawn checkpoint thread: {e}")))?;
        *self.thread_handle.lock() = Some(handle);
        Ok(())
    }

    fn run(&self, log: &SerialLog, interval: Duration) {
        loop {
            {
                let mut stop = self.stop.lock();
                if !*stop {
                    self.stop_cond.wait_for(&mut stop, interval);
                }
                if *stop {
                    return;
                }
            }
            if let Err(e) = self.checkpoint(log) {
                warn!(error = %e, "periodic checkpoint failed");
            }
        }
    }

    /// Stops the background thread, if one is running.
    ///
    /// # Errors
    ///
    /// Returns `ThreadPanic` if the thread panicked.
    pub fn stop(&self) -> Result<()> {
        {
            let mut stop = self.stop.lock();
            *stop = true;
            self.stop_cond.notify_all();
        }
        if let Some(handle) = self.thread_handle.lock().take() {
            handle
                .join()
                .map_err(|_| SerialDbError::ThreadPanic("checkpoint".into()))?;
        }
        Ok(())
    }
}

impl Default for Checkpointer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::wal::SerialLogConfig;
    use crate::storage::TableSpaceManager;
    use tempfile::TempDir;

    #[test]
    fn test_checkpoint_ids() {
        let checkpointer = Checkpointer::new();

        assert_eq!(checkpointer.current_id(), 1);
        assert_eq!(checkpointer.next_id(), 1);
        assert_eq!(checkpointer.current_id(), 2);
        assert_eq!(checkpointer.next_id(), 2);
        assert_eq!(checkpointer.current_id(), 3);
    }

    #[test]
    fn test_periodic_checkpoints() {
        let temp_dir = TempDir::new().unwrap();
        let spaces = Arc::new(TableSpaceManager::create(temp_dir.path(), 16).unwrap());
        let log = Arc::new(SerialLog::open(temp_dir.path(), SerialLogConfig::default(), spaces).unwrap());
        log.initialize().unwrap();

        let checkpointer = Arc::new(Checkpointer::new());
        checkpointer
            .start(Arc::clone(&log), Duration::from_millis(10))
            .unwrap();
        while checkpointer.current_id() < 3 {
            thread::sleep(Duration::from_millis(5));
        }
        checkpointer.stop().unwrap();

        assert!(checkpointer.last_block() >= 1);
        assert_eq!(log.checkpoint_block(), checkpointer.last_block());
    }
}
