//! Long-running pipeline work and the progress protocol it reports through.
//!
//! Workers send `TaskUpdate`s over an `mpsc` channel and poll a shared
//! `Arc<AtomicBool>` between files to honour cancellation.

pub mod batch;

pub use batch::{BatchError, BatchReport, BatchRunner, FileOutcome};

/// One file finished inside a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskProgress {
    /// Files finished so far, this one included.
    pub current: usize,
    pub total: usize,
    pub file_path: String,
    pub outcome: &'static str,
}

impl TaskProgress {
    pub fn new(current: usize, total: usize, file_path: impl Into<String>, outcome: &'static str) -> Self {
        Self {
            current,
            total,
            file_path: file_path.into(),
            outcome,
        }
    }

    /// 0-100
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        (self.current.min(self.total) * 100 / self.total) as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskUpdate {
    Started { total: usize },
    Progress(TaskProgress),
    Completed { completed: usize, failed: usize },
    /// Stopped between files; the rest stay pending.
    Cancelled { finished: usize },
    /// The store failed and the batch was aborted.
    Failed { error: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent() {
        assert_eq!(TaskProgress::new(0, 0, "a.jpg", "completed").percent(), 0);
        assert_eq!(TaskProgress::new(1, 4, "a.jpg", "completed").percent(), 25);
        assert_eq!(TaskProgress::new(9, 4, "a.jpg", "failed").percent(), 100);
    }
}
