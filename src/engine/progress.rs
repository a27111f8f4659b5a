use std::sync::Arc;

use crate::error::JobContext;

/// Snapshot sent after each completed chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub context: JobContext,
    pub completed: usize,
    pub total: usize,
}

impl ProgressUpdate {
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        ((self.completed * 100) / self.total) as u8
    }
}

pub type ProgressCallback = Arc<dyn Fn(&ProgressUpdate) + Send + Sync>;

/// Progress reporter that logs every tenth of the run at info level.
pub fn log_progress() -> ProgressCallback {
    Arc::new(|update: &ProgressUpdate| {
        let step = (update.total / 10).max(1);
        if update.completed % step == 0 || update.completed == update.total {
            tracing::info!(
                context = %update.context,
                completed = update.completed,
                total = update.total,
                percent = update.percent(),
                "chunk progress"
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent() {
        let update = ProgressUpdate {
            context: JobContext::default(),
            completed: 3,
            total: 4,
        };
        assert_eq!(update.percent(), 75);
        let empty = ProgressUpdate {
            context: JobContext::default(),
            completed: 0,
            total: 0,
        };
        assert_eq!(empty.percent(), 100);
    }
}
