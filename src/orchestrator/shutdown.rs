use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Once};

use log::{info, warn};

use crate::core::model::ChunkStatus;

/// Why a chunk run is stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StopReason {
    Running = 0,
    /// The source reached the end of the range.
    InputExhausted = 1,
    /// Termination requested from outside (Ctrl-C, SIGTERM, caller).
    Interrupted = 2,
    /// The source could not start or produced nothing.
    SourceFailed = 3,
    /// The source died after producing frames.
    SourceLost = 4,
    /// A stage crashed or the run could not be set up.
    Fatal = 5,
}

impl StopReason {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => StopReason::InputExhausted,
            2 => StopReason::Interrupted,
            3 => StopReason::SourceFailed,
            4 => StopReason::SourceLost,
            5 => StopReason::Fatal,
            _ => StopReason::Running,
        }
    }

    /// Stages stop at the next poll and queued work is discarded.
    pub fn is_abort(self) -> bool {
        !matches!(self, StopReason::Running | StopReason::InputExhausted)
    }

    pub fn chunk_status(self) -> ChunkStatus {
        match self {
            StopReason::InputExhausted => ChunkStatus::Completed,
            StopReason::Interrupted | StopReason::SourceLost => ChunkStatus::Pending,
            StopReason::Running | StopReason::SourceFailed | StopReason::Fatal => {
                ChunkStatus::Failed
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::Running => "running",
            StopReason::InputExhausted => "input exhausted",
            StopReason::Interrupted => "interrupted",
            StopReason::SourceFailed => "source failed",
            StopReason::SourceLost => "source lost",
            StopReason::Fatal => "fatal error",
        }
    }
}

/// One-way stop flag shared by every stage of a chunk run.
///
/// The first reason wins, except that an abort may replace
/// `InputExhausted` while stages are still draining.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    state: Arc<AtomicU8>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if this call changed the reason.
    pub fn request(&self, reason: StopReason) -> bool {
        if reason == StopReason::Running {
            return false;
        }
        self.state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                match StopReason::from_u8(current) {
                    StopReason::Running => Some(reason as u8),
                    StopReason::InputExhausted if reason.is_abort() => Some(reason as u8),
                    _ => None,
                }
            })
            .is_ok()
    }

    pub fn reason(&self) -> StopReason {
        StopReason::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_set(&self) -> bool {
        self.reason() != StopReason::Running
    }

    pub fn should_abort(&self) -> bool {
        self.reason().is_abort()
    }

    /// Reset a finished run's reason before the next run. An outside
    /// interrupt is kept; returns false in that case.
    pub fn rearm(&self) -> bool {
        self.state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                match StopReason::from_u8(current) {
                    StopReason::Interrupted => None,
                    _ => Some(StopReason::Running as u8),
                }
            })
            .is_ok()
    }

    /// Route Ctrl-C / SIGTERM to this signal. Only the first call in a
    /// process installs a handler.
    pub fn install_termination_handler(&self) {
        static HANDLER: Once = Once::new();
        let signal = self.clone();
        HANDLER.call_once(move || {
            let result = ctrlc::set_handler(move || {
                if signal.request(StopReason::Interrupted) {
                    info!("🛑 termination requested, stopping");
                }
            });
            if let Err(e) = result {
                warn!("⚠️ Failed to install termination handler: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_reason_wins() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_set());
        assert!(signal.request(StopReason::Interrupted));
        assert!(!signal.request(StopReason::Fatal));
        assert_eq!(signal.reason(), StopReason::Interrupted);
        assert!(signal.should_abort());
    }

    #[test]
    fn test_abort_overrides_input_exhausted() {
        let signal = ShutdownSignal::new();
        signal.request(StopReason::InputExhausted);
        assert!(signal.is_set());
        assert!(!signal.should_abort());

        assert!(signal.request(StopReason::Interrupted));
        assert_eq!(signal.reason(), StopReason::Interrupted);
        assert!(!signal.request(StopReason::InputExhausted));
    }

    #[test]
    fn test_clones_share_state() {
        let signal = ShutdownSignal::new();
        let stage = signal.clone();
        stage.request(StopReason::SourceLost);
        assert_eq!(signal.reason(), StopReason::SourceLost);
    }

    #[test]
    fn test_rearm_keeps_interrupt() {
        let signal = ShutdownSignal::new();
        signal.request(StopReason::SourceFailed);
        assert!(signal.rearm());
        assert_eq!(signal.reason(), StopReason::Running);

        signal.request(StopReason::Interrupted);
        assert!(!signal.rearm());
        assert_eq!(signal.reason(), StopReason::Interrupted);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(StopReason::InputExhausted.chunk_status(), ChunkStatus::Completed);
        assert_eq!(StopReason::Interrupted.chunk_status(), ChunkStatus::Pending);
        assert_eq!(StopReason::SourceLost.chunk_status(), ChunkStatus::Pending);
        assert_eq!(StopReason::SourceFailed.chunk_status(), ChunkStatus::Failed);
        assert_eq!(StopReason::Fatal.chunk_status(), ChunkStatus::Failed);
    }
}
