//! Control channel (§4.11): HEARTBEAT/SHUTDOWN/PAUSE_PROCESSING/
//! RESUME_PROCESSING commands toggling the dispatcher's dequeue loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Deserialize;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlCommand {
    Heartbeat,
    Shutdown,
    PauseProcessing,
    ResumeProcessing,
}

/// Shared run state the dispatch loop polls each iteration; cheap to clone,
/// cheap to check.
#[derive(Clone)]
pub struct RunState {
    paused: Arc<AtomicBool>,
    shutting_down: Arc<AtomicBool>,
}

impl RunState {
    pub fn new() -> Self {
        Self {
            paused: Arc::new(AtomicBool::new(false)),
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    pub fn apply(&self, command: ControlCommand) {
        match command {
            ControlCommand::Heartbeat => {}
            ControlCommand::Shutdown => {
                info!("control channel requested shutdown");
                self.shutting_down.store(true, Ordering::Relaxed);
            }
            ControlCommand::PauseProcessing => {
                info!("control channel paused dequeue loop");
                self.paused.store(true, Ordering::Relaxed);
            }
            ControlCommand::ResumeProcessing => {
                info!("control channel resumed dequeue loop");
                self.paused.store(false, Ordering::Relaxed);
            }
        }
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}
