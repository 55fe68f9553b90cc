//! Microphone session bookkeeping.
//!
//! Only one capture may run at a time. Each capture gets a fresh
//! [`RecordingSessionId`] so late shell answers and the auto-stop timer can be
//! matched against the session they belong to.

use serde::{Deserialize, Serialize};

use crate::capabilities::{AudioClip, AudioError, AudioOutput, AudioResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordingSessionId(pub u64);

impl std::fmt::Display for RecordingSessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rec-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecorderPhase {
    #[default]
    Idle,
    Starting,
    Recording,
    Stopping,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    Recording,
    /// A stop was requested while the microphone was still starting.
    StopRequested,
    Failed(AudioError),
    Stale,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StopOutcome {
    Saved(Option<AudioClip>),
    Failed(AudioError),
    Stale,
}

#[derive(Debug, Clone, Default)]
pub struct Recorder {
    phase: RecorderPhase,
    session: Option<RecordingSessionId>,
    next_session: u64,
    stop_requested: bool,
    last_clip: Option<AudioClip>,
}

impl Recorder {
    pub fn phase(&self) -> RecorderPhase {
        self.phase
    }

    pub fn current_session(&self) -> Option<RecordingSessionId> {
        self.session
    }

    pub fn is_active(&self) -> bool {
        self.phase != RecorderPhase::Idle
    }

    pub fn last_clip(&self) -> Option<&AudioClip> {
        self.last_clip.as_ref()
    }

    /// Opens a new session. `None` while another one is running.
    pub fn begin(&mut self) -> Option<RecordingSessionId> {
        if self.is_active() {
            return None;
        }
        self.next_session += 1;
        let session = RecordingSessionId(self.next_session);
        self.session = Some(session);
        self.phase = RecorderPhase::Starting;
        self.stop_requested = false;
        Some(session)
    }

    pub fn started(&mut self, session: RecordingSessionId, result: AudioResult) -> StartOutcome {
        if self.session != Some(session) || self.phase != RecorderPhase::Starting {
            return StartOutcome::Stale;
        }
        match result {
            Ok(AudioOutput::Started) if self.stop_requested => {
                self.phase = RecorderPhase::Stopping;
                StartOutcome::StopRequested
            }
            Ok(AudioOutput::Started) => {
                self.phase = RecorderPhase::Recording;
                StartOutcome::Recording
            }
            Ok(AudioOutput::Stopped { .. }) => {
                self.reset();
                StartOutcome::Failed(AudioError::UnexpectedOutput)
            }
            Err(e) => {
                self.reset();
                StartOutcome::Failed(e)
            }
        }
    }

    /// Moves a running session to stopping. `None` when there is nothing to stop
    /// yet; a stop during start-up is remembered and applied once it starts.
    pub fn request_stop(&mut self) -> Option<RecordingSessionId> {
        match self.phase {
            RecorderPhase::Recording => {
                self.phase = RecorderPhase::Stopping;
                self.session
            }
            RecorderPhase::Starting => {
                self.stop_requested = true;
                None
            }
            RecorderPhase::Idle | RecorderPhase::Stopping => None,
        }
    }

    pub fn finished(&mut self, session: RecordingSessionId, result: AudioResult) -> StopOutcome {
        if self.session != Some(session) || self.phase != RecorderPhase::Stopping {
            return StopOutcome::Stale;
        }
        self.reset();
        match result {
            Ok(AudioOutput::Stopped { clip }) => {
                if clip.is_some() {
                    self.last_clip.clone_from(&clip);
                }
                StopOutcome::Saved(clip)
            }
            Ok(AudioOutput::Started) => StopOutcome::Failed(AudioError::UnexpectedOutput),
            Err(e) => StopOutcome::Failed(e),
        }
    }

    fn reset(&mut self) {
        self.phase = RecorderPhase::Idle;
        self.session = None;
        self.stop_requested = false;
    }
}
