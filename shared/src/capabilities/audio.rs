use crux_core::capability::{Capability, CapabilityContext, Operation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AudioOperation {
    StartCapture,
    StopCapture,
}

impl Operation for AudioOperation {
    type Output = AudioResult;
}

/// Handle to a recorded clip that the shell can play back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AudioClip {
    pub uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AudioOutput {
    Started,
    /// `clip` is `None` when nothing was captured.
    Stopped { clip: Option<AudioClip> },
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum AudioError {
    #[error("microphone permission denied")]
    PermissionDenied,

    #[error("microphone unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("shell answered with an unexpected audio output")]
    UnexpectedOutput,
}

impl AudioError {
    #[must_use]
    pub const fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied)
    }
}

pub type AudioResult = Result<AudioOutput, AudioError>;

pub struct Audio<Ev> {
    context: CapabilityContext<AudioOperation, Ev>,
}

impl<Ev> Capability<Ev> for Audio<Ev> {
    type Operation = AudioOperation;
    type MappedSelf<MappedEv> = Audio<MappedEv>;

    fn map_event<F, NewEv>(&self, f: F) -> Self::MappedSelf<NewEv>
    where
        F: Fn(NewEv) -> Ev + Send + Sync + 'static,
        Ev: 'static,
        NewEv: 'static + Send,
    {
        Audio::new(self.context.map_event(f))
    }
}

impl<Ev> Audio<Ev>
where
    Ev: 'static,
{
    pub fn new(context: CapabilityContext<AudioOperation, Ev>) -> Self {
        Self { context }
    }

    pub fn start_capture<F>(&self, make_event: F)
    where
        F: FnOnce(AudioResult) -> Ev + Send + 'static,
    {
        self.request(AudioOperation::StartCapture, make_event);
    }

    pub fn stop_capture<F>(&self, make_event: F)
    where
        F: FnOnce(AudioResult) -> Ev + Send + 'static,
    {
        self.request(AudioOperation::StopCapture, make_event);
    }

    fn request<F>(&self, operation: AudioOperation, make_event: F)
    where
        F: FnOnce(AudioResult) -> Ev + Send + 'static,
    {
        let ctx = self.context.clone();
        self.context.spawn(async move {
            let result = ctx.request_from_shell(operation).await;
            ctx.update_app(make_event(result));
        });
    }
}
