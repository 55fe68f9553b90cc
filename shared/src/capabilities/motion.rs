use crux_core::capability::{Capability, CapabilityContext, Operation};
use serde::{Deserialize, Serialize};

/// Subscribes the shell's accelerometer. While subscribed the shell sends
/// every reading back as `Event::MotionSampled`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum MotionOperation {
    StartUpdates { interval_ms: u64 },
    StopUpdates,
}

impl Operation for MotionOperation {
    type Output = ();
}

pub struct Motion<Ev> {
    context: CapabilityContext<MotionOperation, Ev>,
}

impl<Ev> Capability<Ev> for Motion<Ev> {
    type Operation = MotionOperation;
    type MappedSelf<MappedEv> = Motion<MappedEv>;

    fn map_event<F, NewEv>(&self, f: F) -> Self::MappedSelf<NewEv>
    where
        F: Fn(NewEv) -> Ev + Send + Sync + 'static,
        Ev: 'static,
        NewEv: 'static + Send,
    {
        Motion::new(self.context.map_event(f))
    }
}

impl<Ev> Motion<Ev>
where
    Ev: 'static,
{
    pub fn new(context: CapabilityContext<MotionOperation, Ev>) -> Self {
        Self { context }
    }

    pub fn start_updates(&self, interval_ms: u64) {
        self.notify(MotionOperation::StartUpdates { interval_ms });
    }

    pub fn stop_updates(&self) {
        self.notify(MotionOperation::StopUpdates);
    }

    fn notify(&self, operation: MotionOperation) {
        let ctx = self.context.clone();
        self.context.spawn(async move {
            ctx.notify_shell(operation).await;
        });
    }
}
