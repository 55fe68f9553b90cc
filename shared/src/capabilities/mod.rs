mod audio;
mod kv;
mod location;
mod motion;
mod timer;

pub use self::audio::{Audio, AudioClip, AudioError, AudioOperation, AudioOutput, AudioResult};
pub use self::kv::{
    KeyValue, KvError, KvKey, KvOperation, KvOutput, KvResult, StorageErrorCode, MAX_VALUE_SIZE,
};
pub use self::location::{Location, LocationError, LocationOperation, LocationResult, Position};
pub use self::motion::{Motion, MotionOperation};
pub use self::timer::{Timer, TimerId, TimerOperation, TimerOutput};

/// Render capability re-export.
///
/// Crux's built-in Render capability covers view updates as-is.
pub use crux_core::render::Render;

use crate::app::App;
use crate::event::Event;

#[derive(crux_core::macros::Effect)]
#[effect(app = "App")]
pub struct Capabilities {
    pub render: Render<Event>,
    pub kv: KeyValue<Event>,
    pub location: Location<Event>,
    pub audio: Audio<Event>,
    pub motion: Motion<Event>,
    pub timer: Timer<Event>,
}
