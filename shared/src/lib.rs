#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod calculator;
pub mod capabilities;
pub mod event;
pub mod model;
pub mod motion;
pub mod recorder;
pub mod store;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

use crate::calculator::ArithmeticError;
use crate::capabilities::{AudioError, KvError, LocationError, Position};
use crate::event::PinError;
use crate::model::{AlertRecord, AlertStatus, AlertTrigger, ContactError, JournalError};
use crate::motion::ShakeConfig;
use crate::store::StoreError;

pub use app::App;
pub use capabilities::{Capabilities, Effect};
pub use event::Event;
pub use model::Model;

pub const SEQUENCE_BUFFER_CAPACITY: usize = 10;
pub const LONG_PRESS_DURATION: Duration = Duration::from_millis(1500);
pub const LONG_PRESS_ALERT_THRESHOLD: u32 = 3;
pub const AUTO_STOP_RECORDING: Duration = Duration::from_secs(30);
pub const LOCATION_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
pub const MOTION_SAMPLE_PERIOD: Duration = Duration::from_millis(100);
pub const SHAKE_THRESHOLD: f64 = 15.0;
pub const SHAKE_SAMPLE_INTERVAL: Duration = Duration::from_millis(1000);
pub const SHAKE_DEBOUNCE: Duration = Duration::from_millis(5000);
pub const MAX_ALERT_HISTORY: usize = 20;
pub const MAX_CONTACTS: usize = 50;
pub const MAX_CONTACT_NAME_CHARS: usize = 100;
pub const MAX_PHONE_CHARS: usize = 32;
pub const MAX_JOURNAL_ENTRIES: usize = 500;
pub const MAX_JOURNAL_ENTRY_CHARS: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Transient,
    Permanent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidInput,
    Validation,
    Configuration,
    NoContactsConfigured,
    LocationUnavailable,
    LocationPermissionDenied,
    MicrophoneUnavailable,
    MicrophonePermissionDenied,
    Storage,
    Serialization,
    NotFound,
    LimitExceeded,
    InvalidState,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::InvalidInput => "INVALID_INPUT",
            Self::Validation => "VALIDATION_ERROR",
            Self::Configuration => "CONFIGURATION_ERROR",
            Self::NoContactsConfigured => "NO_CONTACTS_CONFIGURED",
            Self::LocationUnavailable => "LOCATION_UNAVAILABLE",
            Self::LocationPermissionDenied => "LOCATION_PERMISSION_DENIED",
            Self::MicrophoneUnavailable => "MICROPHONE_UNAVAILABLE",
            Self::MicrophonePermissionDenied => "MICROPHONE_PERMISSION_DENIED",
            Self::Storage => "STORAGE_ERROR",
            Self::Serialization => "SERIALIZATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::LimitExceeded => "LIMIT_EXCEEDED",
            Self::InvalidState => "INVALID_STATE",
            Self::Internal => "INTERNAL_ERROR",
        }
    }

    /// Nothing here stops the app; the disguise must stay usable.
    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::LocationUnavailable
            | Self::MicrophoneUnavailable
            | Self::Storage
            | Self::InvalidInput => ErrorSeverity::Transient,

            Self::Validation
            | Self::Configuration
            | Self::NoContactsConfigured
            | Self::LocationPermissionDenied
            | Self::MicrophonePermissionDenied
            | Self::Serialization
            | Self::NotFound
            | Self::LimitExceeded
            | Self::InvalidState
            | Self::Internal => ErrorSeverity::Permanent,
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::LocationUnavailable | Self::MicrophoneUnavailable | Self::Storage
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppError {
    pub kind: ErrorKind,
    pub severity: ErrorSeverity,
    pub message: String,
    pub internal_message: Option<String>,
    pub context: HashMap<String, String>,
}

impl AppError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            message: message.into(),
            internal_message: None,
            context: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_internal(mut self, internal: impl Into<String>) -> Self {
        self.internal_message = Some(internal.into());
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    #[must_use]
    pub fn user_facing_message(&self) -> String {
        match self.kind {
            ErrorKind::InvalidInput | ErrorKind::Validation | ErrorKind::Configuration => {
                self.message.clone()
            }
            ErrorKind::NoContactsConfigured => {
                "Please add an emergency contact first using the 'sin' button".into()
            }
            ErrorKind::LocationUnavailable => {
                "Unable to determine your location. Please check your GPS settings.".into()
            }
            ErrorKind::LocationPermissionDenied => {
                "Location access is required. Please enable location permissions in Settings."
                    .into()
            }
            ErrorKind::MicrophoneUnavailable => {
                "The microphone is unavailable. Please try again.".into()
            }
            ErrorKind::MicrophonePermissionDenied => {
                "Microphone access is required. Please enable microphone permissions in Settings."
                    .into()
            }
            ErrorKind::Storage => {
                "Unable to save data locally. Please free up some storage space.".into()
            }
            ErrorKind::Serialization => {
                "Saved data could not be read. It will be replaced on the next change.".into()
            }
            ErrorKind::NotFound => "The requested item could not be found.".into(),
            ErrorKind::LimitExceeded => self.message.clone(),
            ErrorKind::InvalidState | ErrorKind::Internal => {
                "An unexpected error occurred. Please try again.".into()
            }
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code(), self.message)?;
        if let Some(internal) = &self.internal_message {
            write!(f, " (internal: {internal})")?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {}

impl From<ArithmeticError> for AppError {
    fn from(e: ArithmeticError) -> Self {
        let message = match e {
            ArithmeticError::DivideByZero => "Cannot divide by zero",
            ArithmeticError::NonFinite => "Result is too large",
        };
        AppError::new(ErrorKind::InvalidInput, message).with_internal(e.to_string())
    }
}

impl From<PinError> for AppError {
    fn from(e: PinError) -> Self {
        AppError::new(ErrorKind::Configuration, e.to_string())
    }
}

impl From<ContactError> for AppError {
    fn from(e: ContactError) -> Self {
        let kind = match &e {
            ContactError::MissingFields
            | ContactError::InvalidPhone
            | ContactError::TooLong { .. } => ErrorKind::Validation,
            ContactError::InvalidPin(_) => ErrorKind::Configuration,
            ContactError::LimitReached { .. } => ErrorKind::LimitExceeded,
            ContactError::NotFound(_) => ErrorKind::NotFound,
        };
        AppError::new(kind, e.to_string())
    }
}

impl From<JournalError> for AppError {
    fn from(e: JournalError) -> Self {
        let kind = match &e {
            JournalError::Empty | JournalError::TooLong { .. } => ErrorKind::Validation,
            JournalError::NotFound(_) => ErrorKind::NotFound,
        };
        AppError::new(kind, e.to_string())
    }
}

impl From<KvError> for AppError {
    fn from(e: KvError) -> Self {
        let kind = match &e {
            KvError::Serialization { .. } => ErrorKind::Serialization,
            KvError::InvalidKey { .. } => ErrorKind::Internal,
            KvError::ValueTooLarge { .. }
            | KvError::Storage { .. }
            | KvError::UnexpectedOutput { .. }
            | KvError::Timeout { .. } => ErrorKind::Storage,
        };
        AppError::new(kind, "Storage operation failed").with_internal(e.to_string())
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Kv(kv) => kv.into(),
            StoreError::Serialization(_) => {
                AppError::new(ErrorKind::Serialization, "Stored data is unreadable")
                    .with_internal(e.to_string())
            }
            StoreError::TooLarge { .. } | StoreError::UnexpectedOutput { .. } => {
                AppError::new(ErrorKind::Storage, "Storage operation failed")
                    .with_internal(e.to_string())
            }
        }
    }
}

impl From<LocationError> for AppError {
    fn from(e: LocationError) -> Self {
        let kind = if e.is_permission_denied() {
            ErrorKind::LocationPermissionDenied
        } else {
            ErrorKind::LocationUnavailable
        };
        AppError::new(kind, e.to_string())
    }
}

impl From<AudioError> for AppError {
    fn from(e: AudioError) -> Self {
        let kind = if e.is_permission_denied() {
            ErrorKind::MicrophonePermissionDenied
        } else {
            ErrorKind::MicrophoneUnavailable
        };
        AppError::new(kind, e.to_string())
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CoordinateError {
    #[error("Latitude {0} is out of valid range [-90, 90]")]
    LatitudeOutOfRange(f64),
    #[error("Longitude {0} is out of valid range [-180, 180]")]
    LongitudeOutOfRange(f64),
    #[error("Coordinate value is not finite (NaN or Infinity)")]
    NonFinite,
}

impl From<CoordinateError> for AppError {
    fn from(e: CoordinateError) -> Self {
        AppError::new(ErrorKind::LocationUnavailable, e.to_string())
    }
}

/// A validated position fix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    latitude: f64,
    longitude: f64,
    accuracy_m: Option<f64>,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, CoordinateError> {
        if !latitude.is_finite() || !longitude.is_finite() {
            return Err(CoordinateError::NonFinite);
        }
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(CoordinateError::LatitudeOutOfRange(latitude));
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(CoordinateError::LongitudeOutOfRange(longitude));
        }
        Ok(Self {
            latitude,
            longitude,
            accuracy_m: None,
        })
    }

    /// Accuracy values that are negative or not finite are dropped.
    #[must_use]
    pub fn with_accuracy(mut self, accuracy_m: Option<f64>) -> Self {
        self.accuracy_m = accuracy_m.filter(|a| a.is_finite() && *a >= 0.0);
        self
    }

    #[must_use]
    pub const fn latitude(self) -> f64 {
        self.latitude
    }

    #[must_use]
    pub const fn longitude(self) -> f64 {
        self.longitude
    }

    #[must_use]
    pub const fn accuracy_m(self) -> Option<f64> {
        self.accuracy_m
    }
}

impl TryFrom<Position> for Coordinates {
    type Error = CoordinateError;

    fn try_from(position: Position) -> Result<Self, Self::Error> {
        Ok(Self::new(position.latitude, position.longitude)?.with_accuracy(position.accuracy_m))
    }
}

#[must_use]
pub fn get_current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    #[must_use]
    pub fn now() -> Self {
        Self(get_current_time_ms())
    }

    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// RFC 3339 in UTC with millisecond precision, e.g. `2024-03-01T09:30:00.000Z`.
    #[must_use]
    pub fn to_iso_8601(self) -> String {
        i64::try_from(self.0)
            .ok()
            .and_then(chrono::DateTime::<chrono::Utc>::from_timestamp_millis)
            .unwrap_or_default()
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToastMessage {
    pub title: String,
    pub message: String,
    pub kind: ToastKind,
    pub created_at_ms: u64,
    pub duration_ms: u64,
}

impl ToastMessage {
    #[must_use]
    pub fn new(title: impl Into<String>, message: impl Into<String>, kind: ToastKind) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            kind,
            created_at_ms: get_current_time_ms(),
            duration_ms: kind.default_duration_ms(),
        }
    }

    #[must_use]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.created_at_ms) > self.duration_ms
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToastKind {
    #[default]
    Info,
    Success,
    Warning,
    Error,
}

impl ToastKind {
    #[must_use]
    pub const fn default_duration_ms(self) -> u64 {
        match self {
            Self::Info => 3000,
            Self::Success => 2000,
            Self::Warning => 4000,
            Self::Error => 5000,
        }
    }
}

/// Tunables for the core, built from the crate constants.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoreConfig {
    pub long_press_ms: u64,
    pub auto_stop_recording_ms: u64,
    pub location_refresh_interval_ms: u64,
    pub motion_sample_period_ms: u64,
    pub max_alert_history: usize,
    pub shake: ShakeConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            long_press_ms: LONG_PRESS_DURATION.as_millis() as u64,
            auto_stop_recording_ms: AUTO_STOP_RECORDING.as_millis() as u64,
            location_refresh_interval_ms: LOCATION_REFRESH_INTERVAL.as_millis() as u64,
            motion_sample_period_ms: MOTION_SAMPLE_PERIOD.as_millis() as u64,
            max_alert_history: MAX_ALERT_HISTORY,
            shake: ShakeConfig::default(),
        }
    }
}

// --- View model ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CalculatorView {
    pub display: String,
    pub memory: Option<f64>,
    pub operation: Option<String>,
    pub capturing_contact: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ContactView {
    pub id: String,
    pub name: String,
    pub phone: String,
    pub has_trigger_pin: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct JournalEntryView {
    pub id: String,
    pub date: String,
    pub content: String,
    pub timestamp_ms: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SettingsView {
    pub setup_completed: bool,
    pub trigger_pin_set: bool,
    pub shake_trigger_enabled: bool,
    pub auto_record_enabled: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AlertView {
    pub trigger: AlertTrigger,
    pub contact_name: Option<String>,
    pub status: AlertStatus,
    pub location: Option<Coordinates>,
    pub raised_at_ms: u64,
}

impl From<&AlertRecord> for AlertView {
    fn from(a: &AlertRecord) -> Self {
        Self {
            trigger: a.trigger,
            contact_name: a.contact_name.clone(),
            status: a.status,
            location: a.location,
            raised_at_ms: a.raised_at.as_millis(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct UserFacingError {
    pub message: String,
    pub is_transient: bool,
    pub is_retryable: bool,
    pub error_code: String,
}

impl From<&AppError> for UserFacingError {
    fn from(e: &AppError) -> Self {
        Self {
            message: e.user_facing_message(),
            is_transient: e.severity == ErrorSeverity::Transient,
            is_retryable: e.is_retryable(),
            error_code: e.code().to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ToastView {
    pub title: String,
    pub message: String,
    pub kind: ToastKind,
    pub duration_ms: u64,
}

impl From<&ToastMessage> for ToastView {
    fn from(t: &ToastMessage) -> Self {
        Self {
            title: t.title.clone(),
            message: t.message.clone(),
            kind: t.kind,
            duration_ms: t.duration_ms,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ViewModel {
    pub calculator: CalculatorView,
    pub is_calculator_mode: bool,
    pub show_navigation: bool,
    pub setup_completed: bool,
    pub is_loading: bool,
    pub contacts: Vec<ContactView>,
    pub journal: Vec<JournalEntryView>,
    pub settings: SettingsView,
    pub is_recording: bool,
    pub last_recording: Option<String>,
    pub current_location: Option<Coordinates>,
    pub last_alert: Option<AlertView>,
    pub toast: Option<ToastView>,
    pub error: Option<UserFacingError>,
}

pub mod app {
    use super::*;
    use tracing::{debug, error, info, warn};

    use crate::calculator::Signal;
    use crate::capabilities::{Capabilities, KvResult, LocationResult};
    use crate::event::ContactId;
    use crate::model::SettingsPatch;
    use crate::recorder::{StartOutcome, StopOutcome};
    use crate::store::{self, LoadDisposition, LoadedBlob, StoredBlob};

    #[derive(Default)]
    pub struct App;

    impl App {
        fn load_all(caps: &Capabilities) {
            for blob in StoredBlob::ALL {
                match blob.key() {
                    Ok(key) => caps.kv.get(key, move |result| Event::StoredValueLoaded {
                        blob,
                        result: Box::new(result),
                    }),
                    Err(e) => error!(blob = ?blob, error = %e, "invalid storage key"),
                }
            }
        }

        /// Writes the whole blob. Every local mutation goes through here.
        fn persist(blob: StoredBlob, model: &mut Model, caps: &Capabilities) {
            model.persistence.mark_dirty(blob);

            let encoded = match blob {
                StoredBlob::Contacts => store::encode(blob, &model.contacts),
                StoredBlob::Journal => store::encode(blob, &model.journal),
                StoredBlob::Settings => store::encode(blob, &model.settings),
            };
            let result = encoded.and_then(|bytes| Ok((blob.key()?, bytes)));

            match result {
                Ok((key, bytes)) => {
                    debug!(blob = ?blob, bytes = bytes.len(), "persisting blob");
                    caps.kv.set(key, bytes, move |result| Event::StoredValueWritten {
                        blob,
                        result: Box::new(result),
                    });
                }
                Err(e) => {
                    error!(blob = ?blob, error = %e, "failed to encode blob");
                    model.set_error(
                        AppError::from(e).with_context("blob", blob.key_name()),
                    );
                }
            }
        }

        fn apply_loaded(blob: StoredBlob, result: KvResult, model: &mut Model, caps: &Capabilities) {
            let disposition = model.persistence.finish_load(blob);

            let output = match result {
                Ok(output) => output,
                Err(e) => {
                    warn!(blob = ?blob, error = %e, "failed to load blob");
                    model.set_error(AppError::from(e).with_context("blob", blob.key_name()));
                    return;
                }
            };

            if disposition == LoadDisposition::Ignore {
                debug!(blob = ?blob, "blob already loaded");
                return;
            }

            let loaded = match store::decode(blob, output) {
                Ok(Some(loaded)) => loaded,
                Ok(None) => {
                    debug!(blob = ?blob, "nothing stored yet");
                    return;
                }
                Err(e) => {
                    warn!(blob = ?blob, error = %e, "stored blob is unreadable");
                    model.set_error(AppError::from(e).with_context("blob", blob.key_name()));
                    return;
                }
            };

            match &loaded {
                LoadedBlob::Contacts(contacts) => info!(count = contacts.len(), "contacts loaded"),
                LoadedBlob::Journal(entries) => info!(count = entries.len(), "journal loaded"),
                LoadedBlob::Settings(settings) => info!(
                    setup_completed = settings.setup_completed,
                    shake = settings.shake_trigger_enabled,
                    auto_record = settings.auto_record_enabled,
                    "settings loaded"
                ),
            }

            if disposition == LoadDisposition::Merge {
                info!(blob = ?blob, "merging stored blob with local changes");
                model.merge_stored(loaded);
                Self::persist(blob, model, caps);
            } else {
                model.replace_stored(loaded);
            }

            if blob == StoredBlob::Settings {
                Self::sync_shake_listener(model, caps);
            }
        }

        fn sync_shake_listener(model: &mut Model, caps: &Capabilities) {
            if model.settings.shake_trigger_enabled {
                if model.shake.start() {
                    info!("shake detection started");
                    caps.motion.start_updates(model.config.motion_sample_period_ms);
                }
            } else if model.shake.stop() {
                info!("shake detection stopped");
                caps.motion.stop_updates();
            }
        }

        fn schedule_location_refresh(model: &mut Model, caps: &Capabilities) {
            let timer = model.next_timer_id();
            caps.timer.start(
                timer,
                model.config.location_refresh_interval_ms,
                Event::LocationRefreshDue,
            );
        }

        fn request_location(caps: &Capabilities) {
            caps.location.current_position(|result| Event::LocationRefreshed {
                result: Box::new(result),
            });
        }

        fn trigger_alert(
            trigger: AlertTrigger,
            contact_id: Option<ContactId>,
            model: &mut Model,
            caps: &Capabilities,
        ) {
            let contact_id = contact_id.filter(|id| {
                let known = model.contact(id).is_some();
                if !known {
                    warn!(contact = %id, "alert for unknown contact; sending a generic alert");
                }
                known
            });
            let has_contact = contact_id.is_some();
            let alert = model.open_alert(trigger, contact_id);
            info!(alert = %alert, trigger = %trigger, has_contact, "alert raised");

            caps.location.current_position(move |result| Event::AlertLocationResolved {
                alert,
                result: Box::new(result),
            });

            if model.settings.auto_record_enabled {
                Self::start_recording(true, model, caps);
            }
        }

        fn alert_toast(trigger: AlertTrigger, model: &mut Model) {
            let contact_name = model.last_alert().and_then(|a| a.contact_name.clone());
            match (trigger, contact_name) {
                (AlertTrigger::Pin, _) => {
                    model.show_toast(
                        "Help is on the way",
                        "Alert triggered silently",
                        ToastKind::Warning,
                    );
                }
                (
                    AlertTrigger::ContactPin
                    | AlertTrigger::EmergencyContactSequence
                    | AlertTrigger::Manual,
                    Some(name),
                ) => {
                    model.show_toast(
                        "Calling Emergency Contact",
                        format!("Calling {name}"),
                        ToastKind::Warning,
                    );
                }
                _ => {
                    model.show_toast(
                        "Emergency Alert Triggered",
                        "Help is on the way",
                        ToastKind::Error,
                    );
                }
            }
        }

        /// `auto_stop` schedules the stop for alert-started sessions.
        fn start_recording(auto_stop: bool, model: &mut Model, caps: &Capabilities) {
            let Some(session) = model.recorder.begin() else {
                debug!("recording already active");
                return;
            };
            info!(session = %session, auto_stop, "starting audio capture");
            caps.audio.start_capture(move |result| Event::RecordingStarted {
                session,
                result: Box::new(result),
            });

            if auto_stop {
                let timer = model.next_timer_id();
                caps.timer.start(
                    timer,
                    model.config.auto_stop_recording_ms,
                    Event::AutoStopElapsed { session },
                );
            }
        }

        fn stop_recording(model: &mut Model, caps: &Capabilities) {
            let Some(session) = model.recorder.request_stop() else {
                debug!(phase = ?model.recorder.phase(), "no running recording to stop");
                return;
            };
            info!(session = %session, "stopping audio capture");
            caps.audio.stop_capture(move |result| Event::RecordingStopped {
                session,
                result: Box::new(result),
            });
        }

        fn handle_signals(signals: Vec<Signal>, model: &mut Model, caps: &Capabilities) {
            for signal in signals {
                match signal {
                    Signal::ArithmeticFailed(e) => {
                        let err = AppError::from(e);
                        model.show_toast("Error", err.user_facing_message(), ToastKind::Error);
                    }
                    Signal::SilentAlert { contact, trigger } => {
                        Self::trigger_alert(trigger, contact, model, caps);
                        Self::alert_toast(trigger, model);
                    }
                    Signal::NoContactsConfigured => {
                        info!("contact sequence entered with no contacts configured");
                        let err = AppError::new(ErrorKind::NoContactsConfigured, "no contacts");
                        model.show_toast(
                            "No Emergency Contacts",
                            err.user_facing_message(),
                            ToastKind::Warning,
                        );
                    }
                    Signal::ExitDisguise => {
                        info!("leaving calculator mode");
                        model.is_calculator_mode = false;
                    }
                    Signal::MemoryCleared => {
                        model.show_toast(
                            "Memory Cleared",
                            "All memory has been cleared",
                            ToastKind::Info,
                        );
                    }
                    Signal::ContactCaptureStarted => debug!("contact capture started"),
                    Signal::ContactCaptureCancelled => debug!("contact capture cancelled"),
                    Signal::ContactCaptured { phone } => {
                        match model.add_captured_contact(phone) {
                            Ok(contact) => {
                                let message =
                                    format!("{} has been added to your emergency contacts", contact.name);
                                info!(contact = %contact.id, "contact added from keypad");
                                model.show_toast("Contact Added", message, ToastKind::Success);
                                Self::persist(StoredBlob::Contacts, model, caps);
                            }
                            Err(e) => Self::reject(AppError::from(e), model),
                        }
                    }
                }
            }
        }

        /// Validation failures are shown as a toast, not as an error state.
        fn reject(error: AppError, model: &mut Model) {
            debug!(code = error.code(), "request rejected");
            model.show_toast("Error", error.user_facing_message(), ToastKind::Error);
        }

        fn settings_toast(patch: &SettingsPatch, model: &mut Model) {
            if patch.trigger_pin.is_some() {
                model.show_toast(
                    "PIN Updated",
                    "Your emergency PIN has been updated",
                    ToastKind::Success,
                );
            } else if let Some(enabled) = patch.shake_trigger_enabled {
                if enabled {
                    model.show_toast(
                        "Shake Detection Enabled",
                        "Device will detect shaking to trigger emergency alert",
                        ToastKind::Info,
                    );
                } else {
                    model.show_toast(
                        "Shake Detection Disabled",
                        "Shake detection has been turned off",
                        ToastKind::Info,
                    );
                }
            } else if let Some(enabled) = patch.auto_record_enabled {
                if enabled {
                    model.show_toast(
                        "Auto Recording Enabled",
                        "Device will automatically record audio when alert is triggered",
                        ToastKind::Info,
                    );
                } else {
                    model.show_toast(
                        "Auto Recording Disabled",
                        "Auto recording has been turned off",
                        ToastKind::Info,
                    );
                }
            }
        }

        fn apply_location(result: LocationResult) -> Result<Coordinates, AppError> {
            let position = result.map_err(AppError::from)?;
            Ok(Coordinates::try_from(position)?)
        }
    }

    impl crux_core::App for App {
        type Event = Event;
        type Model = Model;
        type ViewModel = ViewModel;
        type Capabilities = Capabilities;

        fn update(&self, event: Event, model: &mut Model, caps: &Capabilities) {
            model.update_timestamp();

            let event_name = event.name();
            if event.is_user_initiated() {
                info!(event = event_name, "user action");
            } else {
                debug!(event = event_name, "event");
            }

            match event {
                Event::Noop => {}

                Event::AppStarted => {
                    Self::load_all(caps);
                    Self::sync_shake_listener(model, caps);
                    Self::request_location(caps);
                    Self::schedule_location_refresh(model, caps);
                    caps.render.render();
                }

                Event::StoredValueLoaded { blob, result } => {
                    Self::apply_loaded(blob, *result, model, caps);
                    caps.render.render();
                }

                Event::StoredValueWritten { blob, result } => {
                    match *result {
                        Ok(_) => debug!(blob = ?blob, "blob persisted"),
                        Err(e) => {
                            error!(blob = ?blob, error = %e, retryable = e.is_retryable(), "failed to persist blob");
                            model.set_error(
                                AppError::from(e).with_context("blob", blob.key_name()),
                            );
                        }
                    }
                    caps.render.render();
                }

                Event::KeyPressed { key } => {
                    let triggers = model.trigger_table();
                    let signals = model.calculator.press(key, &triggers);
                    Self::handle_signals(signals, model, caps);
                    caps.render.render();
                }

                Event::KeyHeld { key } => {
                    let Some(started) = model.calculator.hold(key) else {
                        return;
                    };
                    if let Some((_, timer)) = model.long_press_timer.take() {
                        caps.timer.cancel(timer);
                    }
                    let timer = model.next_timer_id();
                    model.long_press_timer = Some((started.press, timer));
                    caps.timer.start(
                        timer,
                        model.config.long_press_ms,
                        Event::LongPressElapsed {
                            press: started.press,
                        },
                    );
                }

                Event::KeyReleased => {
                    if model.calculator.release().is_some() {
                        if let Some((_, timer)) = model.long_press_timer.take() {
                            caps.timer.cancel(timer);
                        }
                    }
                }

                Event::LongPressElapsed { press } => {
                    if matches!(model.long_press_timer, Some((p, _)) if p == press) {
                        model.long_press_timer = None;
                    }
                    let signals = model.calculator.long_press_elapsed(press);
                    if !signals.is_empty() {
                        Self::handle_signals(signals, model, caps);
                        caps.render.render();
                    }
                }

                Event::CalculatorModeSet { enabled } => {
                    model.is_calculator_mode = enabled;
                    caps.render.render();
                }

                Event::ToastDismissed => {
                    model.clear_toast();
                    caps.render.render();
                }

                Event::ErrorDismissed => {
                    model.clear_error();
                    caps.render.render();
                }

                Event::AlertRequested { contact_id } => {
                    Self::trigger_alert(AlertTrigger::Manual, contact_id, model, caps);
                    Self::alert_toast(AlertTrigger::Manual, model);
                    caps.render.render();
                }

                Event::AlertLocationResolved { alert, result } => {
                    match Self::apply_location(*result) {
                        Ok(coordinates) => {
                            model.current_location = Some(coordinates);
                            if let Some(record) = model.alert_mut(alert) {
                                record.location = Some(coordinates);
                                record.status = AlertStatus::Dispatched;
                            }
                            info!(alert = %alert, "alert dispatched with location");
                        }
                        Err(e) => {
                            warn!(alert = %alert, code = e.code(), error = %e, "alert sent without a fresh location");
                            let last_known = model.current_location;
                            if let Some(record) = model.alert_mut(alert) {
                                record.location = last_known;
                                record.status = AlertStatus::Degraded;
                            }
                        }
                    }
                    caps.render.render();
                }

                Event::LocationRefreshDue => {
                    Self::request_location(caps);
                    Self::schedule_location_refresh(model, caps);
                }

                Event::LocationRefreshed { result } => {
                    match Self::apply_location(*result) {
                        Ok(coordinates) => {
                            model.current_location = Some(coordinates);
                            caps.render.render();
                        }
                        Err(e) => warn!(code = e.code(), error = %e, "location refresh failed"),
                    }
                }

                Event::RecordingStartRequested => {
                    Self::start_recording(false, model, caps);
                    caps.render.render();
                }

                Event::RecordingStopRequested => {
                    Self::stop_recording(model, caps);
                    caps.render.render();
                }

                Event::RecordingStarted { session, result } => {
                    match model.recorder.started(session, *result) {
                        StartOutcome::Recording => {
                            info!(session = %session, "recording");
                            model.show_toast(
                                "Recording Started",
                                "Audio recording has started",
                                ToastKind::Info,
                            );
                        }
                        StartOutcome::StopRequested => {
                            info!(session = %session, "stop was requested during start-up");
                            caps.audio.stop_capture(move |result| Event::RecordingStopped {
                                session,
                                result: Box::new(result),
                            });
                        }
                        StartOutcome::Failed(e) => {
                            warn!(session = %session, error = %e, "audio capture failed to start");
                            model.set_error(AppError::from(e));
                        }
                        StartOutcome::Stale => debug!(session = %session, "stale start answer"),
                    }
                    caps.render.render();
                }

                Event::RecordingStopped { session, result } => {
                    match model.recorder.finished(session, *result) {
                        StopOutcome::Saved(clip) => {
                            info!(session = %session, has_clip = clip.is_some(), "recording stopped");
                            if clip.is_some() {
                                model.show_toast(
                                    "Recording Saved",
                                    "Audio recording has been saved",
                                    ToastKind::Success,
                                );
                            }
                        }
                        StopOutcome::Failed(e) => {
                            warn!(session = %session, error = %e, "audio capture failed to stop");
                            model.set_error(AppError::from(e));
                        }
                        StopOutcome::Stale => debug!(session = %session, "stale stop answer"),
                    }
                    caps.render.render();
                }

                Event::AutoStopElapsed { session } => {
                    if model.recorder.current_session() == Some(session) {
                        Self::stop_recording(model, caps);
                        caps.render.render();
                    } else {
                        debug!(session = %session, "auto-stop for a finished session ignored");
                    }
                }

                Event::MotionSampled(sample) => {
                    if model.shake.observe(sample) {
                        info!("shake detected");
                        Self::trigger_alert(AlertTrigger::Shake, None, model, caps);
                        Self::alert_toast(AlertTrigger::Shake, model);
                        caps.render.render();
                    }
                }

                Event::AddContactRequested(new) => {
                    match model.add_contact(*new) {
                        Ok(contact) => {
                            let message =
                                format!("{} has been added to your emergency contacts", contact.name);
                            info!(contact = %contact.id, "contact added");
                            model.show_toast("Contact Added", message, ToastKind::Success);
                            Self::persist(StoredBlob::Contacts, model, caps);
                        }
                        Err(e) => Self::reject(e.into(), model),
                    }
                    caps.render.render();
                }

                Event::RemoveContactRequested { id } => {
                    match model.remove_contact(&id) {
                        Ok(_) => {
                            info!(contact = %id, "contact removed");
                            Self::persist(StoredBlob::Contacts, model, caps);
                        }
                        Err(e) => Self::reject(e.into(), model),
                    }
                    caps.render.render();
                }

                Event::UpdateContactRequested { id, patch } => {
                    match model.update_contact(&id, &patch) {
                        Ok(()) => {
                            info!(contact = %id, "contact updated");
                            Self::persist(StoredBlob::Contacts, model, caps);
                        }
                        Err(e) => Self::reject(e.into(), model),
                    }
                    caps.render.render();
                }

                Event::AddJournalEntryRequested { content } => {
                    match model.add_journal_entry(&content, UnixTimeMs::now()) {
                        Ok(entry) => {
                            info!(entry = %entry.id, "journal entry added");
                            model.show_toast(
                                "Math Log Added",
                                "Your math problem has been saved",
                                ToastKind::Success,
                            );
                            Self::persist(StoredBlob::Journal, model, caps);
                        }
                        Err(e) => Self::reject(e.into(), model),
                    }
                    caps.render.render();
                }

                Event::RemoveJournalEntryRequested { id } => {
                    match model.remove_journal_entry(&id) {
                        Ok(_) => {
                            info!(entry = %id, "journal entry removed");
                            Self::persist(StoredBlob::Journal, model, caps);
                        }
                        Err(e) => Self::reject(e.into(), model),
                    }
                    caps.render.render();
                }

                Event::UpdateSettingsRequested(patch) => {
                    match model.apply_settings_patch(&patch) {
                        Ok(()) => {
                            info!(
                                pin_changed = patch.trigger_pin.is_some(),
                                shake = model.settings.shake_trigger_enabled,
                                auto_record = model.settings.auto_record_enabled,
                                "settings updated"
                            );
                            Self::settings_toast(&patch, model);
                            Self::persist(StoredBlob::Settings, model, caps);
                            Self::sync_shake_listener(model, caps);
                        }
                        Err(e) => Self::reject(e.into(), model),
                    }
                    caps.render.render();
                }

                Event::SetupCompleted => {
                    let patch = SettingsPatch {
                        setup_completed: Some(true),
                        ..SettingsPatch::default()
                    };
                    match model.apply_settings_patch(&patch) {
                        Ok(()) => {
                            info!("setup completed");
                            model.show_toast(
                                "Setup Complete",
                                "Your emergency alert system is now ready",
                                ToastKind::Success,
                            );
                            Self::persist(StoredBlob::Settings, model, caps);
                        }
                        Err(e) => Self::reject(e.into(), model),
                    }
                    caps.render.render();
                }
            }
        }

        fn view(&self, model: &Model) -> ViewModel {
            let state = model.calculator.state();

            ViewModel {
                calculator: CalculatorView {
                    display: state.display().to_owned(),
                    memory: state.memory(),
                    operation: state.operation().map(|op| op.symbol().to_owned()),
                    capturing_contact: model.calculator.is_capturing_contact(),
                },
                is_calculator_mode: model.is_calculator_mode,
                show_navigation: !model.is_calculator_mode,
                setup_completed: model.settings.setup_completed,
                is_loading: !model.persistence.is_hydrated(),
                contacts: model
                    .contacts
                    .iter()
                    .map(|c| ContactView {
                        id: c.id.to_string(),
                        name: c.name.clone(),
                        phone: c.phone.clone(),
                        has_trigger_pin: c.trigger_pin.is_some(),
                    })
                    .collect(),
                journal: model
                    .journal
                    .iter()
                    .map(|e| JournalEntryView {
                        id: e.id.to_string(),
                        date: e.date.clone(),
                        content: e.content.clone(),
                        timestamp_ms: e.timestamp.as_millis(),
                    })
                    .collect(),
                settings: SettingsView {
                    setup_completed: model.settings.setup_completed,
                    trigger_pin_set: model.settings.trigger_pin.is_some(),
                    shake_trigger_enabled: model.settings.shake_trigger_enabled,
                    auto_record_enabled: model.settings.auto_record_enabled,
                },
                is_recording: model.recorder.is_active(),
                last_recording: model.recorder.last_clip().map(|c| c.uri.clone()),
                current_location: model.current_location,
                last_alert: model.last_alert().map(AlertView::from),
                toast: model.active_toast.as_ref().map(ToastView::from),
                error: model.active_error.as_ref().map(UserFacingError::from),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod error_tests {
        use super::*;

        #[test]
        fn no_error_kind_is_fatal() {
            let err = AppError::new(ErrorKind::Internal, "boom");
            assert_eq!(err.severity, ErrorSeverity::Permanent);
            let err = AppError::new(ErrorKind::Storage, "disk");
            assert_eq!(err.severity, ErrorSeverity::Transient);
            assert!(err.is_retryable());
        }

        #[test]
        fn short_pin_message_is_user_facing() {
            let err = AppError::from(PinError::TooShort { len: 2, min: 4 });
            assert_eq!(err.kind, ErrorKind::Configuration);
            assert_eq!(err.user_facing_message(), "PIN must be at least 4 digits");
        }

        #[test]
        fn divide_by_zero_maps_to_invalid_input() {
            let err = AppError::from(ArithmeticError::DivideByZero);
            assert_eq!(err.code(), "INVALID_INPUT");
            assert_eq!(err.user_facing_message(), "Cannot divide by zero");
        }

        #[test]
        fn permission_errors_are_distinguished() {
            assert_eq!(
                AppError::from(LocationError::PermissionDenied).kind,
                ErrorKind::LocationPermissionDenied
            );
            assert_eq!(
                AppError::from(LocationError::Timeout).kind,
                ErrorKind::LocationUnavailable
            );
            assert_eq!(
                AppError::from(AudioError::PermissionDenied).kind,
                ErrorKind::MicrophonePermissionDenied
            );
        }

        #[test]
        fn storage_errors_keep_detail_internal() {
            let err = AppError::from(KvError::Timeout { timeout_ms: 50 });
            assert_eq!(err.kind, ErrorKind::Storage);
            assert!(err.internal_message.unwrap().contains("50ms"));
        }

        #[test]
        fn display_includes_code_and_internal() {
            let err = AppError::new(ErrorKind::NotFound, "gone").with_internal("id=7");
            assert_eq!(err.to_string(), "[NOT_FOUND] gone (internal: id=7)");
        }
    }

    mod coordinate_tests {
        use super::*;

        #[test]
        fn rejects_out_of_range_and_non_finite() {
            assert!(matches!(
                Coordinates::new(91.0, 0.0),
                Err(CoordinateError::LatitudeOutOfRange(_))
            ));
            assert!(matches!(
                Coordinates::new(0.0, -181.0),
                Err(CoordinateError::LongitudeOutOfRange(_))
            ));
            assert_eq!(
                Coordinates::new(f64::NAN, 0.0),
                Err(CoordinateError::NonFinite)
            );
        }

        #[test]
        fn converts_position_and_drops_bad_accuracy() {
            let c = Coordinates::try_from(Position {
                latitude: 51.5,
                longitude: -0.12,
                accuracy_m: Some(-3.0),
            })
            .unwrap();
            assert_eq!(c.latitude(), 51.5);
            assert_eq!(c.accuracy_m(), None);
        }
    }

    mod time_tests {
        use super::*;

        #[test]
        fn iso_8601_is_utc_with_millis() {
            assert_eq!(UnixTimeMs(0).to_iso_8601(), "1970-01-01T00:00:00.000Z");
            assert_eq!(
                UnixTimeMs(1_709_285_400_123).to_iso_8601(),
                "2024-03-01T09:30:00.123Z"
            );
        }

        #[test]
        fn toast_expiry_uses_kind_duration() {
            let toast = ToastMessage::new("t", "m", ToastKind::Success);
            assert!(!toast.is_expired(toast.created_at_ms + 2000));
            assert!(toast.is_expired(toast.created_at_ms + 2001));
        }
    }

    #[test]
    fn default_config_matches_constants() {
        let config = CoreConfig::default();
        assert_eq!(config.long_press_ms, 1500);
        assert_eq!(config.auto_stop_recording_ms, 30_000);
        assert_eq!(config.location_refresh_interval_ms, 60_000);
        assert_eq!(config.max_alert_history, MAX_ALERT_HISTORY);
    }
}
