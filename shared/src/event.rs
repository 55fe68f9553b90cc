use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroize;

use crate::calculator::{Key, PressId};
use crate::capabilities::{AudioResult, KvResult, LocationResult};
use crate::model::{AlertId, ContactPatch, NewContact, SettingsPatch};
use crate::motion::MotionSample;
use crate::recorder::RecordingSessionId;
use crate::store::StoredBlob;

// --- Secret wrapper ---

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

// --- Trigger PIN ---

pub const MIN_PIN_LENGTH: usize = 4;
/// A PIN longer than the sequence buffer could never be matched.
pub const MAX_PIN_LENGTH: usize = crate::SEQUENCE_BUFFER_CAPACITY;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PinError {
    #[error("PIN must be at least {min} digits")]
    TooShort { len: usize, min: usize },
    #[error("PIN must be at most {max} digits (got {len})")]
    TooLong { len: usize, max: usize },
    #[error("PIN may only contain the digits 0-9")]
    NotNumeric,
    #[error("PIN must not end with, or be the ending of, another emergency PIN")]
    Overlaps,
}

#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct Pin(String);

impl Pin {
    pub fn parse(raw: &str) -> Result<Self, PinError> {
        let raw = raw.trim();
        let len = raw.chars().count();
        if len < MIN_PIN_LENGTH {
            return Err(PinError::TooShort {
                len,
                min: MIN_PIN_LENGTH,
            });
        }
        if len > MAX_PIN_LENGTH {
            return Err(PinError::TooLong {
                len,
                max: MAX_PIN_LENGTH,
            });
        }
        if !raw.chars().all(|c| c.is_ascii_digit()) {
            return Err(PinError::NotNumeric);
        }
        Ok(Self(raw.to_owned()))
    }

    /// Digits in entry order.
    pub fn digits(&self) -> impl Iterator<Item = u8> + '_ {
        self.0.bytes().map(|b| b - b'0')
    }

    /// True when either PIN ends with the other. Detection matches on the
    /// buffer suffix, so the longer of the two could never fire.
    #[must_use]
    pub fn overlaps(&self, other: &Pin) -> bool {
        self.0.ends_with(&other.0) || other.0.ends_with(&self.0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<String> for Pin {
    type Error = PinError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl Serialize for Pin {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Pin([REDACTED])")
    }
}

impl Drop for Pin {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

// --- Typed IDs ---

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

typed_id!(ContactId);
typed_id!(EntryId);

// --- Events ---

#[derive(Serialize, Deserialize, Clone, Debug)]
pub enum Event {
    Noop,

    // Lifecycle
    AppStarted,
    StoredValueLoaded {
        blob: StoredBlob,
        result: Box<KvResult>,
    },
    StoredValueWritten {
        blob: StoredBlob,
        result: Box<KvResult>,
    },

    // Keypad
    KeyPressed {
        key: Key,
    },
    KeyHeld {
        key: Key,
    },
    KeyReleased,
    LongPressElapsed {
        press: PressId,
    },

    // Disguise
    CalculatorModeSet {
        enabled: bool,
    },
    ToastDismissed,
    ErrorDismissed,

    // Alerts
    AlertRequested {
        contact_id: Option<ContactId>,
    },
    AlertLocationResolved {
        alert: AlertId,
        result: Box<LocationResult>,
    },
    LocationRefreshDue,
    LocationRefreshed {
        result: Box<LocationResult>,
    },

    // Recording
    RecordingStartRequested,
    RecordingStopRequested,
    RecordingStarted {
        session: RecordingSessionId,
        result: Box<AudioResult>,
    },
    RecordingStopped {
        session: RecordingSessionId,
        result: Box<AudioResult>,
    },
    AutoStopElapsed {
        session: RecordingSessionId,
    },

    // Motion
    MotionSampled(MotionSample),

    // Contacts, journal, settings
    AddContactRequested(Box<NewContact>),
    RemoveContactRequested {
        id: ContactId,
    },
    UpdateContactRequested {
        id: ContactId,
        patch: Box<ContactPatch>,
    },
    AddJournalEntryRequested {
        content: String,
    },
    RemoveJournalEntryRequested {
        id: EntryId,
    },
    UpdateSettingsRequested(Box<SettingsPatch>),
    SetupCompleted,
}

impl Event {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Noop => "noop",
            Self::AppStarted => "app_started",
            Self::StoredValueLoaded { .. } => "stored_value_loaded",
            Self::StoredValueWritten { .. } => "stored_value_written",
            Self::KeyPressed { .. } => "key_pressed",
            Self::KeyHeld { .. } => "key_held",
            Self::KeyReleased => "key_released",
            Self::LongPressElapsed { .. } => "long_press_elapsed",
            Self::CalculatorModeSet { .. } => "calculator_mode_set",
            Self::ToastDismissed => "toast_dismissed",
            Self::ErrorDismissed => "error_dismissed",
            Self::AlertRequested { .. } => "alert_requested",
            Self::AlertLocationResolved { .. } => "alert_location_resolved",
            Self::LocationRefreshDue => "location_refresh_due",
            Self::LocationRefreshed { .. } => "location_refreshed",
            Self::RecordingStartRequested => "recording_start_requested",
            Self::RecordingStopRequested => "recording_stop_requested",
            Self::RecordingStarted { .. } => "recording_started",
            Self::RecordingStopped { .. } => "recording_stopped",
            Self::AutoStopElapsed { .. } => "auto_stop_elapsed",
            Self::MotionSampled(_) => "motion_sampled",
            Self::AddContactRequested(_) => "add_contact_requested",
            Self::RemoveContactRequested { .. } => "remove_contact_requested",
            Self::UpdateContactRequested { .. } => "update_contact_requested",
            Self::AddJournalEntryRequested { .. } => "add_journal_entry_requested",
            Self::RemoveJournalEntryRequested { .. } => "remove_journal_entry_requested",
            Self::UpdateSettingsRequested(_) => "update_settings_requested",
            Self::SetupCompleted => "setup_completed",
        }
    }

    /// Keypad and sensor traffic is high volume and must not show up in logs
    /// as user actions; a key log would reveal the PIN.
    #[must_use]
    pub const fn is_user_initiated(&self) -> bool {
        matches!(
            self,
            Self::CalculatorModeSet { .. }
                | Self::AlertRequested { .. }
                | Self::RecordingStartRequested
                | Self::RecordingStopRequested
                | Self::AddContactRequested(_)
                | Self::RemoveContactRequested { .. }
                | Self::UpdateContactRequested { .. }
                | Self::AddJournalEntryRequested { .. }
                | Self::RemoveJournalEntryRequested { .. }
                | Self::UpdateSettingsRequested(_)
                | Self::SetupCompleted
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_debug_is_redacted() {
        let s = Secret::new("2468");
        assert_eq!(format!("{s:?}"), "[REDACTED]");
    }

    #[test]
    fn pin_debug_is_redacted() {
        let pin = Pin::parse("2468").unwrap();
        assert_eq!(format!("{pin:?}"), "Pin([REDACTED])");
    }

    #[test]
    fn pin_rejects_short_values() {
        assert_eq!(
            Pin::parse("123"),
            Err(PinError::TooShort { len: 3, min: 4 })
        );
        assert!(Pin::parse("").is_err());
    }

    #[test]
    fn pin_rejects_values_longer_than_the_buffer() {
        assert!(matches!(
            Pin::parse("12345678901"),
            Err(PinError::TooLong { len: 11, .. })
        ));
        assert!(Pin::parse("1234567890").is_ok());
    }

    #[test]
    fn pin_rejects_non_digits() {
        assert_eq!(Pin::parse("12a4"), Err(PinError::NotNumeric));
        assert_eq!(Pin::parse("12+4"), Err(PinError::NotNumeric));
    }

    #[test]
    fn pin_trims_whitespace_and_exposes_digits() {
        let pin = Pin::parse(" 9071 ").unwrap();
        assert_eq!(pin.len(), 4);
        assert_eq!(pin.digits().collect::<Vec<_>>(), vec![9, 0, 7, 1]);
    }

    #[test]
    fn pins_overlap_when_one_ends_the_other() {
        let alert = Pin::parse("2580").unwrap();
        assert!(Pin::parse("12580").unwrap().overlaps(&alert));
        assert!(alert.overlaps(&Pin::parse("2580").unwrap()));
        assert!(alert.overlaps(&Pin::parse("912580").unwrap()));
        assert!(!alert.overlaps(&Pin::parse("25801").unwrap()));
    }

    #[test]
    fn pin_serializes_as_plain_string() {
        let pin = Pin::parse("4321").unwrap();
        assert_eq!(serde_json::to_string(&pin).unwrap(), "\"4321\"");
        let back: Pin = serde_json::from_str("\"4321\"").unwrap();
        assert_eq!(back, pin);
        assert!(serde_json::from_str::<Pin>("\"12\"").is_err());
    }

    #[test]
    fn typed_ids_serialize_transparently() {
        let id = ContactId::new("c-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"c-1\"");
        assert_ne!(ContactId::generate(), ContactId::generate());
    }

    #[test]
    fn keypad_events_are_not_user_actions() {
        assert!(!Event::KeyPressed { key: Key::Equals }.is_user_initiated());
        assert!(!Event::KeyReleased.is_user_initiated());
        assert!(Event::SetupCompleted.is_user_initiated());
    }

    #[test]
    fn event_size_is_reasonable() {
        let size = std::mem::size_of::<Event>();
        assert!(
            size <= 128,
            "Event enum is {size} bytes, box more variants"
        );
    }
}
