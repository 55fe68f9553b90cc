use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::VecDeque;
use std::fmt;
use thiserror::Error;
use tracing::warn;

use crate::calculator::{CalculatorEngine, PressId, TriggerTable};
use crate::capabilities::TimerId;
use crate::event::{ContactId, EntryId, Pin, PinError, Secret};
use crate::motion::ShakeDetector;
use crate::recorder::Recorder;
use crate::store::{LoadedBlob, PersistenceState, StoredBlob};
use crate::{
    get_current_time_ms, AppError, Coordinates, CoreConfig, ToastKind, ToastMessage, UnixTimeMs,
    MAX_CONTACTS, MAX_CONTACT_NAME_CHARS, MAX_JOURNAL_ENTRIES, MAX_JOURNAL_ENTRY_CHARS,
    MAX_PHONE_CHARS,
};

// --- Alerts ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertTrigger {
    Pin,
    ContactPin,
    EmergencyContactSequence,
    LongPress,
    Shake,
    Manual,
}

impl AlertTrigger {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pin => "pin",
            Self::ContactPin => "contact_pin",
            Self::EmergencyContactSequence => "emergency_contact_sequence",
            Self::LongPress => "long_press",
            Self::Shake => "shake",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for AlertTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AlertId(pub u64);

impl fmt::Display for AlertId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "alert-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    /// Waiting for a location fix.
    Locating,
    Dispatched,
    /// Sent without a location.
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: AlertId,
    pub trigger: AlertTrigger,
    pub contact_id: Option<ContactId>,
    pub contact_name: Option<String>,
    pub location: Option<Coordinates>,
    pub raised_at: UnixTimeMs,
    pub status: AlertStatus,
}

// --- Settings ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub setup_completed: bool,
    #[serde(serialize_with = "pin_or_empty", deserialize_with = "lenient_pin")]
    pub trigger_pin: Option<Pin>,
    pub shake_trigger_enabled: bool,
    pub auto_record_enabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            setup_completed: false,
            trigger_pin: None,
            shake_trigger_enabled: true,
            auto_record_enabled: true,
        }
    }
}

impl Settings {
    /// Returns the patched settings, or the first validation failure. `self`
    /// is left untouched either way.
    pub fn patched(&self, patch: &SettingsPatch) -> Result<Self, PinError> {
        let trigger_pin = match &patch.trigger_pin {
            Some(raw) => Some(Pin::parse(raw.expose())?),
            None => self.trigger_pin.clone(),
        };
        Ok(Self {
            setup_completed: patch.setup_completed.unwrap_or(self.setup_completed),
            trigger_pin,
            shake_trigger_enabled: patch
                .shake_trigger_enabled
                .unwrap_or(self.shake_trigger_enabled),
            auto_record_enabled: patch.auto_record_enabled.unwrap_or(self.auto_record_enabled),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsPatch {
    pub setup_completed: Option<bool>,
    pub trigger_pin: Option<Secret>,
    pub shake_trigger_enabled: Option<bool>,
    pub auto_record_enabled: Option<bool>,
}

impl SettingsPatch {
    /// Overlays the fields set in `later`.
    pub fn merge_from(&mut self, later: &SettingsPatch) {
        if later.setup_completed.is_some() {
            self.setup_completed = later.setup_completed;
        }
        if later.trigger_pin.is_some() {
            self.trigger_pin.clone_from(&later.trigger_pin);
        }
        if later.shake_trigger_enabled.is_some() {
            self.shake_trigger_enabled = later.shake_trigger_enabled;
        }
        if later.auto_record_enabled.is_some() {
            self.auto_record_enabled = later.auto_record_enabled;
        }
    }
}

fn pin_or_empty<S: Serializer>(pin: &Option<Pin>, serializer: S) -> Result<S::Ok, S::Error> {
    match pin {
        Some(pin) => pin.serialize(serializer),
        None => serializer.serialize_str(""),
    }
}

/// Stored PINs that no longer validate are dropped rather than failing the
/// whole blob.
fn lenient_pin<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Pin>, D::Error> {
    let raw = Option::<Secret>::deserialize(deserializer)?;
    Ok(raw.and_then(|raw| {
        if raw.expose().trim().is_empty() {
            return None;
        }
        Pin::parse(raw.expose())
            .inspect_err(|e| warn!(error = %e, "ignoring stored trigger PIN"))
            .ok()
    }))
}

// --- Contacts ---

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ContactError {
    #[error("Name and phone number are required")]
    MissingFields,
    #[error("Phone number may only contain digits, spaces and + - ( )")]
    InvalidPhone,
    #[error("{field} is longer than {max} characters")]
    TooLong { field: &'static str, max: usize },
    #[error(transparent)]
    InvalidPin(#[from] PinError),
    #[error("At most {max} emergency contacts can be saved")]
    LimitReached { max: usize },
    #[error("Contact {0} not found")]
    NotFound(ContactId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyContact {
    pub id: ContactId,
    pub name: String,
    pub phone: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_pin"
    )]
    pub trigger_pin: Option<Pin>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewContact {
    pub name: String,
    pub phone: String,
    #[serde(default)]
    pub trigger_pin: Option<Secret>,
}

impl NewContact {
    pub fn into_contact(self, id: ContactId) -> Result<EmergencyContact, ContactError> {
        Ok(EmergencyContact {
            id,
            name: validate_name(&self.name)?,
            phone: validate_phone(&self.phone)?,
            trigger_pin: optional_pin(self.trigger_pin.as_ref())?,
        })
    }
}

/// Fields left `None` are kept. An empty `trigger_pin` removes the contact's PIN.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContactPatch {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub trigger_pin: Option<Secret>,
}

impl ContactPatch {
    pub fn apply_to(&self, contact: &EmergencyContact) -> Result<EmergencyContact, ContactError> {
        Ok(EmergencyContact {
            id: contact.id.clone(),
            name: match &self.name {
                Some(name) => validate_name(name)?,
                None => contact.name.clone(),
            },
            phone: match &self.phone {
                Some(phone) => validate_phone(phone)?,
                None => contact.phone.clone(),
            },
            trigger_pin: match &self.trigger_pin {
                Some(raw) => optional_pin(Some(raw))?,
                None => contact.trigger_pin.clone(),
            },
        })
    }
}

fn validate_name(raw: &str) -> Result<String, ContactError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(ContactError::MissingFields);
    }
    if name.chars().count() > MAX_CONTACT_NAME_CHARS {
        return Err(ContactError::TooLong {
            field: "Name",
            max: MAX_CONTACT_NAME_CHARS,
        });
    }
    Ok(name.to_owned())
}

fn validate_phone(raw: &str) -> Result<String, ContactError> {
    let phone = raw.trim();
    if phone.is_empty() {
        return Err(ContactError::MissingFields);
    }
    if phone.chars().count() > MAX_PHONE_CHARS {
        return Err(ContactError::TooLong {
            field: "Phone number",
            max: MAX_PHONE_CHARS,
        });
    }
    let allowed = |c: char| c.is_ascii_digit() || matches!(c, ' ' | '+' | '-' | '(' | ')');
    if !phone.chars().all(allowed) || !phone.chars().any(|c| c.is_ascii_digit()) {
        return Err(ContactError::InvalidPhone);
    }
    Ok(phone.to_owned())
}

fn optional_pin(raw: Option<&Secret>) -> Result<Option<Pin>, PinError> {
    match raw {
        Some(raw) if !raw.expose().trim().is_empty() => Pin::parse(raw.expose()).map(Some),
        _ => Ok(None),
    }
}

// --- Journal ---

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JournalError {
    #[error("Math problem cannot be empty")]
    Empty,
    #[error("Journal entry is too long ({len} characters, max {max})")]
    TooLong { len: usize, max: usize },
    #[error("Journal entry {0} not found")]
    NotFound(EntryId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: EntryId,
    /// ISO-8601, UTC.
    pub date: String,
    pub content: String,
    pub timestamp: UnixTimeMs,
}

impl JournalEntry {
    pub fn new(content: &str, now: UnixTimeMs) -> Result<Self, JournalError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(JournalError::Empty);
        }
        let len = content.chars().count();
        if len > MAX_JOURNAL_ENTRY_CHARS {
            return Err(JournalError::TooLong {
                len,
                max: MAX_JOURNAL_ENTRY_CHARS,
            });
        }
        Ok(Self {
            id: EntryId::generate(),
            date: now.to_iso_8601(),
            content: content.to_owned(),
            timestamp: now,
        })
    }
}

// --- Model ---

#[derive(Debug)]
pub struct Model {
    pub config: CoreConfig,
    pub calculator: CalculatorEngine,
    pub is_calculator_mode: bool,
    pub settings: Settings,
    pub contacts: Vec<EmergencyContact>,
    pub journal: Vec<JournalEntry>,
    pub persistence: PersistenceState,
    pub recorder: Recorder,
    pub shake: ShakeDetector,
    pub current_location: Option<Coordinates>,
    pub alerts: VecDeque<AlertRecord>,
    pub long_press_timer: Option<(PressId, TimerId)>,
    pub active_error: Option<AppError>,
    pub active_toast: Option<ToastMessage>,
    pub view_timestamp_ms: u64,
    next_alert: u64,
    next_timer: u64,
    captured_contacts: u32,
    /// Settings changed before the stored settings arrived.
    unsynced_settings: SettingsPatch,
}

impl Default for Model {
    fn default() -> Self {
        Self::with_config(CoreConfig::default())
    }
}

impl Model {
    #[must_use]
    pub fn with_config(config: CoreConfig) -> Self {
        Self {
            shake: ShakeDetector::new(config.shake),
            config,
            calculator: CalculatorEngine::default(),
            is_calculator_mode: true,
            settings: Settings::default(),
            contacts: Vec::new(),
            journal: Vec::new(),
            persistence: PersistenceState::default(),
            recorder: Recorder::default(),
            current_location: None,
            alerts: VecDeque::new(),
            long_press_timer: None,
            active_error: None,
            active_toast: None,
            view_timestamp_ms: get_current_time_ms(),
            next_alert: 0,
            next_timer: 0,
            captured_contacts: 0,
            unsynced_settings: SettingsPatch::default(),
        }
    }

    pub fn update_timestamp(&mut self) {
        self.view_timestamp_ms = get_current_time_ms();
    }

    pub fn set_error(&mut self, error: AppError) {
        self.active_error = Some(error);
    }

    pub fn clear_error(&mut self) {
        self.active_error = None;
    }

    pub fn show_toast(
        &mut self,
        title: impl Into<String>,
        message: impl Into<String>,
        kind: ToastKind,
    ) {
        self.active_toast = Some(ToastMessage::new(title, message, kind));
    }

    pub fn clear_toast(&mut self) {
        self.active_toast = None;
    }

    pub fn next_timer_id(&mut self) -> TimerId {
        self.next_timer += 1;
        TimerId(self.next_timer)
    }

    /// What the keypad detector currently matches against.
    #[must_use]
    pub fn trigger_table(&self) -> TriggerTable {
        TriggerTable {
            alert_pin: self.settings.trigger_pin.clone(),
            contact_pins: self
                .contacts
                .iter()
                .filter_map(|c| c.trigger_pin.clone().map(|pin| (c.id.clone(), pin)))
                .collect(),
            first_contact: self.contacts.first().map(|c| c.id.clone()),
        }
    }

    #[must_use]
    pub fn contact(&self, id: &ContactId) -> Option<&EmergencyContact> {
        self.contacts.iter().find(|c| &c.id == id)
    }

    /// Rejects a contact PIN that overlaps the alert PIN or another contact's.
    fn check_contact_pin(
        &self,
        pin: Option<&Pin>,
        except: Option<&ContactId>,
    ) -> Result<(), PinError> {
        let Some(pin) = pin else {
            return Ok(());
        };
        let clashes = self
            .settings
            .trigger_pin
            .iter()
            .chain(
                self.contacts
                    .iter()
                    .filter(|c| Some(&c.id) != except)
                    .filter_map(|c| c.trigger_pin.as_ref()),
            )
            .any(|other| pin.overlaps(other));
        if clashes {
            Err(PinError::Overlaps)
        } else {
            Ok(())
        }
    }

    pub fn add_contact(&mut self, new: NewContact) -> Result<&EmergencyContact, ContactError> {
        if self.contacts.len() >= MAX_CONTACTS {
            return Err(ContactError::LimitReached { max: MAX_CONTACTS });
        }
        let contact = new.into_contact(ContactId::generate())?;
        self.check_contact_pin(contact.trigger_pin.as_ref(), None)?;
        self.contacts.push(contact);
        Ok(&self.contacts[self.contacts.len() - 1])
    }

    /// Adds a contact typed on the keypad, named `Contact N`.
    pub fn add_captured_contact(
        &mut self,
        phone: String,
    ) -> Result<&EmergencyContact, ContactError> {
        let name = format!("Contact {}", self.captured_contacts + 1);
        self.add_contact(NewContact {
            name,
            phone,
            trigger_pin: None,
        })?;
        self.captured_contacts += 1;
        Ok(&self.contacts[self.contacts.len() - 1])
    }

    pub fn update_contact(
        &mut self,
        id: &ContactId,
        patch: &ContactPatch,
    ) -> Result<(), ContactError> {
        let index = self
            .contacts
            .iter()
            .position(|c| &c.id == id)
            .ok_or_else(|| ContactError::NotFound(id.clone()))?;
        let updated = patch.apply_to(&self.contacts[index])?;
        self.check_contact_pin(updated.trigger_pin.as_ref(), Some(id))?;
        self.contacts[index] = updated;
        Ok(())
    }

    pub fn remove_contact(&mut self, id: &ContactId) -> Result<EmergencyContact, ContactError> {
        let index = self
            .contacts
            .iter()
            .position(|c| &c.id == id)
            .ok_or_else(|| ContactError::NotFound(id.clone()))?;
        Ok(self.contacts.remove(index))
    }

    /// Newest first; the oldest entries past the cap are evicted.
    pub fn add_journal_entry(
        &mut self,
        content: &str,
        now: UnixTimeMs,
    ) -> Result<&JournalEntry, JournalError> {
        let entry = JournalEntry::new(content, now)?;
        self.journal.insert(0, entry);
        self.journal.truncate(MAX_JOURNAL_ENTRIES);
        Ok(&self.journal[0])
    }

    pub fn remove_journal_entry(&mut self, id: &EntryId) -> Result<JournalEntry, JournalError> {
        let index = self
            .journal
            .iter()
            .position(|e| &e.id == id)
            .ok_or_else(|| JournalError::NotFound(id.clone()))?;
        Ok(self.journal.remove(index))
    }

    /// Validates and applies a settings change. A new alert PIN may not
    /// overlap any contact PIN.
    pub fn apply_settings_patch(&mut self, patch: &SettingsPatch) -> Result<(), PinError> {
        let settings = self.settings.patched(patch)?;
        if let (Some(_), Some(pin)) = (&patch.trigger_pin, &settings.trigger_pin) {
            let clashes = self
                .contacts
                .iter()
                .filter_map(|c| c.trigger_pin.as_ref())
                .any(|other| pin.overlaps(other));
            if clashes {
                return Err(PinError::Overlaps);
            }
        }
        if !self.persistence.is_loaded(StoredBlob::Settings) {
            self.unsynced_settings.merge_from(patch);
        }
        self.settings = settings;
        Ok(())
    }

    /// Installs a stored blob when nothing changed locally.
    pub fn replace_stored(&mut self, loaded: LoadedBlob) {
        match loaded {
            LoadedBlob::Contacts(contacts) => self.contacts = contacts,
            LoadedBlob::Journal(entries) => self.journal = entries,
            LoadedBlob::Settings(settings) => {
                self.settings = settings;
                self.unsynced_settings = SettingsPatch::default();
            }
        }
    }

    /// Folds in a stored blob that arrived after local changes. Stored records
    /// missing locally are kept; local records and locally set fields win.
    pub fn merge_stored(&mut self, loaded: LoadedBlob) {
        match loaded {
            LoadedBlob::Contacts(stored) => {
                let mut merged: Vec<_> = stored
                    .into_iter()
                    .filter(|s| self.contact(&s.id).is_none())
                    .collect();
                merged.append(&mut self.contacts);
                if merged.len() > MAX_CONTACTS {
                    warn!(count = merged.len(), max = MAX_CONTACTS, "truncating merged contacts");
                    merged.truncate(MAX_CONTACTS);
                }
                self.contacts = merged;
            }
            LoadedBlob::Journal(stored) => {
                let missing: Vec<_> = stored
                    .into_iter()
                    .filter(|s| self.journal.iter().all(|e| e.id != s.id))
                    .collect();
                self.journal.extend(missing);
                self.journal.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
                self.journal.truncate(MAX_JOURNAL_ENTRIES);
            }
            LoadedBlob::Settings(stored) => {
                let local = std::mem::take(&mut self.unsynced_settings);
                match stored.patched(&local) {
                    Ok(settings) => self.settings = settings,
                    Err(e) => warn!(error = %e, "stored settings could not take local changes"),
                }
            }
        }
    }

    /// Records a new alert in `Locating` state.
    pub fn open_alert(&mut self, trigger: AlertTrigger, contact_id: Option<ContactId>) -> AlertId {
        self.next_alert += 1;
        let id = AlertId(self.next_alert);
        let contact_name = contact_id
            .as_ref()
            .and_then(|cid| self.contact(cid))
            .map(|c| c.name.clone());
        self.alerts.push_back(AlertRecord {
            id,
            trigger,
            contact_id,
            contact_name,
            location: None,
            raised_at: UnixTimeMs::now(),
            status: AlertStatus::Locating,
        });
        while self.alerts.len() > self.config.max_alert_history {
            self.alerts.pop_front();
        }
        id
    }

    pub fn alert_mut(&mut self, id: AlertId) -> Option<&mut AlertRecord> {
        self.alerts.iter_mut().find(|a| a.id == id)
    }

    #[must_use]
    pub fn last_alert(&self) -> Option<&AlertRecord> {
        self.alerts.back()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_contact(name: &str, phone: &str, pin: Option<&str>) -> NewContact {
        NewContact {
            name: name.into(),
            phone: phone.into(),
            trigger_pin: pin.map(Secret::new),
        }
    }

    mod settings_tests {
        use super::*;

        #[test]
        fn defaults_enable_shake_and_auto_record() {
            let settings = Settings::default();
            assert!(!settings.setup_completed);
            assert!(settings.trigger_pin.is_none());
            assert!(settings.shake_trigger_enabled);
            assert!(settings.auto_record_enabled);
        }

        #[test]
        fn serializes_with_camel_case_and_empty_pin() {
            let json = serde_json::to_value(Settings::default()).unwrap();
            assert_eq!(json["setupCompleted"], false);
            assert_eq!(json["triggerPin"], "");
            assert_eq!(json["shakeTriggerEnabled"], true);
            assert_eq!(json["autoRecordEnabled"], true);
        }

        #[test]
        fn missing_fields_fall_back_to_defaults() {
            let settings: Settings =
                serde_json::from_str(r#"{"setupCompleted":true,"triggerPin":"9876"}"#).unwrap();
            assert!(settings.setup_completed);
            assert_eq!(settings.trigger_pin, Some(Pin::parse("9876").unwrap()));
            assert!(settings.shake_trigger_enabled);
        }

        #[test]
        fn invalid_stored_pin_is_dropped() {
            let settings: Settings = serde_json::from_str(r#"{"triggerPin":"12"}"#).unwrap();
            assert!(settings.trigger_pin.is_none());
            let settings: Settings = serde_json::from_str(r#"{"triggerPin":""}"#).unwrap();
            assert!(settings.trigger_pin.is_none());
        }

        #[test]
        fn patch_rejects_short_pin_without_changes() {
            let settings = Settings::default();
            let patch = SettingsPatch {
                trigger_pin: Some(Secret::new("12")),
                shake_trigger_enabled: Some(false),
                ..SettingsPatch::default()
            };
            assert!(matches!(
                settings.patched(&patch),
                Err(PinError::TooShort { .. })
            ));
            assert!(settings.shake_trigger_enabled);
        }

        #[test]
        fn patch_merges_fields() {
            let patch = SettingsPatch {
                trigger_pin: Some(Secret::new("2580")),
                auto_record_enabled: Some(false),
                ..SettingsPatch::default()
            };
            let settings = Settings::default().patched(&patch).unwrap();
            assert_eq!(settings.trigger_pin, Some(Pin::parse("2580").unwrap()));
            assert!(!settings.auto_record_enabled);
            assert!(settings.shake_trigger_enabled);
        }
    }

    mod contact_tests {
        use super::*;

        #[test]
        fn requires_name_and_phone() {
            let mut model = Model::default();
            assert_eq!(
                model.add_contact(new_contact("  ", "123", None)).unwrap_err(),
                ContactError::MissingFields
            );
            assert_eq!(
                model.add_contact(new_contact("Ann", "", None)).unwrap_err(),
                ContactError::MissingFields
            );
            assert_eq!(
                ContactError::MissingFields.to_string(),
                "Name and phone number are required"
            );
        }

        #[test]
        fn trims_and_validates_phone() {
            let mut model = Model::default();
            let contact = model
                .add_contact(new_contact(" Ann ", " +44 (0)20 7946-0018 ", None))
                .unwrap();
            assert_eq!(contact.name, "Ann");
            assert_eq!(contact.phone, "+44 (0)20 7946-0018");
            assert_eq!(
                model.add_contact(new_contact("Bob", "call me", None)).unwrap_err(),
                ContactError::InvalidPhone
            );
        }

        #[test]
        fn validates_optional_pin() {
            let mut model = Model::default();
            assert!(matches!(
                model.add_contact(new_contact("Ann", "123", Some("12"))),
                Err(ContactError::InvalidPin(PinError::TooShort { .. }))
            ));
            let contact = model.add_contact(new_contact("Ann", "123", Some(""))).unwrap();
            assert!(contact.trigger_pin.is_none());
        }

        #[test]
        fn enforces_contact_limit() {
            let mut model = Model::default();
            for i in 0..MAX_CONTACTS {
                model
                    .add_contact(new_contact(&format!("C{i}"), "123", None))
                    .unwrap();
            }
            assert_eq!(
                model.add_contact(new_contact("One more", "123", None)).unwrap_err(),
                ContactError::LimitReached { max: MAX_CONTACTS }
            );
        }

        #[test]
        fn captured_contacts_get_numbered_names() {
            let mut model = Model::default();
            model.add_captured_contact("111".into()).unwrap();
            let second = model.add_captured_contact("222".into()).unwrap();
            assert_eq!(second.name, "Contact 2");
        }

        #[test]
        fn update_applies_patch_atomically() {
            let mut model = Model::default();
            let id = model.add_contact(new_contact("Ann", "123", None)).unwrap().id.clone();

            let bad = ContactPatch {
                name: Some("Annie".into()),
                phone: Some("".into()),
                ..ContactPatch::default()
            };
            assert!(model.update_contact(&id, &bad).is_err());
            assert_eq!(model.contact(&id).unwrap().name, "Ann");

            let good = ContactPatch {
                name: Some("Annie".into()),
                trigger_pin: Some(Secret::new("4455")),
                ..ContactPatch::default()
            };
            model.update_contact(&id, &good).unwrap();
            let contact = model.contact(&id).unwrap();
            assert_eq!(contact.name, "Annie");
            assert_eq!(contact.phone, "123");
            assert!(contact.trigger_pin.is_some());
        }

        #[test]
        fn rejects_pins_shadowed_by_another_pin() {
            let mut model = Model::default();
            let alert_pin = SettingsPatch {
                trigger_pin: Some(Secret::new("2580")),
                ..SettingsPatch::default()
            };
            model.apply_settings_patch(&alert_pin).unwrap();

            assert_eq!(
                model
                    .add_contact(new_contact("Ann", "1", Some("12580")))
                    .unwrap_err(),
                ContactError::InvalidPin(PinError::Overlaps)
            );
            let bob = model
                .add_contact(new_contact("Bob", "2", Some("7777")))
                .unwrap()
                .id
                .clone();
            assert!(model.add_contact(new_contact("Cy", "3", Some("17777"))).is_err());

            let same_pin = ContactPatch {
                trigger_pin: Some(Secret::new("7777")),
                ..ContactPatch::default()
            };
            model.update_contact(&bob, &same_pin).unwrap();

            let clashing_alert_pin = SettingsPatch {
                trigger_pin: Some(Secret::new("97777")),
                ..SettingsPatch::default()
            };
            assert_eq!(
                model.apply_settings_patch(&clashing_alert_pin),
                Err(PinError::Overlaps)
            );
            assert_eq!(model.settings.trigger_pin, Some(Pin::parse("2580").unwrap()));
        }

        #[test]
        fn remove_unknown_contact_is_not_found() {
            let mut model = Model::default();
            let id = ContactId::new("missing");
            assert_eq!(
                model.remove_contact(&id).unwrap_err(),
                ContactError::NotFound(id)
            );
        }

        #[test]
        fn trigger_table_lists_first_contact_and_pins() {
            let mut model = Model::default();
            let first = model.add_contact(new_contact("Ann", "1", None)).unwrap().id.clone();
            let second = model
                .add_contact(new_contact("Bob", "2", Some("7777")))
                .unwrap()
                .id
                .clone();
            let table = model.trigger_table();
            assert_eq!(table.first_contact, Some(first));
            assert_eq!(table.contact_pins.len(), 1);
            assert_eq!(table.contact_pins[0].0, second);
        }

        #[test]
        fn contact_serializes_camel_case_without_empty_pin() {
            let contact = new_contact("Ann", "123", Some("4321"))
                .into_contact(ContactId::new("c1"))
                .unwrap();
            let json = serde_json::to_value(&contact).unwrap();
            assert_eq!(json["triggerPin"], "4321");

            let plain = new_contact("Bob", "456", None)
                .into_contact(ContactId::new("c2"))
                .unwrap();
            let json = serde_json::to_value(&plain).unwrap();
            assert!(json.get("triggerPin").is_none());
        }
    }

    mod journal_tests {
        use super::*;

        #[test]
        fn entries_are_newest_first_with_iso_date() {
            let mut model = Model::default();
            model.add_journal_entry("first", UnixTimeMs(1_000)).unwrap();
            let entry = model
                .add_journal_entry("second", UnixTimeMs(1_700_000_000_000))
                .unwrap();
            assert_eq!(entry.date, "2023-11-14T22:13:20.000Z");
            assert_eq!(model.journal[0].content, "second");
            assert_eq!(model.journal[1].content, "first");
        }

        #[test]
        fn rejects_empty_and_oversized_content() {
            let mut model = Model::default();
            assert_eq!(
                model.add_journal_entry("   ", UnixTimeMs(0)).unwrap_err(),
                JournalError::Empty
            );
            let long = "x".repeat(MAX_JOURNAL_ENTRY_CHARS + 1);
            assert!(matches!(
                model.add_journal_entry(&long, UnixTimeMs(0)),
                Err(JournalError::TooLong { .. })
            ));
        }

        #[test]
        fn evicts_oldest_past_cap() {
            let mut model = Model::default();
            for i in 0..=MAX_JOURNAL_ENTRIES {
                model
                    .add_journal_entry(&format!("entry {i}"), UnixTimeMs(i as u64))
                    .unwrap();
            }
            assert_eq!(model.journal.len(), MAX_JOURNAL_ENTRIES);
            assert_eq!(model.journal.last().unwrap().content, "entry 1");
        }
    }

    mod stored_blob_tests {
        use super::*;

        fn stored_contact(id: &str, name: &str) -> EmergencyContact {
            EmergencyContact {
                id: ContactId::new(id),
                name: name.into(),
                phone: "111".into(),
                trigger_pin: None,
            }
        }

        #[test]
        fn merged_contacts_keep_stored_ones_first() {
            let mut model = Model::default();
            model.add_contact(new_contact("Ann", "1", None)).unwrap();
            let ann = model.contacts[0].clone();

            model.merge_stored(LoadedBlob::Contacts(vec![
                stored_contact("old", "Old"),
                ann.clone(),
            ]));

            let names: Vec<_> = model.contacts.iter().map(|c| c.name.as_str()).collect();
            assert_eq!(names, ["Old", "Ann"]);
        }

        #[test]
        fn merged_journal_is_newest_first_without_duplicates() {
            let mut model = Model::default();
            model.add_journal_entry("local", UnixTimeMs(3_000)).unwrap();
            let local = model.journal[0].clone();
            let stored = JournalEntry::new("stored", UnixTimeMs(1_000)).unwrap();

            model.merge_stored(LoadedBlob::Journal(vec![local, stored]));

            let contents: Vec<_> = model.journal.iter().map(|e| e.content.as_str()).collect();
            assert_eq!(contents, ["local", "stored"]);
        }

        #[test]
        fn merged_settings_keep_only_local_fields() {
            let mut model = Model::default();
            let patch = SettingsPatch {
                shake_trigger_enabled: Some(false),
                ..SettingsPatch::default()
            };
            model.apply_settings_patch(&patch).unwrap();

            let stored = Settings {
                setup_completed: true,
                trigger_pin: Some(Pin::parse("4321").unwrap()),
                shake_trigger_enabled: true,
                auto_record_enabled: false,
            };
            model.merge_stored(LoadedBlob::Settings(stored));

            assert!(model.settings.setup_completed);
            assert_eq!(model.settings.trigger_pin, Some(Pin::parse("4321").unwrap()));
            assert!(!model.settings.shake_trigger_enabled);
            assert!(!model.settings.auto_record_enabled);
        }

        #[test]
        fn settings_changes_after_load_are_not_replayed() {
            let mut model = Model::default();
            model.persistence.finish_load(StoredBlob::Settings);
            let patch = SettingsPatch {
                auto_record_enabled: Some(false),
                ..SettingsPatch::default()
            };
            model.apply_settings_patch(&patch).unwrap();
            assert_eq!(model.unsynced_settings, SettingsPatch::default());
        }
    }

    mod alert_tests {
        use super::*;

        #[test]
        fn alert_history_is_bounded() {
            let mut model = Model::default();
            let cap = model.config.max_alert_history;
            for _ in 0..cap + 3 {
                model.open_alert(AlertTrigger::Manual, None);
            }
            assert_eq!(model.alerts.len(), cap);
            assert_eq!(model.last_alert().unwrap().id, AlertId(cap as u64 + 3));
        }

        #[test]
        fn alert_records_contact_name() {
            let mut model = Model::default();
            let id = model.add_contact(new_contact("Ann", "1", None)).unwrap().id.clone();
            let alert = model.open_alert(AlertTrigger::EmergencyContactSequence, Some(id));
            let record = model.alert_mut(alert).unwrap();
            assert_eq!(record.contact_name.as_deref(), Some("Ann"));
            assert_eq!(record.status, AlertStatus::Locating);
        }
    }
}
