//! The three persisted blobs and their JSON encoding.
//!
//! The shell owns the actual store; the core reads and writes whole blobs by
//! key through the key-value capability. Blobs are plain JSON with no envelope
//! so existing installs keep loading.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;
use tracing::warn;

use crate::capabilities::{KvError, KvKey, KvOutput, MAX_VALUE_SIZE};
use crate::model::{EmergencyContact, JournalEntry, Settings};
use crate::{MAX_CONTACTS, MAX_JOURNAL_ENTRIES};

const CONTACTS_KEY: &str = "emergency_contacts";
const JOURNAL_KEY: &str = "journal_entries";
const SETTINGS_KEY: &str = "app_settings";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoredBlob {
    Contacts,
    Journal,
    Settings,
}

impl StoredBlob {
    pub const ALL: [Self; 3] = [Self::Contacts, Self::Journal, Self::Settings];

    #[must_use]
    pub const fn key_name(self) -> &'static str {
        match self {
            Self::Contacts => CONTACTS_KEY,
            Self::Journal => JOURNAL_KEY,
            Self::Settings => SETTINGS_KEY,
        }
    }

    pub fn key(self) -> Result<KvKey, KvError> {
        KvKey::new(self.key_name())
    }

    const fn index(self) -> usize {
        match self {
            Self::Contacts => 0,
            Self::Journal => 1,
            Self::Settings => 2,
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Kv(#[from] KvError),

    #[error("{blob:?} blob too large: {size} bytes, max {max}")]
    TooLarge {
        blob: StoredBlob,
        size: usize,
        max: usize,
    },

    #[error("unexpected storage response for {blob:?}")]
    UnexpectedOutput { blob: StoredBlob },
}

/// A decoded blob, ready to replace the model's copy.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadedBlob {
    Contacts(Vec<EmergencyContact>),
    Journal(Vec<JournalEntry>),
    Settings(Settings),
}

pub fn encode<T: Serialize + ?Sized>(blob: StoredBlob, value: &T) -> Result<Vec<u8>, StoreError> {
    let bytes = serde_json::to_vec(value)?;
    if bytes.len() > MAX_VALUE_SIZE {
        return Err(StoreError::TooLarge {
            blob,
            size: bytes.len(),
            max: MAX_VALUE_SIZE,
        });
    }
    Ok(bytes)
}

/// Decodes the answer to a `get`. `None` means nothing was stored yet.
pub fn decode(blob: StoredBlob, output: KvOutput) -> Result<Option<LoadedBlob>, StoreError> {
    let bytes = match output {
        KvOutput::Value(Some(bytes)) => bytes,
        KvOutput::Value(None) => return Ok(None),
        KvOutput::Written | KvOutput::Removed { .. } => {
            return Err(StoreError::UnexpectedOutput { blob })
        }
    };
    if bytes.len() > MAX_VALUE_SIZE {
        return Err(StoreError::TooLarge {
            blob,
            size: bytes.len(),
            max: MAX_VALUE_SIZE,
        });
    }

    let loaded = match blob {
        StoredBlob::Contacts => LoadedBlob::Contacts(sanitize_contacts(parse(&bytes)?)),
        StoredBlob::Journal => LoadedBlob::Journal(sanitize_journal(parse(&bytes)?)),
        StoredBlob::Settings => LoadedBlob::Settings(parse(&bytes)?),
    };
    Ok(Some(loaded))
}

fn parse<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    Ok(serde_json::from_slice(bytes)?)
}

fn sanitize_contacts(contacts: Vec<EmergencyContact>) -> Vec<EmergencyContact> {
    let mut seen = HashSet::new();
    let before = contacts.len();
    let mut kept: Vec<_> = contacts
        .into_iter()
        .filter(|c| seen.insert(c.id.clone()))
        .collect();
    if kept.len() != before {
        warn!(dropped = before - kept.len(), "dropped duplicate stored contacts");
    }
    if kept.len() > MAX_CONTACTS {
        warn!(count = kept.len(), max = MAX_CONTACTS, "truncating stored contacts");
        kept.truncate(MAX_CONTACTS);
    }
    kept
}

fn sanitize_journal(mut entries: Vec<JournalEntry>) -> Vec<JournalEntry> {
    entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    if entries.len() > MAX_JOURNAL_ENTRIES {
        warn!(
            count = entries.len(),
            max = MAX_JOURNAL_ENTRIES,
            "evicting oldest stored journal entries"
        );
        entries.truncate(MAX_JOURNAL_ENTRIES);
    }
    entries
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct BlobState {
    loaded: bool,
    dirty: bool,
}

/// What to do with a stored blob once its load finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadDisposition {
    /// Nothing changed locally; the stored copy replaces the model's.
    Replace,
    /// The blob changed locally first; the stored copy is merged into the
    /// model's and the result written back.
    Merge,
    /// The blob was already loaded once.
    Ignore,
}

/// Load bookkeeping for the three blobs.
#[derive(Debug, Clone, Default)]
pub struct PersistenceState {
    blobs: [BlobState; 3],
}

impl PersistenceState {
    pub fn mark_dirty(&mut self, blob: StoredBlob) {
        self.blobs[blob.index()].dirty = true;
    }

    pub fn finish_load(&mut self, blob: StoredBlob) -> LoadDisposition {
        let state = &mut self.blobs[blob.index()];
        if state.loaded {
            return LoadDisposition::Ignore;
        }
        state.loaded = true;
        if state.dirty {
            LoadDisposition::Merge
        } else {
            LoadDisposition::Replace
        }
    }

    #[must_use]
    pub fn is_loaded(&self, blob: StoredBlob) -> bool {
        self.blobs[blob.index()].loaded
    }

    #[must_use]
    pub fn is_hydrated(&self) -> bool {
        self.blobs.iter().all(|b| b.loaded)
    }
}
