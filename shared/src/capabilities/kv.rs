use crux_core::capability::{Capability, CapabilityContext, Operation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_KEY_LENGTH: usize = 128;
pub const MAX_VALUE_SIZE: usize = 4 * 1024 * 1024;

/// A validated storage key. Keys are flat names shared with the shell's store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KvKey(String);

impl KvKey {
    pub fn new(key: impl Into<String>) -> Result<Self, KvError> {
        let key = key.into();
        Self::validate(&key)?;
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(key: &str) -> Result<(), KvError> {
        if key.trim().is_empty() {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot be empty".to_string(),
            });
        }

        if key.len() > MAX_KEY_LENGTH {
            return Err(KvError::InvalidKey {
                key: key.chars().take(32).collect::<String>() + "...",
                reason: format!("key exceeds maximum length of {MAX_KEY_LENGTH} bytes"),
            });
        }

        if key.contains("..") || key.starts_with('/') || key.starts_with('\\') {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot look like a path".to_string(),
            });
        }

        if key.chars().any(char::is_control) {
            return Err(KvError::InvalidKey {
                key: key.escape_default().to_string(),
                reason: "key contains control characters".to_string(),
            });
        }

        Ok(())
    }
}

impl TryFrom<String> for KvKey {
    type Error = KvError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<KvKey> for String {
    fn from(key: KvKey) -> Self {
        key.0
    }
}

impl std::fmt::Display for KvKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum KvOperation {
    Get { key: KvKey },
    Set { key: KvKey, value: Vec<u8> },
    Remove { key: KvKey },
}

impl KvOperation {
    pub fn key(&self) -> &KvKey {
        match self {
            Self::Get { key } | Self::Set { key, .. } | Self::Remove { key } => key,
        }
    }
}

impl Operation for KvOperation {
    type Output = KvResult;
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum KvError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("value too large: {size} bytes exceeds maximum of {max} bytes")]
    ValueTooLarge { size: usize, max: usize },

    #[error("storage error: {message} (code: {code:?}, retryable: {retryable})")]
    Storage {
        code: StorageErrorCode,
        message: String,
        retryable: bool,
    },

    #[error("serialization error: {message}")]
    Serialization { message: String, key: Option<String> },

    #[error("unexpected response to {operation}")]
    UnexpectedOutput { operation: String },

    #[error("operation timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

impl KvError {
    pub fn is_retryable(&self) -> bool {
        match self {
            KvError::Storage { retryable, .. } => *retryable,
            KvError::Timeout { .. } => true,
            _ => false,
        }
    }

    pub fn storage(code: StorageErrorCode, message: impl Into<String>) -> Self {
        Self::Storage {
            code,
            message: message.into(),
            retryable: code.is_retryable(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageErrorCode {
    Unknown,
    Corrupted,
    DiskFull,
    PermissionDenied,
    Busy,
    IoError,
}

impl StorageErrorCode {
    pub fn is_retryable(self) -> bool {
        matches!(self, StorageErrorCode::Busy | StorageErrorCode::IoError)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum KvOutput {
    Value(Option<Vec<u8>>),
    Written,
    Removed { existed: bool },
}

pub type KvResult = Result<KvOutput, KvError>;

/// Generic get/set/remove by key against the shell's local store.
pub struct KeyValue<Ev> {
    context: CapabilityContext<KvOperation, Ev>,
}

impl<Ev> Capability<Ev> for KeyValue<Ev> {
    type Operation = KvOperation;
    type MappedSelf<MappedEv> = KeyValue<MappedEv>;

    fn map_event<F, NewEv>(&self, f: F) -> Self::MappedSelf<NewEv>
    where
        F: Fn(NewEv) -> Ev + Send + Sync + 'static,
        Ev: 'static,
        NewEv: 'static + Send,
    {
        KeyValue::new(self.context.map_event(f))
    }
}

impl<Ev> KeyValue<Ev>
where
    Ev: 'static,
{
    pub fn new(context: CapabilityContext<KvOperation, Ev>) -> Self {
        Self { context }
    }

    pub fn get<F>(&self, key: KvKey, make_event: F)
    where
        F: FnOnce(KvResult) -> Ev + Send + 'static,
    {
        self.request(KvOperation::Get { key }, make_event);
    }

    /// Oversized values are rejected here and reported through `make_event`.
    pub fn set<F>(&self, key: KvKey, value: Vec<u8>, make_event: F)
    where
        F: FnOnce(KvResult) -> Ev + Send + 'static,
    {
        if value.len() > MAX_VALUE_SIZE {
            let error = KvError::ValueTooLarge {
                size: value.len(),
                max: MAX_VALUE_SIZE,
            };
            let ctx = self.context.clone();
            self.context.spawn(async move {
                ctx.update_app(make_event(Err(error)));
            });
            return;
        }
        self.request(KvOperation::Set { key, value }, make_event);
    }

    pub fn remove<F>(&self, key: KvKey, make_event: F)
    where
        F: FnOnce(KvResult) -> Ev + Send + 'static,
    {
        self.request(KvOperation::Remove { key }, make_event);
    }

    fn request<F>(&self, operation: KvOperation, make_event: F)
    where
        F: FnOnce(KvResult) -> Ev + Send + 'static,
    {
        let ctx = self.context.clone();
        self.context.spawn(async move {
            let result = ctx.request_from_shell(operation).await;
            ctx.update_app(make_event(result));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_validation_empty() {
        assert!(matches!(KvKey::new(""), Err(KvError::InvalidKey { .. })));
        assert!(KvKey::new("   ").is_err());
    }

    #[test]
    fn test_key_validation_path_traversal() {
        assert!(KvKey::new("../etc/passwd").is_err());
        assert!(KvKey::new("/abs").is_err());
    }

    #[test]
    fn test_key_validation_control_chars() {
        assert!(KvKey::new("key\0value").is_err());
        assert!(KvKey::new("key\x01value").is_err());
    }

    #[test]
    fn test_key_validation_too_long() {
        assert!(KvKey::new("a".repeat(MAX_KEY_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_key_validation_valid() {
        let key = KvKey::new("emergency_contacts").unwrap();
        assert_eq!(key.as_str(), "emergency_contacts");
    }

    #[test]
    fn test_key_serializes_as_plain_string() {
        let key = KvKey::new("app_settings").unwrap();
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"app_settings\"");
        assert!(serde_json::from_str::<KvKey>("\"\"").is_err());
    }

    #[test]
    fn test_operation_exposes_key() {
        let key = KvKey::new("journal_entries").unwrap();
        let op = KvOperation::Set {
            key: key.clone(),
            value: b"[]".to_vec(),
        };
        assert_eq!(op.key(), &key);
    }

    #[test]
    fn test_kv_error_is_retryable() {
        assert!(KvError::storage(StorageErrorCode::Busy, "busy").is_retryable());
        assert!(KvError::Timeout { timeout_ms: 100 }.is_retryable());
        assert!(!KvError::storage(StorageErrorCode::Corrupted, "bad").is_retryable());
        assert!(!KvError::ValueTooLarge { size: 1, max: 0 }.is_retryable());
    }
}
