#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hasher;

use fnv::FnvHasher;
use pt_core::{DType, TensorError, TensorHandle, TensorRecord};
use pt_dispatch::{CombineOp, DispatchError, combine_into};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 64 * 1024 * 1024;

/// Symmetric read/write access to named tensor slots.
///
/// A writer records `value` under `key` and hands it back unchanged; a
/// reader loads the stored slot and returns it as the effective value.
/// Callers always replace their value with the returned one, so the same
/// traversal code saves and loads.
pub trait Serializer<T: TensorHandle> {
    /// Nested serializer whose slots live under `name`.
    fn scoped(&mut self, name: &str) -> Box<dyn Serializer<T> + '_>;

    fn exchange(&mut self, key: &str, value: &T) -> Result<T, SerializeError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckpointEntry {
    pub path: String,
    pub tensor: TensorRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointMode {
    Strict,
    Hardened,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    Strict,
    Hardened,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeConfig {
    pub mode: DecodeMode,
    pub max_payload_bytes: usize,
}

impl DecodeConfig {
    #[must_use]
    pub fn with_mode(mode: DecodeMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            mode: DecodeMode::Strict,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TreeCheckpoint {
    pub schema_version: u32,
    pub mode: CheckpointMode,
    pub entries: Vec<CheckpointEntry>,
    pub source_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerializeError {
    InvalidJson {
        diagnostic: String,
    },
    UnknownField {
        field: String,
    },
    VersionMismatch {
        expected: u32,
        found: u32,
    },
    ChecksumMismatch {
        expected: String,
        found: String,
    },
    IncompatiblePayload {
        reason: String,
    },
    MissingEntry {
        path: String,
    },
    ShapeMismatch {
        path: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    InvalidRecord {
        path: String,
        error: TensorError,
    },
    Dispatch(DispatchError),
}

impl fmt::Display for SerializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidJson { diagnostic } => write!(f, "invalid json: {diagnostic}"),
            Self::UnknownField { field } => write!(f, "unknown field '{field}'"),
            Self::VersionMismatch { expected, found } => {
                write!(
                    f,
                    "schema version mismatch: expected={expected} found={found}"
                )
            }
            Self::ChecksumMismatch { expected, found } => {
                write!(f, "checksum mismatch: expected={expected} found={found}")
            }
            Self::IncompatiblePayload { reason } => write!(f, "incompatible payload: {reason}"),
            Self::MissingEntry { path } => write!(f, "checkpoint has no entry at '{path}'"),
            Self::ShapeMismatch {
                path,
                expected,
                found,
            } => write!(
                f,
                "shape mismatch at '{path}': expected {expected:?}, found {found:?}"
            ),
            Self::InvalidRecord { path, error } => {
                write!(f, "invalid tensor record at '{path}': {error}")
            }
            Self::Dispatch(error) => write!(f, "{error}"),
        }
    }
}

impl std::error::Error for SerializeError {}

impl From<DispatchError> for SerializeError {
    fn from(value: DispatchError) -> Self {
        Self::Dispatch(value)
    }
}

/// Joins a scope prefix and a slot name into a checkpoint path.
#[must_use]
pub fn join_path(prefix: &str, name: &str) -> String {
    format!("{prefix}/{name}")
}

/// Collects every exchanged value as a [`TensorRecord`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckpointWriter {
    entries: BTreeMap<String, TensorRecord>,
}

impl CheckpointWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn entries(&self) -> &BTreeMap<String, TensorRecord> {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn finish(self, mode: CheckpointMode) -> Result<String, SerializeError> {
        let entries: Vec<CheckpointEntry> = self
            .entries
            .into_iter()
            .map(|(path, tensor)| CheckpointEntry { path, tensor })
            .collect();
        encode_checkpoint(&entries, mode)
    }
}

struct WriterScope<'a> {
    entries: &'a mut BTreeMap<String, TensorRecord>,
    prefix: String,
}

fn write_entry<T: TensorHandle>(
    entries: &mut BTreeMap<String, TensorRecord>,
    path: String,
    value: &T,
) -> T {
    entries.insert(path, value.to_record());
    value.clone()
}

impl<T: TensorHandle> Serializer<T> for CheckpointWriter {
    fn scoped(&mut self, name: &str) -> Box<dyn Serializer<T> + '_> {
        Box::new(WriterScope {
            entries: &mut self.entries,
            prefix: join_path("", name),
        })
    }

    fn exchange(&mut self, key: &str, value: &T) -> Result<T, SerializeError> {
        Ok(write_entry(&mut self.entries, join_path("", key), value))
    }
}

impl<T: TensorHandle> Serializer<T> for WriterScope<'_> {
    fn scoped(&mut self, name: &str) -> Box<dyn Serializer<T> + '_> {
        Box::new(WriterScope {
            entries: &mut *self.entries,
            prefix: join_path(&self.prefix, name),
        })
    }

    fn exchange(&mut self, key: &str, value: &T) -> Result<T, SerializeError> {
        Ok(write_entry(
            &mut *self.entries,
            join_path(&self.prefix, key),
            value,
        ))
    }
}

/// Loads stored values into the tensors handed to [`Serializer::exchange`].
///
/// Values are copied into the caller's tensor, so its device is kept.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckpointReader {
    entries: BTreeMap<String, TensorRecord>,
}

impl CheckpointReader {
    #[must_use]
    pub fn from_checkpoint(checkpoint: TreeCheckpoint) -> Self {
        let entries = checkpoint
            .entries
            .into_iter()
            .map(|entry| (entry.path, entry.tensor))
            .collect();
        Self { entries }
    }

    pub fn from_json(input: &str, config: &DecodeConfig) -> Result<Self, SerializeError> {
        decode_checkpoint(input, config).map(Self::from_checkpoint)
    }

    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct ReaderScope<'a> {
    entries: &'a BTreeMap<String, TensorRecord>,
    prefix: String,
}

fn read_entry<T: TensorHandle>(
    entries: &BTreeMap<String, TensorRecord>,
    path: String,
    value: &T,
) -> Result<T, SerializeError> {
    let Some(record) = entries.get(&path) else {
        return Err(SerializeError::MissingEntry { path });
    };
    if record.shape.as_slice() != value.shape() {
        return Err(SerializeError::ShapeMismatch {
            expected: value.shape().to_vec(),
            found: record.shape.clone(),
            path,
        });
    }
    let loaded = T::from_record(record).map_err(|error| SerializeError::InvalidRecord {
        path: path.clone(),
        error,
    })?;

    let mut out = value.clone();
    combine_into(&mut out, &loaded, CombineOp::Copy)?;
    Ok(out)
}

impl<T: TensorHandle> Serializer<T> for CheckpointReader {
    fn scoped(&mut self, name: &str) -> Box<dyn Serializer<T> + '_> {
        Box::new(ReaderScope {
            entries: &self.entries,
            prefix: join_path("", name),
        })
    }

    fn exchange(&mut self, key: &str, value: &T) -> Result<T, SerializeError> {
        read_entry(&self.entries, join_path("", key), value)
    }
}

impl<T: TensorHandle> Serializer<T> for ReaderScope<'_> {
    fn scoped(&mut self, name: &str) -> Box<dyn Serializer<T> + '_> {
        Box::new(ReaderScope {
            entries: self.entries,
            prefix: join_path(&self.prefix, name),
        })
    }

    fn exchange(&mut self, key: &str, value: &T) -> Result<T, SerializeError> {
        read_entry(self.entries, join_path(&self.prefix, key), value)
    }
}

/// Fields a checkpoint envelope may carry; anything else is rejected.
const ENVELOPE_FIELDS: [&str; 4] = ["schema_version", "mode", "entries", "source_hash"];
const DIAGNOSTIC_CHARS: usize = 200;

impl TreeCheckpoint {
    /// Builds a checkpoint over `entries`, sorted by path and checksummed.
    #[must_use]
    pub fn seal(mut entries: Vec<CheckpointEntry>, mode: CheckpointMode) -> Self {
        entries.sort_by(|lhs, rhs| lhs.path.cmp(&rhs.path));
        let source_hash = entries_digest(CHECKPOINT_SCHEMA_VERSION, mode, &entries);
        Self {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            mode,
            entries,
            source_hash,
        }
    }

    /// Rejects a checkpoint from another schema, with a stale checksum, a
    /// path stored twice, or a record whose values do not fill its shape.
    pub fn verify(&self) -> Result<(), SerializeError> {
        if self.schema_version != CHECKPOINT_SCHEMA_VERSION {
            return Err(SerializeError::VersionMismatch {
                expected: CHECKPOINT_SCHEMA_VERSION,
                found: self.schema_version,
            });
        }

        let mut by_path: Vec<&CheckpointEntry> = self.entries.iter().collect();
        by_path.sort_by(|lhs, rhs| lhs.path.cmp(&rhs.path));

        let expected = entries_digest(self.schema_version, self.mode, by_path.iter().copied());
        if self.source_hash != expected {
            return Err(SerializeError::ChecksumMismatch {
                expected,
                found: self.source_hash.clone(),
            });
        }

        if let Some(pair) = by_path.windows(2).find(|pair| pair[0].path == pair[1].path) {
            return Err(SerializeError::IncompatiblePayload {
                reason: format!("duplicate checkpoint path '{}'", pair[0].path),
            });
        }
        for entry in by_path {
            entry
                .tensor
                .validate()
                .map_err(|error| SerializeError::InvalidRecord {
                    path: entry.path.clone(),
                    error,
                })?;
        }
        Ok(())
    }
}

pub fn encode_checkpoint(
    entries: &[CheckpointEntry],
    mode: CheckpointMode,
) -> Result<String, SerializeError> {
    let checkpoint = TreeCheckpoint::seal(entries.to_vec(), mode);
    let encoded =
        serde_json::to_string(&checkpoint).map_err(|error| SerializeError::IncompatiblePayload {
            reason: format!("checkpoint encoding failed: {error}"),
        })?;
    log::debug!(
        "encoded checkpoint entries={} bytes={} hash={}",
        checkpoint.entries.len(),
        encoded.len(),
        checkpoint.source_hash
    );
    Ok(encoded)
}

/// Parses and verifies a checkpoint. Strict mode relies on the envelope's
/// serde schema; hardened mode inspects the raw JSON object first and
/// reports the first unexpected field by name.
pub fn decode_checkpoint(
    input: &str,
    config: &DecodeConfig,
) -> Result<TreeCheckpoint, SerializeError> {
    if input.len() > config.max_payload_bytes {
        return Err(SerializeError::IncompatiblePayload {
            reason: format!(
                "checkpoint payload exceeds max bytes: actual={} max={}",
                input.len(),
                config.max_payload_bytes
            ),
        });
    }

    let checkpoint = match config.mode {
        DecodeMode::Strict => serde_json::from_str(input).map_err(strict_error)?,
        DecodeMode::Hardened => parse_hardened(input)?,
    };
    checkpoint.verify()?;

    log::debug!(
        "decoded checkpoint mode={:?} entries={}",
        config.mode,
        checkpoint.entries.len()
    );
    Ok(checkpoint)
}

fn strict_error(error: serde_json::Error) -> SerializeError {
    let message = error.to_string();
    match unknown_field_name(&message) {
        Some(field) => SerializeError::UnknownField { field },
        None => SerializeError::InvalidJson {
            diagnostic: truncated(&message),
        },
    }
}

fn parse_hardened(input: &str) -> Result<TreeCheckpoint, SerializeError> {
    let raw: Value = serde_json::from_str(input).map_err(|error| SerializeError::InvalidJson {
        diagnostic: truncated(&error.to_string()),
    })?;

    let Some(object) = raw.as_object() else {
        return Err(SerializeError::IncompatiblePayload {
            reason: "top-level checkpoint payload must be a JSON object".to_string(),
        });
    };
    if let Some(field) = object
        .keys()
        .find(|key| !ENVELOPE_FIELDS.contains(&key.as_str()))
    {
        return Err(SerializeError::UnknownField {
            field: field.clone(),
        });
    }

    serde_json::from_value(raw).map_err(|error| SerializeError::IncompatiblePayload {
        reason: truncated(&error.to_string()),
    })
}

/// FNV-1a 64 over the envelope header and every entry in path order.
fn entries_digest<'a>(
    schema_version: u32,
    mode: CheckpointMode,
    entries: impl IntoIterator<Item = &'a CheckpointEntry>,
) -> String {
    let mut hasher = FnvHasher::default();
    hasher.write(&schema_version.to_le_bytes());
    hasher.write_u8(match mode {
        CheckpointMode::Strict => 1,
        CheckpointMode::Hardened => 2,
    });
    for entry in entries {
        hasher.write(entry.path.as_bytes());
        hasher.write_u8(0xff);
        hasher.write_u8(match entry.tensor.dtype {
            DType::F64 => 1,
            DType::F32 => 2,
        });
        hasher.write(&(entry.tensor.shape.len() as u64).to_le_bytes());
        for dim in &entry.tensor.shape {
            hasher.write(&(*dim as u64).to_le_bytes());
        }
        hasher.write(&(entry.tensor.values.len() as u64).to_le_bytes());
        for value in &entry.tensor.values {
            hasher.write(&value.to_bits().to_le_bytes());
        }
    }
    format!("det64:{:016x}", hasher.finish())
}

fn unknown_field_name(message: &str) -> Option<String> {
    // serde_json: "unknown field `x`, expected ..."
    let (_, rest) = message.split_once("unknown field `")?;
    let (field, _) = rest.split_once('`')?;
    Some(field.to_string())
}

fn truncated(message: &str) -> String {
    match message.char_indices().nth(DIAGNOSTIC_CHARS) {
        Some((cut, _)) => format!("{}...", &message[..cut]),
        None => message.to_string(),
    }
}
