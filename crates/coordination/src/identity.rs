//! Job identity: kind + key arguments -> stable fingerprint.
//!
//! Two submissions with the same kind and the same key arguments (by value,
//! order-sensitive) are the *same logical job*; everything downstream - lock
//! reservations, status dedup, supersession - keys off the fingerprint
//! computed here. Non-key arguments never participate.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

/// Job kind identifier (e.g. `"recompute.ledger"`, `"snapshot.balances"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobKind(String);

impl JobKind {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobKind {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Ordered argument list for a job submission.
///
/// Arguments are JSON values so fingerprints stay stable across process
/// restarts and across language/runtime boundaries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobArgs(Vec<JsonValue>);

impl JobArgs {
    pub fn new(args: Vec<JsonValue>) -> Self {
        Self(args)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn get(&self, position: usize) -> Option<&JsonValue> {
        self.0.get(position)
    }

    pub fn as_slice(&self) -> &[JsonValue] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<JsonValue>> for JobArgs {
    fn from(value: Vec<JsonValue>) -> Self {
        Self(value)
    }
}

/// Which argument positions participate in a job's identity.
///
/// By default every argument participates; a kind may declare a reduced
/// subset (e.g. only the user id) so auxiliary flags do not fragment the
/// identity space. Changing the selector for a kind is a breaking change for
/// entries already in flight - keep the mapping stable for the lifetime of
/// any in-flight job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyArgSelector {
    /// Every argument participates.
    All,
    /// Only the listed positions participate. Positions past the end of the
    /// argument list select JSON null, which keeps the digest deterministic.
    Positions(Vec<usize>),
}

impl KeyArgSelector {
    pub fn select(&self, args: &JobArgs) -> Vec<JsonValue> {
        match self {
            KeyArgSelector::All => args.as_slice().to_vec(),
            KeyArgSelector::Positions(positions) => positions
                .iter()
                .map(|p| args.get(*p).cloned().unwrap_or(JsonValue::Null))
                .collect(),
        }
    }
}

/// Deterministic digest identifying a logical job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Rehydrate a stored digest (e.g. from a status row).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Value object pairing a kind with the key arguments that identify it.
#[derive(Debug, Clone, PartialEq)]
pub struct JobIdentity {
    kind: JobKind,
    key_args: Vec<JsonValue>,
}

impl JobIdentity {
    pub fn new(kind: JobKind, key_args: Vec<JsonValue>) -> Self {
        Self { kind, key_args }
    }

    pub fn kind(&self) -> &JobKind {
        &self.kind
    }

    pub fn key_args(&self) -> &[JsonValue] {
        &self.key_args
    }

    /// SHA-256 over the kind and the canonical JSON of the key arguments,
    /// hex-encoded.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        hasher.update(self.kind.as_str().as_bytes());
        hasher.update([0u8]);
        // serde_json object keys are sorted, so nested values digest stably.
        let canonical = serde_json::to_string(&self.key_args)
            .expect("JSON values are always serializable");
        hasher.update(canonical.as_bytes());
        Fingerprint(format!("{:x}", hasher.finalize()))
    }
}
