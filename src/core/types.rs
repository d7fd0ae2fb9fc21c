use super::{Result, SyncError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque record payload. The engine never interprets it.
pub type Fields = serde_json::Value;

const PROVISIONAL_PREFIX: &str = "tmp:";

/// The financial record collections the engine mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Income,
    Expense,
    Saving,
    Investment,
}

impl Collection {
    pub const ALL: [Collection; 4] = [
        Collection::Income,
        Collection::Expense,
        Collection::Saving,
        Collection::Investment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Income => "income",
            Self::Expense => "expense",
            Self::Saving => "saving",
            Self::Investment => "investment",
        }
    }

    /// REST resource segment used by the Remote Authority.
    pub fn resource(&self) -> &'static str {
        match self {
            Self::Income => "incomes",
            Self::Expense => "expenses",
            Self::Saving => "savings",
            Self::Investment => "investments",
        }
    }

    pub fn from_resource(resource: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.resource() == resource)
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Collection {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == normalized || c.resource() == normalized)
            .ok_or_else(|| SyncError::Config(format!("Unknown collection '{}'", s)))
    }
}

/// Record identity: client-assigned until the Remote Authority confirms it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Identity {
    Provisional(Uuid),
    Confirmed(String),
}

impl Identity {
    pub fn new_provisional() -> Self {
        Self::Provisional(Uuid::new_v4())
    }

    pub fn confirmed(id: impl Into<String>) -> Self {
        Self::Confirmed(id.into())
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self, Self::Provisional(_))
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed(_))
    }

    /// The remote key, if the Remote Authority has assigned one.
    pub fn remote_id(&self) -> Option<&str> {
        match self {
            Self::Confirmed(id) => Some(id.as_str()),
            Self::Provisional(_) => None,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provisional(uuid) => write!(f, "{}{}", PROVISIONAL_PREFIX, uuid),
            Self::Confirmed(id) => write!(f, "{}", id),
        }
    }
}

impl FromStr for Identity {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(raw) = s.strip_prefix(PROVISIONAL_PREFIX) {
            let uuid = Uuid::parse_str(raw).map_err(|err| {
                SyncError::Config(format!("Invalid provisional identity '{}': {}", s, err))
            })?;
            return Ok(Self::Provisional(uuid));
        }
        if s.trim().is_empty() {
            return Err(SyncError::Config("identity must not be empty".to_string()));
        }
        Ok(Self::Confirmed(s.to_string()))
    }
}

/// A financial record as held by the Local Mirror Store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub identity: Identity,
    pub collection: Collection,
    pub fields: Fields,
    pub updated_at: DateTime<Utc>,
}

impl Record {
    pub fn new(collection: Collection, identity: Identity, fields: Fields) -> Self {
        Self {
            identity,
            collection,
            fields,
            updated_at: Utc::now(),
        }
    }

    pub fn from_canonical(collection: Collection, canonical: CanonicalRecord) -> Self {
        Self::new(
            collection,
            Identity::Confirmed(canonical.id),
            serde_json::Value::Object(canonical.fields),
        )
    }
}

/// Representation returned by the Remote Authority: permanent id plus
/// payload fields and any server-computed fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub id: String,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl CanonicalRecord {
    pub fn new(id: impl Into<String>, fields: serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        write!(f, "{label}")
    }
}

/// A pending mutation awaiting confirmation by the Remote Authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Global, strictly increasing.
    pub sequence: u64,
    pub collection: Collection,
    pub identity: Identity,
    pub operation: Operation,
    /// Full payload for Create/Update, `Null` for Delete.
    pub payload: Fields,
    pub enqueued_at: DateTime<Utc>,
}

impl OutboxEntry {
    pub fn lifeline(&self) -> Lifeline {
        Lifeline::new(self.collection, self.identity.clone())
    }
}

/// One record's causal chain of entries, keyed by collection and identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Lifeline {
    pub collection: Collection,
    pub identity: Identity,
}

impl Lifeline {
    pub fn new(collection: Collection, identity: Identity) -> Self {
        Self {
            collection,
            identity,
        }
    }
}

impl fmt::Display for Lifeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.identity)
    }
}

/// An entry the engine gave up on, kept so the loss is never silent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub entry: OutboxEntry,
    pub reason: String,
    pub status: Option<u16>,
    pub dead_lettered_at: DateTime<Utc>,
}
