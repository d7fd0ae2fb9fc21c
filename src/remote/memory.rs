use super::{RemoteAuthority, RemoteResult};
use crate::core::{CanonicalRecord, Collection, Fields, Operation, RemoteError};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// A call as it reached the Remote Authority.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCall {
    pub operation: RemoteOperation,
    pub collection: Collection,
    pub id: Option<String>,
    pub payload: Option<Fields>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOperation {
    Create,
    Update,
    Delete,
    List,
}

impl From<Operation> for RemoteOperation {
    fn from(op: Operation) -> Self {
        match op {
            Operation::Create => Self::Create,
            Operation::Update => Self::Update,
            Operation::Delete => Self::Delete,
        }
    }
}

#[derive(Default)]
struct RemoteState {
    collections: HashMap<Collection, BTreeMap<String, Map<String, Value>>>,
    next_id: u64,
    offline: bool,
    latency: Option<Duration>,
    scripted_failures: HashMap<RemoteOperation, VecDeque<RemoteError>>,
    calls: Vec<RemoteCall>,
}

/// Remote Authority kept entirely in memory.
///
/// Assigns `srv-N` ids, stamps server-computed fields (`created_at`,
/// `updated_at`, `version`) and records every call. Failures can be injected
/// by going offline or scripting the next result of an operation.
#[derive(Clone, Default)]
pub struct InMemoryRemoteAuthority {
    state: Arc<Mutex<RemoteState>>,
}

impl InMemoryRemoteAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// While offline every call fails with a transient error.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Delay applied to every call before it is served.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    /// The next `operation` call fails with `error` instead of being served.
    pub fn fail_next(&self, operation: RemoteOperation, error: RemoteError) {
        self.lock()
            .scripted_failures
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// Stores a record as if it had been created by another client.
    pub fn seed(&self, collection: Collection, id: impl Into<String>, fields: Fields) {
        let mut state = self.lock();
        let fields = match fields {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        state
            .collections
            .entry(collection)
            .or_default()
            .insert(id.into(), fields);
    }

    pub fn get(&self, collection: Collection, id: &str) -> Option<CanonicalRecord> {
        self.lock()
            .collections
            .get(&collection)
            .and_then(|records| records.get(id))
            .map(|fields| CanonicalRecord::new(id, fields.clone()))
    }

    pub fn records(&self, collection: Collection) -> Vec<CanonicalRecord> {
        self.lock()
            .collections
            .get(&collection)
            .map(|records| {
                records
                    .iter()
                    .map(|(id, fields)| CanonicalRecord::new(id.clone(), fields.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.lock().calls.clone()
    }

    /// Calls other than `list`.
    pub fn mutation_calls(&self) -> Vec<RemoteCall> {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.operation != RemoteOperation::List)
            .cloned()
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Records the call and decides whether it fails before being served.
    async fn admit(&self, call: RemoteCall) -> RemoteResult<()> {
        let latency = {
            let mut state = self.lock();
            let operation = call.operation;
            state.calls.push(call);
            if state.offline {
                return Err(RemoteError::transient("network unreachable"));
            }
            if let Some(err) = state
                .scripted_failures
                .get_mut(&operation)
                .and_then(VecDeque::pop_front)
            {
                return Err(err);
            }
            state.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }
}

fn payload_object(payload: &Fields) -> RemoteResult<Map<String, Value>> {
    match payload {
        Value::Object(map) => {
            let mut map = map.clone();
            map.remove("id");
            Ok(map)
        }
        other => Err(RemoteError::permanent(
            Some(422),
            format!("payload must be a JSON object, got {}", other),
        )),
    }
}

#[async_trait]
impl RemoteAuthority for InMemoryRemoteAuthority {
    async fn create(&self, collection: Collection, payload: &Fields) -> RemoteResult<CanonicalRecord> {
        self.admit(RemoteCall {
            operation: RemoteOperation::Create,
            collection,
            id: None,
            payload: Some(payload.clone()),
        })
        .await?;

        let mut fields = payload_object(payload)?;
        let now = Utc::now().to_rfc3339();
        fields.insert("created_at".to_string(), json!(now));
        fields.insert("updated_at".to_string(), json!(now));
        fields.insert("version".to_string(), json!(1));

        let mut state = self.lock();
        state.next_id += 1;
        let id = format!("srv-{}", state.next_id);
        state
            .collections
            .entry(collection)
            .or_default()
            .insert(id.clone(), fields.clone());
        Ok(CanonicalRecord::new(id, fields))
    }

    async fn update(
        &self,
        collection: Collection,
        id: &str,
        payload: &Fields,
    ) -> RemoteResult<Option<CanonicalRecord>> {
        self.admit(RemoteCall {
            operation: RemoteOperation::Update,
            collection,
            id: Some(id.to_string()),
            payload: Some(payload.clone()),
        })
        .await?;

        let incoming = payload_object(payload)?;
        let mut state = self.lock();
        let existing = state
            .collections
            .get_mut(&collection)
            .and_then(|records| records.get_mut(id))
            .ok_or_else(|| {
                RemoteError::permanent(Some(404), format!("{} '{}' not found", collection, id))
            })?;

        let version = existing.get("version").and_then(Value::as_i64).unwrap_or(0) + 1;
        let created_at = existing.get("created_at").cloned();
        let mut fields = incoming;
        if let Some(created_at) = created_at {
            fields.insert("created_at".to_string(), created_at);
        }
        fields.insert("updated_at".to_string(), json!(Utc::now().to_rfc3339()));
        fields.insert("version".to_string(), json!(version));
        *existing = fields.clone();
        Ok(Some(CanonicalRecord::new(id, fields)))
    }

    async fn delete(&self, collection: Collection, id: &str) -> RemoteResult<()> {
        self.admit(RemoteCall {
            operation: RemoteOperation::Delete,
            collection,
            id: Some(id.to_string()),
            payload: None,
        })
        .await?;

        let mut state = self.lock();
        let removed = state
            .collections
            .get_mut(&collection)
            .and_then(|records| records.remove(id));
        match removed {
            Some(_) => Ok(()),
            None => Err(RemoteError::permanent(
                Some(404),
                format!("{} '{}' not found", collection, id),
            )),
        }
    }

    async fn list(&self, collection: Collection) -> RemoteResult<Vec<CanonicalRecord>> {
        self.admit(RemoteCall {
            operation: RemoteOperation::List,
            collection,
            id: None,
            payload: None,
        })
        .await?;
        Ok(self.records(collection))
    }
}
