use super::state::StoreOp;
use super::store::LocalStore;
use crate::core::{Collection, Identity, Record, Result};

/// Client-resident cache of financial records.
///
/// Reads and writes are synchronous and never touch the network. `put` and
/// `delete` are idempotent: replaying a write leaves the store unchanged.
#[derive(Debug, Clone)]
pub struct MirrorStore {
    store: LocalStore,
}

impl MirrorStore {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    pub fn get(&self, collection: Collection, identity: &Identity) -> Result<Option<Record>> {
        self.store
            .read(|state| state.record(collection, identity).cloned())
    }

    /// Inserts or replaces the record under its own identity.
    pub fn put(&self, collection: Collection, mut record: Record) -> Result<()> {
        record.collection = collection;
        self.store.commit(vec![StoreOp::PutRecord(record)])
    }

    pub fn delete(&self, collection: Collection, identity: &Identity) -> Result<()> {
        self.store.write(|inner| {
            if inner.state().record(collection, identity).is_none() {
                return Ok(());
            }
            inner.commit(vec![StoreOp::DeleteRecord {
                collection,
                identity: identity.clone(),
            }])
        })
    }

    pub fn list(&self, collection: Collection) -> Result<Vec<Record>> {
        self.store.read(|state| state.records(collection))
    }

    pub fn contains(&self, collection: Collection, identity: &Identity) -> Result<bool> {
        self.store
            .read(|state| state.record(collection, identity).is_some())
    }

    pub fn len(&self, collection: Collection) -> Result<usize> {
        self.store.read(|state| state.record_count(collection))
    }

    pub fn is_empty(&self, collection: Collection) -> Result<bool> {
        Ok(self.len(collection)? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn writes_are_visible_to_the_next_read() {
        let mirror = MirrorStore::new(LocalStore::in_memory());
        let identity = Identity::confirmed("srv-1");
        mirror
            .put(
                Collection::Income,
                Record::new(Collection::Income, identity.clone(), json!({"amount": 10})),
            )
            .unwrap();

        let record = mirror.get(Collection::Income, &identity).unwrap().unwrap();
        assert_eq!(record.fields, json!({"amount": 10}));
        assert_eq!(mirror.list(Collection::Income).unwrap().len(), 1);
        assert!(mirror.is_empty(Collection::Expense).unwrap());
    }

    #[test]
    fn put_and_delete_are_idempotent() {
        let mirror = MirrorStore::new(LocalStore::in_memory());
        let identity = Identity::new_provisional();
        let record = Record::new(Collection::Saving, identity.clone(), json!({"amount": 5}));

        mirror.put(Collection::Saving, record.clone()).unwrap();
        mirror.put(Collection::Saving, record).unwrap();
        assert_eq!(mirror.len(Collection::Saving).unwrap(), 1);

        mirror.delete(Collection::Saving, &identity).unwrap();
        mirror.delete(Collection::Saving, &identity).unwrap();
        assert!(!mirror.contains(Collection::Saving, &identity).unwrap());
    }
}
