//! In-memory entity store for development and testing.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use serde_json::Value;

use super::{compare_values, EntityKey, EntityKind, EntityStore, Query, Transaction};
use crate::core::{CoordinatorError, CoordinatorResult};

#[derive(Default)]
struct StoreState {
    entities: BTreeMap<EntityKey, Value>,
    /// Remaining injected write failures per (kind, name).
    put_failures: HashMap<(EntityKind, String), u32>,
    /// Remaining injected whole-transaction failures.
    transaction_failures: u32,
}

impl StoreState {
    fn take_put_failure(&mut self, key: &EntityKey) -> bool {
        let slot = (key.kind, key.name.clone());
        match self.put_failures.get_mut(&slot) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn scan(&self, query: &Query, overlay: &BTreeMap<EntityKey, Option<Value>>) -> Vec<(EntityKey, Value)> {
        let mut view: BTreeMap<EntityKey, Value> = self
            .entities
            .iter()
            .filter(|(k, _)| in_scope(query, k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (k, v) in overlay.iter().filter(|(k, _)| in_scope(query, k)) {
            match v {
                Some(v) => {
                    view.insert(k.clone(), v.clone());
                }
                None => {
                    view.remove(k);
                }
            }
        }
        let mut rows: Vec<(EntityKey, Value)> =
            view.into_iter().filter(|(_, v)| query.matches(v)).collect();
        if let Some(field) = &query.order_by {
            rows.sort_by(|(ka, a), (kb, b)| {
                let left = a.get(field).unwrap_or(&Value::Null);
                let right = b.get(field).unwrap_or(&Value::Null);
                compare_values(left, right)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| ka.cmp(kb))
            });
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        rows
    }
}

fn in_scope(query: &Query, key: &EntityKey) -> bool {
    key.kind == query.kind && query.group.as_ref().is_none_or(|g| g == &key.group)
}

/// Simple in-memory store. Transactions hold a single lock for their whole
/// duration, so they are serializable.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
}

impl InMemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` writes of the entity named `name` fail with a
    /// transient error.
    pub fn fail_next_puts(&self, kind: EntityKind, name: impl Into<String>, times: u32) {
        self.state.lock().put_failures.insert((kind, name.into()), times);
    }

    /// Make the next `times` transaction commits fail with a transient error.
    pub fn fail_next_transactions(&self, times: u32) {
        self.state.lock().transaction_failures = times;
    }

    /// Number of stored entities of `kind`.
    #[must_use]
    pub fn count(&self, kind: EntityKind) -> usize {
        self.state.lock().entities.keys().filter(|k| k.kind == kind).count()
    }
}

struct MemoryTransaction<'a> {
    state: &'a StoreState,
    writes: BTreeMap<EntityKey, Option<Value>>,
}

impl Transaction for MemoryTransaction<'_> {
    fn get(&mut self, key: &EntityKey) -> CoordinatorResult<Option<Value>> {
        if let Some(buffered) = self.writes.get(key) {
            return Ok(buffered.clone());
        }
        Ok(self.state.entities.get(key).cloned())
    }

    fn query(&mut self, query: &Query) -> CoordinatorResult<Vec<(EntityKey, Value)>> {
        Ok(self.state.scan(query, &self.writes))
    }

    fn put(&mut self, key: EntityKey, value: Value) {
        self.writes.insert(key, Some(value));
    }

    fn delete(&mut self, key: EntityKey) {
        self.writes.insert(key, None);
    }
}

impl EntityStore for InMemoryStore {
    fn get(&self, key: &EntityKey) -> CoordinatorResult<Option<Value>> {
        Ok(self.state.lock().entities.get(key).cloned())
    }

    fn query(&self, query: &Query) -> CoordinatorResult<Vec<(EntityKey, Value)>> {
        Ok(self.state.lock().scan(query, &BTreeMap::new()))
    }

    fn put_multi(&self, entries: Vec<(EntityKey, Value)>) -> CoordinatorResult<()> {
        let mut state = self.state.lock();
        for (key, value) in entries {
            if state.take_put_failure(&key) {
                return Err(CoordinatorError::TransientStore(format!(
                    "write contention on {:?} {}",
                    key.kind, key.name
                )));
            }
            state.entities.insert(key, value);
        }
        Ok(())
    }

    fn delete_multi(&self, keys: &[EntityKey]) -> CoordinatorResult<()> {
        let mut state = self.state.lock();
        for key in keys {
            state.entities.remove(key);
        }
        Ok(())
    }

    fn transaction(
        &self,
        body: &mut dyn FnMut(&mut dyn Transaction) -> CoordinatorResult<()>,
    ) -> CoordinatorResult<()> {
        let mut state = self.state.lock();
        let writes = {
            let mut txn = MemoryTransaction {
                state: &state,
                writes: BTreeMap::new(),
            };
            body(&mut txn)?;
            txn.writes
        };
        if state.transaction_failures > 0 {
            state.transaction_failures -= 1;
            return Err(CoordinatorError::TransientStore(
                "transaction aborted by contention".into(),
            ));
        }
        for key in writes.iter().filter(|(_, v)| v.is_some()).map(|(k, _)| k) {
            if state.take_put_failure(key) {
                return Err(CoordinatorError::TransientStore(format!(
                    "write contention on {:?} {}",
                    key.kind, key.name
                )));
            }
        }
        for (key, value) in writes {
            match value {
                Some(v) => {
                    state.entities.insert(key, v);
                }
                None => {
                    state.entities.remove(&key);
                }
            }
        }
        Ok(())
    }
}
