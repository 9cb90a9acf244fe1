//! Transactional entity store abstraction.
//!
//! Entities are JSON documents addressed by an [`EntityKey`]: a kind, an entity
//! group, and a name. The store offers keyed reads, filtered queries, batched
//! writes, and read-modify-write transactions. Implementations guarantee that
//! all writes made inside one transaction land together or not at all; nothing
//! spans more than one transaction.

pub mod memory;

use std::cmp::Ordering;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::core::{CoordinatorError, CoordinatorResult};

pub use memory::InMemoryStore;

/// Kinds of persisted entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Tenant ledger.
    Tenant,
    /// Uploaded video.
    Video,
    /// Producer side of a tracking session.
    TrackerProducer,
    /// Consumer side of a tracking session.
    TrackerConsumer,
    /// Produced dataset.
    Dataset,
    /// Dataset archive request.
    DatasetZip,
    /// Per-shard progress counter.
    ShardProgress,
    /// Per-shard completion flag and result payload.
    ShardResult,
    /// Trained model and its external jobs.
    Model,
    /// Ordinary action record.
    Action,
    /// Administrative action record (retained after finish).
    AdminAction,
    /// Per-season snapshot of a tenant's models.
    SeasonSnapshot,
}

/// Address of a stored entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    /// Entity kind.
    pub kind: EntityKind,
    /// Entity group (tenant or parent resource).
    pub group: String,
    /// Name unique within the group.
    pub name: String,
}

impl EntityKey {
    /// Build a key.
    pub fn new(kind: EntityKind, group: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            group: group.into(),
            name: name.into(),
        }
    }
}

/// Comparison applied by a query filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    /// Field equals value.
    Eq,
    /// Field is strictly greater than value.
    Gt,
    /// Field is strictly less than value.
    Lt,
}

/// A single field predicate.
#[derive(Debug, Clone)]
pub struct Filter {
    /// Top-level document field.
    pub field: String,
    /// Comparison.
    pub op: FilterOp,
    /// Right-hand value.
    pub value: Value,
}

/// Filtered, ordered, limited query over one entity kind.
#[derive(Debug, Clone)]
pub struct Query {
    /// Kind to scan.
    pub kind: EntityKind,
    /// Restrict to one entity group.
    pub group: Option<String>,
    /// Conjunction of predicates.
    pub filters: Vec<Filter>,
    /// Sort field (ascending); key order when absent.
    pub order_by: Option<String>,
    /// Maximum number of results.
    pub limit: Option<usize>,
}

impl Query {
    /// Query every entity of `kind`.
    #[must_use]
    pub const fn kind(kind: EntityKind) -> Self {
        Self {
            kind,
            group: None,
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    /// Restrict to one entity group.
    #[must_use]
    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Add an equality predicate.
    #[must_use]
    pub fn filter_eq(self, field: &str, value: impl Serialize) -> Self {
        self.filter(field, FilterOp::Eq, value)
    }

    /// Add a predicate.
    #[must_use]
    pub fn filter(mut self, field: &str, op: FilterOp, value: impl Serialize) -> Self {
        self.filters.push(Filter {
            field: field.to_string(),
            op,
            value: serde_json::to_value(value).unwrap_or(Value::Null),
        });
        self
    }

    /// Sort ascending by `field`.
    #[must_use]
    pub fn order_by(mut self, field: &str) -> Self {
        self.order_by = Some(field.to_string());
        self
    }

    /// Return at most `limit` results.
    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether a document satisfies every predicate.
    #[must_use]
    pub fn matches(&self, doc: &Value) -> bool {
        self.filters.iter().all(|f| {
            let Some(actual) = doc.get(&f.field) else {
                return false;
            };
            match f.op {
                FilterOp::Eq => actual == &f.value,
                FilterOp::Gt => compare_values(actual, &f.value) == Some(Ordering::Greater),
                FilterOp::Lt => compare_values(actual, &f.value) == Some(Ordering::Less),
            }
        })
    }
}

/// Order two JSON scalars of the same type.
#[must_use]
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

/// Reads and buffered writes inside a single transaction.
pub trait Transaction {
    /// Read an entity, observing writes already buffered in this transaction.
    fn get(&mut self, key: &EntityKey) -> CoordinatorResult<Option<Value>>;
    /// Run a query, observing writes already buffered in this transaction.
    fn query(&mut self, query: &Query) -> CoordinatorResult<Vec<(EntityKey, Value)>>;
    /// Buffer a write.
    fn put(&mut self, key: EntityKey, value: Value);
    /// Buffer a delete.
    fn delete(&mut self, key: EntityKey);
}

/// Transactional key-value store collaborator.
pub trait EntityStore: Send + Sync {
    /// Read one entity by key.
    fn get(&self, key: &EntityKey) -> CoordinatorResult<Option<Value>>;
    /// Run a filtered query.
    fn query(&self, query: &Query) -> CoordinatorResult<Vec<(EntityKey, Value)>>;
    /// Write a batch of entities (not atomic across the batch).
    fn put_multi(&self, entries: Vec<(EntityKey, Value)>) -> CoordinatorResult<()>;
    /// Delete a batch of entities (not atomic across the batch).
    fn delete_multi(&self, keys: &[EntityKey]) -> CoordinatorResult<()>;
    /// Run `body` as one read-modify-write transaction. Buffered writes commit
    /// only if `body` returns `Ok`.
    fn transaction(
        &self,
        body: &mut dyn FnMut(&mut dyn Transaction) -> CoordinatorResult<()>,
    ) -> CoordinatorResult<()>;
}

/// A document type with a stable address.
pub trait Entity: Serialize + DeserializeOwned {
    /// Address of this entity.
    fn key(&self) -> EntityKey;
}

fn decode<T: DeserializeOwned>(value: Value) -> CoordinatorResult<T> {
    serde_json::from_value(value).map_err(CoordinatorError::from)
}

/// Typed helpers over [`EntityStore`].
pub trait StoreExt {
    /// Load a typed entity.
    fn load<T: Entity>(&self, key: &EntityKey) -> CoordinatorResult<Option<T>>;
    /// Query typed entities; every row must decode as `T`.
    fn find<T: Entity>(&self, query: &Query) -> CoordinatorResult<Vec<T>>;
    /// Store one entity outside a transaction.
    fn save<T: Entity>(&self, entity: &T) -> CoordinatorResult<()>;
    /// Store many entities in one batch.
    fn save_all<T: Entity>(&self, entities: &[T]) -> CoordinatorResult<()>;
}

impl<S: EntityStore + ?Sized> StoreExt for S {
    fn load<T: Entity>(&self, key: &EntityKey) -> CoordinatorResult<Option<T>> {
        self.get(key)?.map(decode).transpose()
    }

    fn find<T: Entity>(&self, query: &Query) -> CoordinatorResult<Vec<T>> {
        self.query(query)?
            .into_iter()
            .map(|(_, v)| decode(v))
            .collect()
    }

    fn save<T: Entity>(&self, entity: &T) -> CoordinatorResult<()> {
        self.put_multi(vec![(entity.key(), serde_json::to_value(entity)?)])
    }

    fn save_all<T: Entity>(&self, entities: &[T]) -> CoordinatorResult<()> {
        let entries = entities
            .iter()
            .map(|e| Ok((e.key(), serde_json::to_value(e)?)))
            .collect::<CoordinatorResult<Vec<_>>>()?;
        self.put_multi(entries)
    }
}

/// Typed helpers over [`Transaction`].
pub trait TransactionExt {
    /// Load a typed entity.
    fn load<T: Entity>(&mut self, key: &EntityKey) -> CoordinatorResult<Option<T>>;
    /// Query typed entities.
    fn find<T: Entity>(&mut self, query: &Query) -> CoordinatorResult<Vec<T>>;
    /// Buffer a typed write.
    fn save<T: Entity>(&mut self, entity: &T) -> CoordinatorResult<()>;
    /// Buffer a typed delete.
    fn remove<T: Entity>(&mut self, entity: &T);
}

impl<X: Transaction + ?Sized> TransactionExt for X {
    fn load<T: Entity>(&mut self, key: &EntityKey) -> CoordinatorResult<Option<T>> {
        self.get(key)?.map(decode).transpose()
    }

    fn find<T: Entity>(&mut self, query: &Query) -> CoordinatorResult<Vec<T>> {
        self.query(query)?
            .into_iter()
            .map(|(_, v)| decode(v))
            .collect()
    }

    fn save<T: Entity>(&mut self, entity: &T) -> CoordinatorResult<()> {
        let value = serde_json::to_value(entity)?;
        self.put(entity.key(), value);
        Ok(())
    }

    fn remove<T: Entity>(&mut self, entity: &T) {
        self.delete(entity.key());
    }
}

/// Run `body` transactionally, re-running it when the store reports a
/// transient failure, up to `attempts` runs in total.
///
/// # Errors
///
/// Returns the error from `body`, or the last transient failure once attempts
/// are exhausted.
pub fn run_transaction<S, R, F>(store: &S, attempts: u32, mut body: F) -> CoordinatorResult<R>
where
    S: EntityStore + ?Sized,
    F: FnMut(&mut dyn Transaction) -> CoordinatorResult<R>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut output = None;
        let result = store.transaction(&mut |txn: &mut dyn Transaction| {
            output = Some(body(txn)?);
            Ok(())
        });
        match result {
            Ok(()) => {
                return output.ok_or_else(|| {
                    CoordinatorError::Backend("transaction committed without a result".into())
                })
            }
            Err(e) if e.is_transient() && attempt < attempts.max(1) => {
                tracing::warn!(attempt, error = %e, "transaction contended, re-running");
            }
            Err(e) => return Err(e),
        }
    }
}
