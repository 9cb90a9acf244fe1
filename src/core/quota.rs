//! Quota ledger: per-tenant training-minute balance and daily counters.
//!
//! Every mutation is a transactional read-modify-write of the tenant record.
//! `reserve` is the only admission gate; `release` and `settle_in` credit
//! minutes back. A settlement is guarded by a marker stored next to the job it
//! settles, so re-observing a terminal state never refunds twice.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::entities::{DailyCounters, TenantRecord};
use super::error::{CoordinatorError, CoordinatorResult};
use crate::config::QuotaConfig;
use crate::infra::scheduler::ExternalJobState;
use crate::infra::store::{run_transaction, EntityKind, EntityStore, Query, Transaction, TransactionExt};
use crate::util::{Clock, TenantId};

/// One-time refund marker stored alongside a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    /// When the refund was applied; `None` until settled.
    pub settled_time: Option<DateTime<Utc>>,
    /// Minutes credited back.
    pub refund_minutes: i64,
}

impl Settlement {
    /// Whether the refund has already been applied.
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        self.settled_time.is_some()
    }
}

/// Minutes to credit back once a job reaches a terminal state.
///
/// A failed job refunds the whole reservation. Otherwise the unused whole
/// minutes are refunded, counting a started minute as used; overrunning the
/// reservation refunds nothing.
#[must_use]
pub fn compute_refund(reserved_minutes: i64, elapsed_secs: i64, state: ExternalJobState) -> i64 {
    if state.is_failure() {
        return reserved_minutes.max(0);
    }
    let used_minutes = (elapsed_secs.max(0) + 59) / 60;
    (reserved_minutes - used_minutes).max(0)
}

/// Transactional training-minute ledger.
pub struct QuotaLedger {
    store: Arc<dyn EntityStore>,
    clock: Arc<dyn Clock>,
    config: QuotaConfig,
    attempts: u32,
}

impl QuotaLedger {
    /// Create a ledger over `store`.
    pub fn new(store: Arc<dyn EntityStore>, clock: Arc<dyn Clock>, config: QuotaConfig, attempts: u32) -> Self {
        Self {
            store,
            clock,
            config,
            attempts,
        }
    }

    /// Return the id of the tenant named `name`, creating it with the initial
    /// balance when absent.
    ///
    /// # Errors
    ///
    /// Returns `BadInput` for an empty name, or a store failure.
    pub fn ensure_tenant(&self, name: &str) -> CoordinatorResult<TenantId> {
        if name.trim().is_empty() {
            return Err(CoordinatorError::BadInput("tenant name must not be empty".into()));
        }
        let now = self.clock.now();
        run_transaction(self.store.as_ref(), self.attempts, |txn| {
            let query = Query::kind(EntityKind::Tenant).filter_eq("name", name).limit(1);
            if let Some(mut tenant) = txn.find::<TenantRecord>(&query)?.pop() {
                if tenant.refresh_day(now) {
                    txn.save(&tenant)?;
                }
                return Ok(tenant.tenant_id);
            }
            let tenant = TenantRecord::new(
                TenantId::generate(),
                name,
                self.config.initial_training_minutes,
                now,
            );
            txn.save(&tenant)?;
            info!(tenant = %tenant.tenant_id, name, "created tenant");
            Ok(tenant.tenant_id)
        })
    }

    /// Load a tenant inside `txn`, applying the daily reset in memory. The
    /// caller saves the record if it writes anything.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the tenant does not exist.
    pub fn load_in(txn: &mut dyn Transaction, tenant_id: &TenantId, now: DateTime<Utc>) -> CoordinatorResult<TenantRecord> {
        let mut tenant: TenantRecord = txn
            .load(&TenantRecord::key_for(tenant_id))?
            .ok_or_else(|| CoordinatorError::NotFound(format!("tenant {tenant_id}")))?;
        tenant.refresh_day(now);
        Ok(tenant)
    }

    /// Current tenant record, writing back the daily reset only when the day
    /// changed.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the tenant does not exist.
    pub fn tenant(&self, tenant_id: &TenantId) -> CoordinatorResult<TenantRecord> {
        let now = self.clock.now();
        run_transaction(self.store.as_ref(), self.attempts, |txn| {
            let mut tenant: TenantRecord = txn
                .load(&TenantRecord::key_for(tenant_id))?
                .ok_or_else(|| CoordinatorError::NotFound(format!("tenant {tenant_id}")))?;
            if tenant.refresh_day(now) {
                debug!(tenant = %tenant_id, "reset daily counters");
                txn.save(&tenant)?;
            }
            Ok(tenant)
        })
    }

    /// Remaining training minutes.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the tenant does not exist.
    pub fn remaining_minutes(&self, tenant_id: &TenantId) -> CoordinatorResult<i64> {
        self.tenant(tenant_id).map(|t| t.remaining_training_minutes)
    }

    /// Debit `minutes`, rejecting without any change if the balance would go
    /// negative. Returns the new balance.
    ///
    /// # Errors
    ///
    /// Returns `BadInput` for a non-positive amount, `QuotaExceeded` when the
    /// balance is insufficient, or `NotFound`.
    pub fn reserve(&self, tenant_id: &TenantId, minutes: i64) -> CoordinatorResult<i64> {
        if minutes <= 0 {
            return Err(CoordinatorError::BadInput(format!(
                "reservation must be positive, got {minutes}"
            )));
        }
        let now = self.clock.now();
        let remaining = run_transaction(self.store.as_ref(), self.attempts, |txn| {
            let mut tenant = Self::load_in(txn, tenant_id, now)?;
            let remaining = tenant.remaining_training_minutes - minutes;
            if remaining < 0 {
                return Err(CoordinatorError::QuotaExceeded {
                    requested: minutes,
                    remaining: tenant.remaining_training_minutes,
                });
            }
            tenant.remaining_training_minutes = remaining;
            txn.save(&tenant)?;
            Ok(remaining)
        })?;
        info!(tenant = %tenant_id, minutes, remaining, "reserved training minutes");
        Ok(remaining)
    }

    /// Credit `minutes` back. Returns the new balance.
    ///
    /// # Errors
    ///
    /// Returns `BadInput` for a negative amount, or `NotFound`.
    pub fn release(&self, tenant_id: &TenantId, minutes: i64) -> CoordinatorResult<i64> {
        if minutes < 0 {
            return Err(CoordinatorError::BadInput(format!(
                "release must not be negative, got {minutes}"
            )));
        }
        let now = self.clock.now();
        let remaining = run_transaction(self.store.as_ref(), self.attempts, |txn| {
            let mut tenant = Self::load_in(txn, tenant_id, now)?;
            tenant.remaining_training_minutes += minutes;
            txn.save(&tenant)?;
            Ok(tenant.remaining_training_minutes)
        })?;
        info!(tenant = %tenant_id, minutes, remaining, "released training minutes");
        Ok(remaining)
    }

    /// Apply the one-time refund for a job inside the caller's transaction.
    /// Returns the refunded minutes, or `None` when `settlement` was already
    /// applied.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the tenant does not exist.
    pub fn settle_in(
        txn: &mut dyn Transaction,
        tenant_id: &TenantId,
        settlement: &mut Settlement,
        reserved_minutes: i64,
        elapsed_secs: i64,
        state: ExternalJobState,
        now: DateTime<Utc>,
    ) -> CoordinatorResult<Option<i64>> {
        if settlement.is_settled() {
            return Ok(None);
        }
        let refund = compute_refund(reserved_minutes, elapsed_secs, state);
        let mut tenant = Self::load_in(txn, tenant_id, now)?;
        tenant.remaining_training_minutes += refund;
        txn.save(&tenant)?;
        settlement.settled_time = Some(now);
        settlement.refund_minutes = refund;
        Ok(Some(refund))
    }

    /// Count an upload against today's counters.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the tenant does not exist.
    pub fn record_video_uploaded(&self, tenant_id: &TenantId) -> CoordinatorResult<DailyCounters> {
        self.bump(tenant_id, |d| d.videos_uploaded += 1)
    }

    /// Count an archive download against today's counters.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the tenant does not exist.
    pub fn record_dataset_downloaded(&self, tenant_id: &TenantId) -> CoordinatorResult<DailyCounters> {
        self.bump(tenant_id, |d| d.datasets_downloaded += 1)
    }

    /// Count a dataset creation inside the caller's transaction.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the tenant does not exist.
    pub fn record_dataset_created_in(txn: &mut dyn Transaction, tenant_id: &TenantId, now: DateTime<Utc>) -> CoordinatorResult<()> {
        let mut tenant = Self::load_in(txn, tenant_id, now)?;
        tenant.daily.datasets_created += 1;
        txn.save(&tenant)
    }

    fn bump(&self, tenant_id: &TenantId, update: impl Fn(&mut DailyCounters)) -> CoordinatorResult<DailyCounters> {
        let now = self.clock.now();
        run_transaction(self.store.as_ref(), self.attempts, |txn| {
            let mut tenant = Self::load_in(txn, tenant_id, now)?;
            update(&mut tenant.daily);
            txn.save(&tenant)?;
            Ok(tenant.daily)
        })
    }

    /// Configured starting balance.
    #[must_use]
    pub const fn initial_minutes(&self) -> i64 {
        self.config.initial_training_minutes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refund_is_unused_whole_minutes() {
        assert_eq!(compute_refund(60, 0, ExternalJobState::Succeeded), 60);
        assert_eq!(compute_refund(60, 20 * 60, ExternalJobState::Succeeded), 40);
        assert_eq!(compute_refund(60, 20 * 60 + 1, ExternalJobState::Cancelled), 39);
    }

    #[test]
    fn overrun_refunds_nothing() {
        assert_eq!(compute_refund(60, 90 * 60, ExternalJobState::Succeeded), 0);
    }

    #[test]
    fn failure_refunds_everything() {
        assert_eq!(compute_refund(60, 90 * 60, ExternalJobState::Failed), 60);
    }
}
