//! Per-transaction dual-confirmation state machine. Grounded in the
//! original system's `handle_concurrent_contribution_confirmation` — see
//! SPEC_FULL.md §4.4.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::info;

use tanda_core::{
    constants::DEFAULT_LEASE_TTL_SECS, ConfirmationStatus, Error, GroupId, LockKind, MemberId,
    Money, Transaction, TransactionId, TransactionKind,
};
use tanda_locks::LockManager;
use tanda_state::StateDb;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Party {
    Sender,
    Recipient,
}

/// Result of a `confirm` call: the transaction's current state, and whether
/// *this* call was the one that drove it into `both_confirmed`.
pub struct ConfirmOutcome {
    pub transaction: Transaction,
    pub newly_completed: bool,
}

pub struct ContributionFsm {
    db: Arc<StateDb>,
    locks: Arc<LockManager>,
}

impl ContributionFsm {
    pub fn new(db: Arc<StateDb>, locks: Arc<LockManager>) -> Self {
        Self { db, locks }
    }

    pub fn record_contribution(
        &self,
        group_id: GroupId,
        rotation_index: i32,
        from_member: MemberId,
        to_member: MemberId,
        amount: Money,
        deadline_at: Option<tanda_core::Timestamp>,
    ) -> Result<Transaction, Error> {
        let tx = Transaction {
            id: TransactionId::new(),
            group_id,
            rotation_index,
            kind: TransactionKind::Contribution,
            from_member: Some(from_member),
            to_member: Some(to_member),
            amount,
            status: ConfirmationStatus::Pending,
            sender_confirmed_at: None,
            recipient_confirmed_at: None,
            deadline_at,
            metadata: Default::default(),
            created_at: Utc::now(),
        };
        self.db.put_transaction(&tx)?;
        info!(tx = %tx.id, group = %group_id, "contribution recorded");
        Ok(tx)
    }

    /// Applies `party`'s confirmation. Idempotent: confirming twice by the
    /// same party is a no-op that returns the current state unchanged.
    /// Sender and recipient confirmations commute — arrival order never
    /// changes the final state. `ConfirmOutcome::newly_completed` is true
    /// only on the call that actually performed the pending/sender/recipient
    /// → both_confirmed transition, so callers emit `ContributionCompleted`
    /// exactly once even under repeated/idempotent calls (SPEC_FULL.md §8).
    pub async fn confirm(&self, transaction_id: TransactionId, party: Party) -> Result<ConfirmOutcome, Error> {
        let lease = self
            .locks
            .acquire(
                LockKind::TransactionWrite,
                &transaction_id.to_string(),
                Duration::from_secs(DEFAULT_LEASE_TTL_SECS as u64),
            )
            .await?;

        let result = (|| {
            for _ in 0..tanda_core::constants::RETRY_MAX_ATTEMPTS {
                let tx = self
                    .db
                    .get_transaction(&transaction_id)?
                    .ok_or_else(|| Error::TransactionNotFound(transaction_id.to_string()))?;

                if matches!(tx.status, ConfirmationStatus::Cancelled | ConfirmationStatus::BothConfirmed)
                    && self.already_confirmed(&tx, party)
                {
                    return Ok(ConfirmOutcome { transaction: tx, newly_completed: false });
                }
                if matches!(tx.status, ConfirmationStatus::Cancelled) {
                    return Err(Error::InvalidTransition {
                        from: "cancelled".into(),
                        event: format!("{party:?}_confirm"),
                    });
                }
                if self.already_confirmed(&tx, party) {
                    return Ok(ConfirmOutcome { transaction: tx, newly_completed: false });
                }

                let mut new_tx = tx.clone();
                let now = Utc::now();
                match party {
                    Party::Sender => new_tx.sender_confirmed_at = Some(now),
                    Party::Recipient => new_tx.recipient_confirmed_at = Some(now),
                }
                new_tx.status = if new_tx.sender_confirmed_at.is_some() && new_tx.recipient_confirmed_at.is_some() {
                    ConfirmationStatus::BothConfirmed
                } else if new_tx.sender_confirmed_at.is_some() {
                    ConfirmationStatus::SenderConfirmed
                } else {
                    ConfirmationStatus::RecipientConfirmed
                };

                if self.db.cas_put_transaction(&tx, &new_tx)? {
                    info!(tx = %transaction_id, status = ?new_tx.status, "contribution confirmation applied");
                    let newly_completed = new_tx.status == ConfirmationStatus::BothConfirmed;
                    return Ok(ConfirmOutcome { transaction: new_tx, newly_completed });
                }
                // Lost the race against a concurrent confirmation; retry.
            }
            Err(Error::Stale)
        })();

        lease.release().await?;
        result
    }

    fn already_confirmed(&self, tx: &Transaction, party: Party) -> bool {
        match party {
            Party::Sender => tx.sender_confirmed_at.is_some(),
            Party::Recipient => tx.recipient_confirmed_at.is_some(),
        }
    }

    /// Drives the `deadline_elapsed` transition for a transaction that has
    /// not reached a terminal state by its deadline. A fire for an
    /// already-settled transaction is a no-op (advisory semantics, see
    /// SPEC_FULL.md §5).
    pub async fn deadline_elapsed(&self, transaction_id: TransactionId) -> Result<Option<Transaction>, Error> {
        let lease = self
            .locks
            .acquire(
                LockKind::TransactionWrite,
                &transaction_id.to_string(),
                Duration::from_secs(DEFAULT_LEASE_TTL_SECS as u64),
            )
            .await?;

        let result = (|| {
            let tx = self
                .db
                .get_transaction(&transaction_id)?
                .ok_or_else(|| Error::TransactionNotFound(transaction_id.to_string()))?;

            if matches!(tx.status, ConfirmationStatus::BothConfirmed | ConfirmationStatus::Cancelled) {
                return Ok(None);
            }

            let mut new_tx = tx.clone();
            new_tx.status = ConfirmationStatus::Cancelled;
            if self.db.cas_put_transaction(&tx, &new_tx)? {
                info!(tx = %transaction_id, "contribution deadline elapsed, cancelled");
                Ok(Some(new_tx))
            } else {
                Err(Error::Stale)
            }
        })();

        lease.release().await?;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db() -> Arc<StateDb> {
        let dir = std::env::temp_dir().join(format!("tanda-contribution-test-{}", uuid::Uuid::new_v4()));
        Arc::new(StateDb::open(dir).expect("open temp db"))
    }

    fn fsm() -> (ContributionFsm, Arc<StateDb>) {
        let db = temp_db();
        let locks = Arc::new(LockManager::new(db.clone()));
        (ContributionFsm::new(db.clone(), locks), db)
    }

    #[tokio::test]
    async fn dual_confirmation_reaches_both_confirmed() {
        let (fsm, _db) = fsm();
        let tx = fsm
            .record_contribution(GroupId::new(), 0, MemberId::new(), MemberId::new(), Money::from_cents(1000), None)
            .unwrap();

        let after_sender = fsm.confirm(tx.id, Party::Sender).await.unwrap();
        assert_eq!(after_sender.transaction.status, ConfirmationStatus::SenderConfirmed);
        assert!(!after_sender.newly_completed);

        let after_recipient = fsm.confirm(tx.id, Party::Recipient).await.unwrap();
        assert!(after_recipient.transaction.is_both_confirmed());
        assert!(after_recipient.newly_completed);
    }

    #[tokio::test]
    async fn confirmations_commute() {
        let (fsm, _db) = fsm();
        let tx = fsm
            .record_contribution(GroupId::new(), 0, MemberId::new(), MemberId::new(), Money::from_cents(1000), None)
            .unwrap();

        fsm.confirm(tx.id, Party::Recipient).await.unwrap();
        let result = fsm.confirm(tx.id, Party::Sender).await.unwrap();
        assert!(result.transaction.is_both_confirmed());
        assert!(result.newly_completed);
    }

    #[tokio::test]
    async fn duplicate_confirmation_is_idempotent() {
        let (fsm, db) = fsm();
        let tx = fsm
            .record_contribution(GroupId::new(), 0, MemberId::new(), MemberId::new(), Money::from_cents(1000), None)
            .unwrap();

        let first = fsm.confirm(tx.id, Party::Sender).await.unwrap();
        let second = fsm.confirm(tx.id, Party::Sender).await.unwrap();
        assert_eq!(first.transaction.sender_confirmed_at, second.transaction.sender_confirmed_at);
        assert!(!second.newly_completed);
        let stored = db.get_transaction(&tx.id).unwrap().unwrap();
        assert_eq!(stored.status, ConfirmationStatus::SenderConfirmed);
    }

    #[tokio::test]
    async fn duplicate_confirmation_after_completion_is_not_newly_completed() {
        let (fsm, _db) = fsm();
        let tx = fsm
            .record_contribution(GroupId::new(), 0, MemberId::new(), MemberId::new(), Money::from_cents(1000), None)
            .unwrap();

        fsm.confirm(tx.id, Party::Sender).await.unwrap();
        let completed = fsm.confirm(tx.id, Party::Recipient).await.unwrap();
        assert!(completed.newly_completed);

        // A repeated call by either party after completion must not report
        // a second transition.
        let repeat_sender = fsm.confirm(tx.id, Party::Sender).await.unwrap();
        assert!(!repeat_sender.newly_completed);
        let repeat_recipient = fsm.confirm(tx.id, Party::Recipient).await.unwrap();
        assert!(!repeat_recipient.newly_completed);
    }

    #[tokio::test]
    async fn deadline_elapsed_cancels_pending() {
        let (fsm, _db) = fsm();
        let tx = fsm
            .record_contribution(GroupId::new(), 0, MemberId::new(), MemberId::new(), Money::from_cents(1000), None)
            .unwrap();
        let cancelled = fsm.deadline_elapsed(tx.id).await.unwrap().unwrap();
        assert_eq!(cancelled.status, ConfirmationStatus::Cancelled);
    }

    #[tokio::test]
    async fn deadline_elapsed_on_settled_tx_is_noop() {
        let (fsm, _db) = fsm();
        let tx = fsm
            .record_contribution(GroupId::new(), 0, MemberId::new(), MemberId::new(), Money::from_cents(1000), None)
            .unwrap();
        fsm.confirm(tx.id, Party::Sender).await.unwrap();
        fsm.confirm(tx.id, Party::Recipient).await.unwrap();
        let result = fsm.deadline_elapsed(tx.id).await.unwrap();
        assert!(result.is_none());
    }
}
