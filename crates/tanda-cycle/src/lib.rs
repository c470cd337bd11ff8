//! Cycle-completion validation and simultaneous deposit return. Grounded in
//! the original system's `SecurityDepositReturnService`
//! (`validate_cycle_completion`, `process_simultaneous_deposit_return`,
//! `validate_no_loss_guarantee`) — see SPEC_FULL.md §4.6.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::info;

use tanda_core::{
    constants::CYCLE_CLOSE_LEASE_TTL_SECS, ConfirmationStatus, DepositStatus, Error, Group,
    GroupId, GroupStatus, LockKind, Member, MemberStatus, Money, Transaction, TransactionId,
    TransactionKind,
};
use tanda_locks::LockManager;
use tanda_state::StateDb;

/// Per-member net-position line of the no-loss audit: `payouts_received +
/// deposit_returned - contributions_made - deposit_paid`. Must be `>= 0`
/// for every member at cycle completion.
#[derive(Clone, Debug)]
pub struct MemberNetPosition {
    pub member_id: tanda_core::MemberId,
    pub contributions_made: Money,
    pub payouts_received: Money,
    pub deposit_paid: Money,
    pub deposit_returned: Money,
    pub net_position: rust_decimal::Decimal,
    pub no_loss_maintained: bool,
}

#[derive(Clone, Debug)]
pub struct NoLossAudit {
    pub members: Vec<MemberNetPosition>,
    pub passes: bool,
}

#[derive(Clone, Debug)]
pub struct CyclePreconditions {
    pub all_active_received_or_accounted: bool,
    pub rotations_sufficient: bool,
    pub no_outstanding_transactions: bool,
    pub no_loss_audit: NoLossAudit,
}

impl CyclePreconditions {
    pub fn satisfied(&self) -> bool {
        self.all_active_received_or_accounted
            && self.rotations_sufficient
            && self.no_outstanding_transactions
            && self.no_loss_audit.passes
    }
}

pub struct CycleSummary {
    pub group: Group,
    pub return_transactions: Vec<Transaction>,
    pub total_returned: Money,
}

pub struct CycleCloser {
    db: Arc<StateDb>,
    locks: Arc<LockManager>,
}

impl CycleCloser {
    pub fn new(db: Arc<StateDb>, locks: Arc<LockManager>) -> Self {
        Self { db, locks }
    }

    /// Runs the §8 no-loss audit: for every member, net inflow (payouts +
    /// deposit returns) must be at least net outflow (contributions +
    /// deposits paid), computed from the group's settled transaction log.
    pub fn run_no_loss_audit(&self, group_id: GroupId) -> Result<NoLossAudit, Error> {
        let members = self.db.iter_members_by_group(&group_id)?;
        let transactions = self.db.iter_transactions_by_group(&group_id)?;

        let mut results = Vec::with_capacity(members.len());
        let mut passes = true;

        for member in &members {
            let contributions_made = sum_amount(&transactions, |t| {
                t.kind == TransactionKind::Contribution
                    && t.is_both_confirmed()
                    && t.from_member == Some(member.id)
            });
            let payouts_received = sum_amount(&transactions, |t| {
                t.kind == TransactionKind::Contribution
                    && t.is_both_confirmed()
                    && t.to_member == Some(member.id)
            });
            let deposit_paid = sum_amount(&transactions, |t| {
                t.kind == TransactionKind::SecurityDeposit && t.to_member == Some(member.id)
            });
            let deposit_returned = sum_amount(&transactions, |t| {
                t.kind == TransactionKind::DepositReturn && t.to_member == Some(member.id)
            });

            let net = (payouts_received.as_decimal() + deposit_returned.as_decimal())
                - (contributions_made.as_decimal() + deposit_paid.as_decimal());
            let no_loss_maintained = net >= rust_decimal::Decimal::ZERO;
            if !no_loss_maintained {
                passes = false;
            }

            results.push(MemberNetPosition {
                member_id: member.id,
                contributions_made,
                payouts_received,
                deposit_paid,
                deposit_returned,
                net_position: net,
                no_loss_maintained,
            });
        }

        Ok(NoLossAudit { members: results, passes })
    }

    /// Evaluates every §4.6 precondition without mutating state.
    pub fn check_preconditions(&self, group_id: GroupId) -> Result<CyclePreconditions, Error> {
        let group = self
            .db
            .get_group(&group_id)?
            .ok_or_else(|| Error::GroupNotFound(group_id.to_string()))?;
        let members = self.db.iter_members_by_group(&group_id)?;
        let transactions = self.db.iter_transactions_by_group(&group_id)?;

        let active_members: Vec<&Member> = members
            .iter()
            .filter(|m| !matches!(m.status, MemberStatus::Removed))
            .collect();

        let all_active_received_or_accounted = active_members.iter().all(|m| {
            m.has_received_payout
                || (matches!(m.status, MemberStatus::Suspended) && m.rotation_position <= 0)
        });

        let rotations_sufficient = group.completed_rotations >= active_members.len() as i32;

        let no_outstanding_transactions = !transactions.iter().any(|t| {
            matches!(
                t.status,
                ConfirmationStatus::Pending
                    | ConfirmationStatus::SenderConfirmed
                    | ConfirmationStatus::RecipientConfirmed
            )
        });

        let no_loss_audit = self.run_no_loss_audit(group_id)?;

        Ok(CyclePreconditions {
            all_active_received_or_accounted,
            rotations_sufficient,
            no_outstanding_transactions,
            no_loss_audit,
        })
    }

    /// Re-validates preconditions inside the `cycle_close` critical section
    /// and, if they hold, atomically returns every outstanding deposit,
    /// clears lock-in, and marks the group completed.
    pub async fn close_cycle(&self, group_id: GroupId) -> Result<CycleSummary, Error> {
        let lease = self
            .locks
            .acquire(
                LockKind::CycleClose,
                &group_id.to_string(),
                Duration::from_secs(CYCLE_CLOSE_LEASE_TTL_SECS as u64),
            )
            .await?;

        let result = (|| {
            let preconditions = self.check_preconditions(group_id)?;
            if !preconditions.satisfied() {
                return Err(Error::CyclePreconditionsNotMet(format!(
                    "all_received_or_accounted={} rotations_sufficient={} no_outstanding_tx={} no_loss_audit_passes={}",
                    preconditions.all_active_received_or_accounted,
                    preconditions.rotations_sufficient,
                    preconditions.no_outstanding_transactions,
                    preconditions.no_loss_audit.passes,
                )));
            }

            let group = self
                .db
                .get_group(&group_id)?
                .ok_or_else(|| Error::GroupNotFound(group_id.to_string()))?;
            let members = self.db.iter_members_by_group(&group_id)?;

            let now = Utc::now();
            let mut member_updates = Vec::new();
            let mut return_txs = Vec::new();
            let mut total_returned = Money::ZERO;

            for member in &members {
                let mut updated = member.clone();
                updated.is_locked_in = false;

                if matches!(member.deposit_status, DepositStatus::Confirmed | DepositStatus::Locked)
                    && member.deposit_amount.is_positive()
                {
                    updated.deposit_status = DepositStatus::Returned;
                    total_returned += member.deposit_amount;
                    return_txs.push(Transaction {
                        id: TransactionId::new(),
                        group_id,
                        rotation_index: group.current_rotation_index,
                        kind: TransactionKind::DepositReturn,
                        from_member: None,
                        to_member: Some(member.id),
                        amount: member.deposit_amount,
                        status: ConfirmationStatus::BothConfirmed,
                        sender_confirmed_at: Some(now),
                        recipient_confirmed_at: Some(now),
                        deadline_at: None,
                        metadata: Default::default(),
                        created_at: now,
                    });
                }
                member_updates.push(updated);
            }

            let mut new_group = group.clone();
            new_group.status = GroupStatus::Completed;

            self.db.close_cycle_atomically(&new_group, &member_updates, &return_txs)?;

            info!(
                group = %group_id,
                members_returned = return_txs.len(),
                total_returned = %total_returned,
                "cycle closed, deposits returned"
            );

            Ok(CycleSummary {
                group: new_group,
                return_transactions: return_txs,
                total_returned,
            })
        })();

        lease.release().await?;
        result
    }
}

fn sum_amount(transactions: &[Transaction], predicate: impl Fn(&Transaction) -> bool) -> Money {
    transactions
        .iter()
        .filter(|t| predicate(t))
        .fold(Money::ZERO, |acc, t| acc + t.amount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tanda_core::{MemberId, Period};

    fn temp_db() -> Arc<StateDb> {
        let dir = std::env::temp_dir().join(format!("tanda-cycle-test-{}", uuid::Uuid::new_v4()));
        Arc::new(StateDb::open(dir).expect("open temp db"))
    }

    fn seed_group(db: &StateDb, member_limit: i32, completed_rotations: i32) -> Group {
        let g = Group {
            id: GroupId::new(),
            name: "g".into(),
            admin_ref: "admin".into(),
            contribution_amount: Money::from_cents(100_000),
            period: Period::Weekly,
            member_limit,
            deposit_multiplier: "1.0".into(),
            status: GroupStatus::Active,
            current_rotation_index: completed_rotations,
            completed_rotations,
            rotation_started_at: Default::default(),
            created_at: Utc::now(),
        };
        db.put_group(&g).unwrap();
        g
    }

    fn seed_member(
        db: &StateDb,
        group_id: GroupId,
        position: i32,
        deposit_cents: i64,
        received: bool,
    ) -> Member {
        let m = Member {
            id: MemberId::new(),
            group_id,
            external_user_ref: format!("user-{position}"),
            rotation_position: position,
            deposit_amount: Money::from_cents(deposit_cents),
            deposit_status: DepositStatus::Locked,
            has_received_payout: received,
            is_locked_in: received,
            status: MemberStatus::Active,
            created_at: Utc::now(),
        };
        db.put_member(&m).unwrap();
        m
    }

    fn settle_contribution(db: &StateDb, group_id: GroupId, rotation: i32, from: tanda_core::MemberId, to: tanda_core::MemberId, amount: Money) {
        let now = Utc::now();
        db.put_transaction(&Transaction {
            id: TransactionId::new(),
            group_id,
            rotation_index: rotation,
            kind: TransactionKind::Contribution,
            from_member: Some(from),
            to_member: Some(to),
            amount,
            status: ConfirmationStatus::BothConfirmed,
            sender_confirmed_at: Some(now),
            recipient_confirmed_at: Some(now),
            deadline_at: None,
            metadata: Default::default(),
            created_at: now,
        })
        .unwrap();
    }

    #[tokio::test]
    async fn happy_path_cycle_closes_and_returns_all_deposits() {
        let db = temp_db();
        let group = seed_group(&db, 2, 2);
        let m1 = seed_member(&db, group.id, 1, 100_000, true);
        let m2 = seed_member(&db, group.id, 2, 0, true);

        // both rotations' contributions settled, no-loss neutral:
        // m2 paid m1 100_000 in rotation 0, m1 paid m2 100_000 in rotation 1.
        settle_contribution(&db, group.id, 0, m2.id, m1.id, Money::from_cents(100_000));
        settle_contribution(&db, group.id, 1, m1.id, m2.id, Money::from_cents(100_000));

        let locks = Arc::new(LockManager::new(db.clone()));
        let closer = CycleCloser::new(db.clone(), locks);

        let summary = closer.close_cycle(group.id).await.unwrap();
        assert_eq!(summary.group.status, GroupStatus::Completed);
        // only m1 had a positive deposit balance to return.
        assert_eq!(summary.return_transactions.len(), 1);
        assert_eq!(summary.total_returned, Money::from_cents(100_000));

        let stored_m1 = db.get_member(&m1.id).unwrap().unwrap();
        assert_eq!(stored_m1.deposit_status, DepositStatus::Returned);
        assert!(!stored_m1.is_locked_in);
    }

    #[tokio::test]
    async fn preconditions_block_close_with_outstanding_contribution() {
        let db = temp_db();
        let group = seed_group(&db, 2, 2);
        let m1 = seed_member(&db, group.id, 1, 0, true);
        let m2 = seed_member(&db, group.id, 2, 0, true);

        let now = Utc::now();
        db.put_transaction(&Transaction {
            id: TransactionId::new(),
            group_id: group.id,
            rotation_index: 1,
            kind: TransactionKind::Contribution,
            from_member: Some(m1.id),
            to_member: Some(m2.id),
            amount: Money::from_cents(100_000),
            status: ConfirmationStatus::SenderConfirmed,
            sender_confirmed_at: Some(now),
            recipient_confirmed_at: None,
            deadline_at: None,
            metadata: Default::default(),
            created_at: now,
        })
        .unwrap();

        let locks = Arc::new(LockManager::new(db.clone()));
        let closer = CycleCloser::new(db.clone(), locks);
        let err = closer.close_cycle(group.id).await.unwrap_err();
        assert!(matches!(err, Error::CyclePreconditionsNotMet(_)));
    }

    #[tokio::test]
    async fn no_loss_audit_fails_when_member_underwater() {
        let db = temp_db();
        let group = seed_group(&db, 2, 2);
        let m1 = seed_member(&db, group.id, 1, 0, true);
        let m2 = seed_member(&db, group.id, 2, 0, true);

        // m1 paid a contribution but never received anything back: net < 0.
        settle_contribution(&db, group.id, 0, m1.id, m2.id, Money::from_cents(100_000));

        let locks = Arc::new(LockManager::new(db.clone()));
        let closer = CycleCloser::new(db.clone(), locks);
        let audit = closer.run_no_loss_audit(group.id).unwrap();
        assert!(!audit.passes);
        let m1_line = audit.members.iter().find(|m| m.member_id == m1.id).unwrap();
        assert!(!m1_line.no_loss_maintained);
    }
}
