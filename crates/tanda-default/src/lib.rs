//! Deposit draw-down, suspension, and replenishment pipeline triggered when
//! a contribution is not confirmed by its deadline. Grounded in the
//! original system's `handle_contribution_default` /
//! `apply_default_consequences` and `handle_concurrent_security_deposit_usage`
//! — see SPEC_FULL.md §4.5.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use tanda_core::{
    constants::DEFAULT_LEASE_TTL_SECS, AuditEvent, AuditSeverity, ConfirmationStatus, DepositStatus,
    Error, Group, GroupId, GroupStatus, LockKind, Member, MemberId, MemberStatus, Money, Transaction,
    TransactionId, TransactionKind,
};
use tanda_deposit::{required_for_position, GroupConfig};
use tanda_locks::LockManager;
use tanda_state::StateDb;

fn group_config(group: &Group) -> GroupConfig {
    GroupConfig {
        contribution_amount: group.contribution_amount,
        member_limit: group.member_limit,
        deposit_multiplier: group.deposit_multiplier(),
    }
}

pub struct DefaultOutcome {
    pub coverage_tx: Transaction,
    pub member: Member,
    pub replenishment_required: Money,
}

pub struct DefaultHandler {
    db: Arc<StateDb>,
    locks: Arc<LockManager>,
}

impl DefaultHandler {
    pub fn new(db: Arc<StateDb>, locks: Arc<LockManager>) -> Self {
        Self { db, locks }
    }

    async fn halt_group(&self, group_id: GroupId, reason: &str) -> Result<(), Error> {
        let lease = self
            .locks
            .acquire(
                LockKind::GroupWrite,
                &group_id.to_string(),
                Duration::from_secs(DEFAULT_LEASE_TTL_SECS as u64),
            )
            .await?;
        let result = (|| {
            if let Some(group) = self.db.get_group(&group_id)? {
                let mut halted = group.clone();
                halted.status = GroupStatus::Paused;
                self.db.cas_put_group(&group, &halted)?;
            }
            self.db.append_audit_event(&AuditEvent {
                id: uuid::Uuid::new_v4(),
                group_id: Some(group_id),
                severity: AuditSeverity::Critical,
                kind: "group_halted".into(),
                message: reason.to_string(),
                auto_corrected: false,
                created_at: Utc::now(),
            })?;
            warn!(group = %group_id, reason, "group halted pending operator review");
            Ok(())
        })();
        lease.release().await?;
        result
    }

    /// Handles a confirmed contribution default: draws from the defaulting
    /// member's deposit to cover the missed payment, suspends them, and
    /// (if they had not yet received a payout) permanently removes them
    /// from the rotation order.
    pub async fn handle_default(
        &self,
        group_id: GroupId,
        rotation_index: i32,
        defaulting_member_id: MemberId,
        recipient_member_id: MemberId,
        owed_amount: Money,
    ) -> Result<DefaultOutcome, Error> {
        let handling_key = format!("{group_id}:{defaulting_member_id}");
        let lease = self
            .locks
            .acquire(
                LockKind::DefaultHandling,
                &handling_key,
                Duration::from_secs(DEFAULT_LEASE_TTL_SECS as u64),
            )
            .await?;

        let result = async {
            let member = self
                .db
                .get_member(&defaulting_member_id)?
                .ok_or_else(|| Error::MemberNotFound(defaulting_member_id.to_string()))?;

            // A `default_coverage` transaction is unique per (group,
            // rotation_index, defaulting_member) — see SPEC_FULL.md §5/§8.
            // If the default signal for this rotation/member already ran
            // (e.g. a re-delivered timer fire), return the existing outcome
            // instead of debiting the deposit a second time.
            if let Some(existing_tx) = self.db.iter_transactions_by_group(&group_id)?.into_iter().find(|t| {
                t.kind == TransactionKind::DefaultCoverage
                    && t.rotation_index == rotation_index
                    && t.from_member == Some(defaulting_member_id)
            }) {
                let cfg_group = self.db.get_group(&group_id)?.ok_or_else(|| Error::GroupNotFound(group_id.to_string()))?;
                let cfg = group_config(&cfg_group);
                let replenishment_required = if member.rotation_position >= 1 {
                    required_for_position(&cfg, member.rotation_position)?
                        .checked_sub(member.deposit_amount)
                        .unwrap_or(Money::ZERO)
                } else {
                    Money::ZERO
                };
                info!(
                    group = %group_id,
                    member = %defaulting_member_id,
                    rotation_index,
                    "default already handled for this rotation, returning existing coverage"
                );
                return Ok(DefaultOutcome {
                    coverage_tx: existing_tx,
                    member,
                    replenishment_required,
                });
            }

            if !matches!(member.deposit_status, DepositStatus::Confirmed | DepositStatus::Locked)
                || member.deposit_amount < owed_amount
            {
                self.halt_group(group_id, "member has no deposit to cover default").await?;
                return Err(Error::GroupHalted);
            }

            // Step 2: draw down the deposit under the member's own lease.
            let deposit_lease = self
                .locks
                .acquire(
                    LockKind::SecurityDeposit,
                    &defaulting_member_id.to_string(),
                    Duration::from_secs(DEFAULT_LEASE_TTL_SECS as u64),
                )
                .await?;
            let debited = (|| {
                let remaining = member
                    .deposit_amount
                    .checked_sub(owed_amount)
                    .ok_or_else(|| Error::InsufficientDeposit {
                        need: owed_amount.to_string(),
                        have: member.deposit_amount.to_string(),
                    })?;
                let mut after_debit = member.clone();
                after_debit.deposit_amount = remaining;
                after_debit.deposit_status = if remaining.is_zero() {
                    DepositStatus::Used
                } else {
                    DepositStatus::Locked
                };
                if !self.db.cas_put_member(&member, &after_debit)? {
                    return Err(Error::Stale);
                }
                Ok(after_debit)
            })();
            deposit_lease.release().await?;
            let member = debited?;

            // Step 3: insert the default_coverage transaction, already settled.
            let now = Utc::now();
            let coverage_tx = Transaction {
                id: TransactionId::new(),
                group_id,
                rotation_index,
                kind: TransactionKind::DefaultCoverage,
                from_member: Some(defaulting_member_id),
                to_member: Some(recipient_member_id),
                amount: owed_amount,
                status: ConfirmationStatus::BothConfirmed,
                sender_confirmed_at: Some(now),
                recipient_confirmed_at: Some(now),
                deadline_at: None,
                metadata: Default::default(),
                created_at: now,
            };
            self.db.put_transaction(&coverage_tx)?;

            // Step 4: consequences, under the group-structural lease.
            let group_lease = self
                .locks
                .acquire(
                    LockKind::GroupWrite,
                    &group_id.to_string(),
                    Duration::from_secs(DEFAULT_LEASE_TTL_SECS as u64),
                )
                .await?;
            let outcome = (|| {
                let group = self.db.get_group(&group_id)?.ok_or_else(|| Error::GroupNotFound(group_id.to_string()))?;
                let cfg = group_config(&group);

                let mut suspended = member.clone();
                suspended.status = MemberStatus::Suspended;
                suspended.is_locked_in = true;

                let replenishment_required = if !member.has_received_payout {
                    let old_position = member.rotation_position;
                    suspended.rotation_position = -1;

                    let peers = self.db.iter_members_by_group(&group_id)?;
                    for peer in peers {
                        if peer.id != defaulting_member_id && peer.rotation_position > old_position {
                            let mut shifted = peer.clone();
                            shifted.rotation_position -= 1;
                            self.db.cas_put_member(&peer, &shifted)?;
                        }
                    }

                    if old_position >= 1 && old_position <= cfg.member_limit {
                        required_for_position(&cfg, old_position)?.checked_sub(suspended.deposit_amount).unwrap_or(Money::ZERO)
                    } else {
                        Money::ZERO
                    }
                } else if suspended.rotation_position >= 1 {
                    required_for_position(&cfg, suspended.rotation_position)?
                        .checked_sub(suspended.deposit_amount)
                        .unwrap_or(Money::ZERO)
                } else {
                    Money::ZERO
                };

                if !self.db.cas_put_member(&member, &suspended)? {
                    return Err(Error::Stale);
                }

                info!(
                    group = %group_id,
                    member = %defaulting_member_id,
                    replenishment = %replenishment_required,
                    "default handled: deposit drawn, member suspended"
                );

                Ok(DefaultOutcome {
                    coverage_tx: coverage_tx.clone(),
                    member: suspended,
                    replenishment_required,
                })
            })();
            group_lease.release().await?;
            outcome
        }
        .await;

        lease.release().await?;
        result
    }

    /// Applies a replenishment payment, restoring the member to `confirmed`
    /// deposit status once the balance covers the required amount. A
    /// member previously removed from rotation (position `<= 0`) never
    /// returns to `active`: it remains `suspended` as a passive, pay-in-only
    /// participant until cycle close (see SPEC_FULL.md §9).
    pub async fn replenish(&self, group_id: GroupId, member_id: MemberId, amount: Money) -> Result<Member, Error> {
        let lease = self
            .locks
            .acquire(
                LockKind::SecurityDeposit,
                &member_id.to_string(),
                Duration::from_secs(DEFAULT_LEASE_TTL_SECS as u64),
            )
            .await?;

        let result = (|| {
            let group = self.db.get_group(&group_id)?.ok_or_else(|| Error::GroupNotFound(group_id.to_string()))?;
            let member = self.db.get_member(&member_id)?.ok_or_else(|| Error::MemberNotFound(member_id.to_string()))?;
            if !matches!(member.status, MemberStatus::Suspended) {
                return Err(Error::MemberNotSuspendable("member is not suspended".into()));
            }

            let mut updated = member.clone();
            updated.deposit_amount += amount;

            let cfg = group_config(&group);
            let sufficient = if updated.rotation_position >= 1 {
                updated.deposit_amount >= required_for_position(&cfg, updated.rotation_position)?
            } else {
                true
            };
            if sufficient {
                updated.deposit_status = DepositStatus::Confirmed;
                if updated.rotation_position >= 1 {
                    updated.status = MemberStatus::Active;
                }
            }

            if !self.db.cas_put_member(&member, &updated)? {
                return Err(Error::Stale);
            }
            info!(group = %group_id, member = %member_id, "deposit replenished");
            Ok(updated)
        })();

        lease.release().await?;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tanda_core::Period;

    fn temp_db() -> Arc<StateDb> {
        let dir = std::env::temp_dir().join(format!("tanda-default-test-{}", uuid::Uuid::new_v4()));
        Arc::new(StateDb::open(dir).expect("open temp db"))
    }

    fn seed_group(db: &StateDb, member_limit: i32) -> Group {
        let g = Group {
            id: GroupId::new(),
            name: "g".into(),
            admin_ref: "admin".into(),
            contribution_amount: Money::from_cents(50_000),
            period: Period::Weekly,
            member_limit,
            deposit_multiplier: "1.0".into(),
            status: GroupStatus::Active,
            current_rotation_index: 0,
            completed_rotations: 0,
            rotation_started_at: Default::default(),
            created_at: Utc::now(),
        };
        db.put_group(&g).unwrap();
        g
    }

    fn seed_member(db: &StateDb, group_id: GroupId, position: i32, deposit_cents: i64) -> Member {
        let m = Member {
            id: MemberId::new(),
            group_id,
            external_user_ref: format!("user-{position}"),
            rotation_position: position,
            deposit_amount: Money::from_cents(deposit_cents),
            deposit_status: DepositStatus::Confirmed,
            has_received_payout: false,
            is_locked_in: false,
            status: MemberStatus::Active,
            created_at: Utc::now(),
        };
        db.put_member(&m).unwrap();
        m
    }

    #[tokio::test]
    async fn default_draws_deposit_and_suspends() {
        let db = temp_db();
        let group = seed_group(&db, 5);
        let defaulting = seed_member(&db, group.id, 2, 150_000); // needs 150_000 for pos 2
        let recipient = seed_member(&db, group.id, 3, 100_000);
        let other_high = seed_member(&db, group.id, 4, 50_000);

        let locks = Arc::new(LockManager::new(db.clone()));
        let handler = DefaultHandler::new(db.clone(), locks);

        let outcome = handler
            .handle_default(group.id, 0, defaulting.id, recipient.id, Money::from_cents(50_000))
            .await
            .unwrap();

        assert_eq!(outcome.member.status, MemberStatus::Suspended);
        assert_eq!(outcome.member.rotation_position, -1);
        assert_eq!(outcome.member.deposit_amount, Money::from_cents(100_000));
        assert!(outcome.coverage_tx.is_both_confirmed());

        // position 4 shifted down to 3
        let shifted = db.get_member(&other_high.id).unwrap().unwrap();
        assert_eq!(shifted.rotation_position, 3);
    }

    #[tokio::test]
    async fn repeated_default_signal_does_not_redebit_or_duplicate_coverage() {
        let db = temp_db();
        let group = seed_group(&db, 5);
        let defaulting = seed_member(&db, group.id, 2, 150_000);
        let recipient = seed_member(&db, group.id, 3, 100_000);

        let locks = Arc::new(LockManager::new(db.clone()));
        let handler = DefaultHandler::new(db.clone(), locks);

        let first = handler
            .handle_default(group.id, 0, defaulting.id, recipient.id, Money::from_cents(50_000))
            .await
            .unwrap();
        let second = handler
            .handle_default(group.id, 0, defaulting.id, recipient.id, Money::from_cents(50_000))
            .await
            .unwrap();

        assert_eq!(first.coverage_tx.id, second.coverage_tx.id);
        assert_eq!(second.member.deposit_amount, Money::from_cents(100_000));

        let coverage_txs: Vec<_> = db
            .iter_transactions_by_group(&group.id)
            .unwrap()
            .into_iter()
            .filter(|t| t.kind == TransactionKind::DefaultCoverage)
            .collect();
        assert_eq!(coverage_txs.len(), 1);
    }

    #[tokio::test]
    async fn insufficient_deposit_halts_group() {
        let db = temp_db();
        let group = seed_group(&db, 5);
        let defaulting = seed_member(&db, group.id, 2, 10_000);
        let recipient = seed_member(&db, group.id, 3, 100_000);

        let locks = Arc::new(LockManager::new(db.clone()));
        let handler = DefaultHandler::new(db.clone(), locks);

        let err = handler
            .handle_default(group.id, 0, defaulting.id, recipient.id, Money::from_cents(50_000))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::GroupHalted));

        let halted_group = db.get_group(&group.id).unwrap().unwrap();
        assert_eq!(halted_group.status, GroupStatus::Paused);
    }

    #[tokio::test]
    async fn replenishment_restores_confirmed_but_not_rotation() {
        let db = temp_db();
        let group = seed_group(&db, 5);
        let defaulting = seed_member(&db, group.id, 2, 150_000);
        let recipient = seed_member(&db, group.id, 3, 100_000);

        let locks = Arc::new(LockManager::new(db.clone()));
        let handler = DefaultHandler::new(db.clone(), locks);
        let outcome = handler
            .handle_default(group.id, 0, defaulting.id, recipient.id, Money::from_cents(50_000))
            .await
            .unwrap();

        let replenished = handler
            .replenish(group.id, outcome.member.id, outcome.replenishment_required)
            .await
            .unwrap();

        assert_eq!(replenished.deposit_status, DepositStatus::Confirmed);
        // still excluded from rotation even though deposit is whole again
        assert_eq!(replenished.rotation_position, -1);
        assert_eq!(replenished.status, MemberStatus::Suspended);
    }
}
