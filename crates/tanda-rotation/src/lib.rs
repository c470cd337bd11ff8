//! Position assignment and turn advancement. Grounded in the original
//! system's `handle_concurrent_rotation_advance` (conditional update keyed
//! on `current_rotation_position`) — see SPEC_FULL.md §4.3.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::info;

use tanda_core::{
    constants::DEFAULT_LEASE_TTL_SECS, DepositStatus, Error, Group, GroupId, GroupStatus,
    LockKind, Member, MemberStatus, TransactionKind,
};
use tanda_deposit::{assign_deposit_position, required_for_position, GroupConfig};
use tanda_locks::LockManager;
use tanda_state::StateDb;

pub struct AssignedPosition {
    pub position: i32,
    pub required_deposit: tanda_core::Money,
}

pub struct RotationEngine {
    db: Arc<StateDb>,
    locks: Arc<LockManager>,
}

fn group_config(group: &Group) -> GroupConfig {
    GroupConfig {
        contribution_amount: group.contribution_amount,
        member_limit: group.member_limit,
        deposit_multiplier: group.deposit_multiplier(),
    }
}

impl RotationEngine {
    pub fn new(db: Arc<StateDb>, locks: Arc<LockManager>) -> Self {
        Self { db, locks }
    }

    pub async fn assign_position(
        &self,
        group_id: GroupId,
        external_user_ref: &str,
        preferred: Option<i32>,
    ) -> Result<(Member, AssignedPosition), Error> {
        let lease = self
            .locks
            .acquire(
                LockKind::GroupWrite,
                &group_id.to_string(),
                Duration::from_secs(DEFAULT_LEASE_TTL_SECS as u64),
            )
            .await?;

        let result = async {
            let group = self.db.get_group(&group_id)?.ok_or_else(|| Error::GroupNotFound(group_id.to_string()))?;
            if !matches!(group.status, GroupStatus::Active | GroupStatus::Paused) {
                return Err(Error::GroupHalted);
            }

            let existing = self.db.iter_members_by_group(&group_id)?;
            if existing.len() as i32 >= group.member_limit {
                return Err(Error::GroupFull);
            }
            let occupied: Vec<i32> = existing.iter().map(|m| m.rotation_position).filter(|p| *p > 0).collect();

            let cfg = group_config(&group);
            let position = assign_deposit_position(&cfg, &occupied, preferred)?;
            let required_deposit = required_for_position(&cfg, position)?;

            let member = Member {
                id: tanda_core::MemberId::new(),
                group_id,
                external_user_ref: external_user_ref.to_string(),
                rotation_position: position,
                deposit_amount: tanda_core::Money::ZERO,
                deposit_status: DepositStatus::Pending,
                has_received_payout: false,
                is_locked_in: false,
                status: MemberStatus::Pending,
                created_at: Utc::now(),
            };
            self.db.put_member(&member)?;

            info!(group = %group_id, position, "member assigned position");
            Ok((member, AssignedPosition { position, required_deposit }))
        }
        .await;

        lease.release().await?;
        result
    }

    /// Advances the rotation by one turn, predicated on `expected_index`
    /// still matching the stored `current_rotation_index`.
    pub async fn advance_rotation(&self, group_id: GroupId, expected_index: i32) -> Result<i32, Error> {
        let lease = self
            .locks
            .acquire(
                LockKind::RotationAdvance,
                &group_id.to_string(),
                Duration::from_secs(DEFAULT_LEASE_TTL_SECS as u64),
            )
            .await?;

        let result = async {
            let group = self.db.get_group(&group_id)?.ok_or_else(|| Error::GroupNotFound(group_id.to_string()))?;
            if group.current_rotation_index != expected_index {
                return Err(Error::Stale);
            }
            if !matches!(group.status, GroupStatus::Active) {
                return Err(Error::GroupHalted);
            }

            let outstanding = self
                .db
                .iter_transactions_by_group(&group_id)?
                .into_iter()
                .filter(|t| t.rotation_index == group.current_rotation_index && t.kind == TransactionKind::Contribution)
                .any(|t| {
                    matches!(
                        t.status,
                        tanda_core::ConfirmationStatus::Pending
                            | tanda_core::ConfirmationStatus::SenderConfirmed
                            | tanda_core::ConfirmationStatus::RecipientConfirmed
                    )
                });
            if outstanding {
                return Err(Error::RotationBlocked);
            }

            let receiving_position = group.current_rotation_index + 1;
            let members = self.db.iter_members_by_group(&group_id)?;
            let recipient = members
                .into_iter()
                .find(|m| m.rotation_position == receiving_position && matches!(m.status, MemberStatus::Active))
                .ok_or_else(|| Error::Invariant(format!("no active member at position {receiving_position}")))?;

            let mut new_group = group.clone();
            new_group.current_rotation_index += 1;
            new_group.completed_rotations += 1;
            new_group
                .rotation_started_at
                .insert(new_group.current_rotation_index, Utc::now());
            if !self.db.cas_put_group(&group, &new_group)? {
                return Err(Error::Stale);
            }

            let mut new_member = recipient.clone();
            new_member.has_received_payout = true;
            new_member.is_locked_in = true;
            new_member.deposit_status = DepositStatus::Locked;
            if !self.db.cas_put_member(&recipient, &new_member)? {
                return Err(Error::Stale);
            }

            info!(group = %group_id, new_index = new_group.current_rotation_index, "rotation advanced");
            Ok(new_group.current_rotation_index)
        }
        .await;

        lease.release().await?;
        result
    }

    pub fn eligible_for_payout(member: &Member) -> bool {
        matches!(member.status, MemberStatus::Active)
            && matches!(member.deposit_status, DepositStatus::Confirmed)
            && !member.has_received_payout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tanda_core::{ConfirmationStatus, Money, Period, Transaction, TransactionId};

    fn temp_db() -> Arc<StateDb> {
        let dir = std::env::temp_dir().join(format!("tanda-rotation-test-{}", uuid::Uuid::new_v4()));
        Arc::new(StateDb::open(dir).expect("open temp db"))
    }

    fn seed_group(db: &StateDb, member_limit: i32) -> Group {
        let g = Group {
            id: GroupId::new(),
            name: "g".into(),
            admin_ref: "admin".into(),
            contribution_amount: Money::from_cents(100_00),
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

    #[tokio::test]
    async fn assign_then_advance_happy_path() {
        let db = temp_db();
        let group = seed_group(&db, 3);
        let locks = Arc::new(LockManager::new(db.clone()));
        let engine = RotationEngine::new(db.clone(), locks);

        let (m1, a1) = engine.assign_position(group.id, "u1", None).await.unwrap();
        assert_eq!(a1.position, 1);
        let (_m2, a2) = engine.assign_position(group.id, "u2", None).await.unwrap();
        assert_eq!(a2.position, 2);

        // Activate m1 so it's eligible to receive.
        let mut active_m1 = m1.clone();
        active_m1.status = MemberStatus::Active;
        active_m1.deposit_status = DepositStatus::Confirmed;
        db.cas_put_member(&m1, &active_m1).unwrap();
        assert!(RotationEngine::eligible_for_payout(&active_m1));

        let new_index = engine.advance_rotation(group.id, 0).await.unwrap();
        assert_eq!(new_index, 1);
        let updated = db.get_member(&m1.id).unwrap().unwrap();
        assert!(updated.has_received_payout);
        assert!(updated.is_locked_in);
    }

    #[tokio::test]
    async fn advance_rejects_stale_expected_index() {
        let db = temp_db();
        let group = seed_group(&db, 3);
        let locks = Arc::new(LockManager::new(db.clone()));
        let engine = RotationEngine::new(db.clone(), locks);
        let err = engine.advance_rotation(group.id, 5).await.unwrap_err();
        assert!(matches!(err, Error::Stale));
    }

    #[tokio::test]
    async fn advance_blocked_by_outstanding_contribution() {
        let db = temp_db();
        let group = seed_group(&db, 2);
        let locks = Arc::new(LockManager::new(db.clone()));
        let engine = RotationEngine::new(db.clone(), locks);

        let (m1, _) = engine.assign_position(group.id, "u1", None).await.unwrap();
        let mut active_m1 = m1.clone();
        active_m1.status = MemberStatus::Active;
        db.cas_put_member(&m1, &active_m1).unwrap();

        let tx = Transaction {
            id: TransactionId::new(),
            group_id: group.id,
            rotation_index: 0,
            kind: TransactionKind::Contribution,
            from_member: None,
            to_member: Some(m1.id),
            amount: Money::from_cents(10000),
            status: ConfirmationStatus::Pending,
            sender_confirmed_at: None,
            recipient_confirmed_at: None,
            deadline_at: None,
            metadata: Default::default(),
            created_at: Utc::now(),
        };
        db.put_transaction(&tx).unwrap();

        let err = engine.advance_rotation(group.id, 0).await.unwrap_err();
        assert!(matches!(err, Error::RotationBlocked));
    }

    #[tokio::test]
    async fn assign_rejects_full_group() {
        let db = temp_db();
        let group = seed_group(&db, 1);
        let locks = Arc::new(LockManager::new(db.clone()));
        let engine = RotationEngine::new(db.clone(), locks);
        engine.assign_position(group.id, "u1", None).await.unwrap();
        let err = engine.assign_position(group.id, "u2", None).await.unwrap_err();
        assert!(matches!(err, Error::GroupFull));
    }
}
