use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::money::Money;
use crate::types::{GroupId, LeaseId, MemberId, Period, Timestamp, TransactionId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Active,
    Paused,
    Completed,
    Cancelled,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub admin_ref: String,
    pub contribution_amount: Money,
    pub period: Period,
    pub member_limit: i32,
    /// Rational multiplier stored as a decimal string to keep `Group`
    /// trivially `Serialize`/`Deserialize`-able without pulling `Decimal`
    /// serde features into every call site; parsed via `deposit_multiplier()`.
    pub deposit_multiplier: String,
    pub status: GroupStatus,
    pub current_rotation_index: i32,
    pub completed_rotations: i32,
    /// `rotation_started_at[i]` is the instant rotation index `i` began;
    /// deadlines are always computed from this, never from `created_at`
    /// (see SPEC_FULL.md §9, "deadline start for the first rotation").
    pub rotation_started_at: HashMap<i32, Timestamp>,
    pub created_at: Timestamp,
}

impl Group {
    pub fn deposit_multiplier(&self) -> rust_decimal::Decimal {
        self.deposit_multiplier
            .parse()
            .unwrap_or(rust_decimal::Decimal::ONE)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepositStatus {
    Pending,
    Confirmed,
    Locked,
    Used,
    Returned,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    Pending,
    Active,
    Suspended,
    Removed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Member {
    pub id: MemberId,
    pub group_id: GroupId,
    pub external_user_ref: String,
    /// 1-based rotation position. `<= 0` means excluded from rotation
    /// (removed due to default); never re-enters rotation this cycle
    /// (see SPEC_FULL.md §9 decision).
    pub rotation_position: i32,
    pub deposit_amount: Money,
    pub deposit_status: DepositStatus,
    pub has_received_payout: bool,
    pub is_locked_in: bool,
    pub status: MemberStatus,
    pub created_at: Timestamp,
}

impl Member {
    pub fn is_in_rotation(&self) -> bool {
        self.rotation_position > 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Contribution,
    SecurityDeposit,
    DefaultCoverage,
    DepositReturn,
    TierUpgrade,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationStatus {
    Pending,
    SenderConfirmed,
    RecipientConfirmed,
    BothConfirmed,
    Cancelled,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub group_id: GroupId,
    pub rotation_index: i32,
    pub kind: TransactionKind,
    pub from_member: Option<MemberId>,
    pub to_member: Option<MemberId>,
    pub amount: Money,
    pub status: ConfirmationStatus,
    pub sender_confirmed_at: Option<Timestamp>,
    pub recipient_confirmed_at: Option<Timestamp>,
    pub deadline_at: Option<Timestamp>,
    pub metadata: HashMap<String, String>,
    pub created_at: Timestamp,
}

impl Transaction {
    pub fn is_both_confirmed(&self) -> bool {
        matches!(self.status, ConfirmationStatus::BothConfirmed)
            && self.sender_confirmed_at.is_some()
            && self.recipient_confirmed_at.is_some()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockKind {
    GroupWrite,
    MemberWrite,
    RotationAdvance,
    SecurityDeposit,
    TransactionWrite,
    DefaultHandling,
    CycleClose,
}

impl LockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockKind::GroupWrite => "group_write",
            LockKind::MemberWrite => "member_write",
            LockKind::RotationAdvance => "rotation_advance",
            LockKind::SecurityDeposit => "security_deposit",
            LockKind::TransactionWrite => "transaction_write",
            LockKind::DefaultHandling => "default_handling",
            LockKind::CycleClose => "cycle_close",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Lease {
    pub id: LeaseId,
    pub kind: LockKind,
    pub resource: String,
    pub holder_id: String,
    pub expires_at: Timestamp,
}

impl Lease {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at <= now
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: uuid::Uuid,
    pub group_id: Option<GroupId>,
    pub severity: AuditSeverity,
    pub kind: String,
    pub message: String,
    pub auto_corrected: bool,
    pub created_at: Timestamp,
}
