//! DTOs for the JSON-RPC command surface (SPEC_FULL.md §6 command table).
//! Mirrors the teacher's `RpcAccount`/`RpcTimeLock`-style plain-data structs:
//! no domain logic here, only shape for the wire.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcCreateGroup {
    pub name: String,
    pub admin_ref: String,
    pub contribution_amount_cents: i64,
    pub period: String,
    pub member_limit: i32,
    pub deposit_multiplier: Option<String>,
    pub tier: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcJoinGroup {
    pub group_id: String,
    pub external_user_ref: String,
    pub preferred_position: Option<i32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcJoinResult {
    pub member_id: String,
    pub required_deposit_cents: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcConfirmDeposit {
    pub member_id: String,
    pub admin_ref: String,
    pub amount_cents: i64,
    pub reference: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcAck {
    pub ok: bool,
    pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcRecordContribution {
    pub group_id: String,
    pub rotation_index: i32,
    pub from_member: String,
    pub to_member: String,
    pub amount_cents: i64,
    pub external_ref: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcConfirmContribution {
    pub transaction_id: String,
    pub party: String,
    pub actor_ref: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcTransactionState {
    pub transaction_id: String,
    pub status: String,
    pub sender_confirmed: bool,
    pub recipient_confirmed: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcAdvanceRotation {
    pub group_id: String,
    pub expected_index: i32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcRequestLeave {
    pub member_id: String,
    pub actor_ref: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcLeaveDecision {
    pub allowed: bool,
    pub reason: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcCloseCycle {
    pub group_id: String,
    pub admin_ref: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcCycleSummary {
    pub group_id: String,
    pub members_returned: u32,
    pub total_returned_cents: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcAuditFinding {
    pub kind: String,
    pub severity: String,
    pub entity_type: String,
    pub entity_id: String,
    pub message: String,
    pub auto_correctable: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcAuditReport {
    pub findings: Vec<RpcAuditFinding>,
    pub corrected: usize,
}
