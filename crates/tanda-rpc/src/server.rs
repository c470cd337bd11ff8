use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jsonrpsee::core::{async_trait, RpcResult};
use jsonrpsee::server::{Server, ServerHandle};
use jsonrpsee::types::ErrorObject;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use tanda_audit::ConsistencyAuditor;
use tanda_contribution::{ContributionFsm, Party};
use tanda_core::constants::{
    DEFAULT_LEASE_TTL_SECS, MAX_DEPOSIT_MULTIPLIER, MIN_DEPOSIT_MULTIPLIER, MIN_GROUP_MEMBERS,
    REMINDER_OFFSETS_HOURS, RETRY_MAX_ATTEMPTS,
};
use tanda_core::{
    ConfirmationStatus, DepositStatus, Error, ErrorKind, Group, GroupId, GroupStatus, LockKind,
    Member, MemberId, MemberStatus, Money, Period, Transaction, TransactionId, TransactionKind,
};
use tanda_cycle::CycleCloser;
use tanda_default::DefaultHandler;
use tanda_deposit::{required_for_position, GroupConfig};
use tanda_ports::{CoreContext, GroupTier};
use tanda_rotation::RotationEngine;

use crate::api::TandaApiServer;
use crate::types::{
    RpcAck, RpcAdvanceRotation, RpcAuditFinding, RpcAuditReport, RpcCloseCycle,
    RpcConfirmContribution, RpcConfirmDeposit, RpcCreateGroup, RpcCycleSummary, RpcJoinGroup,
    RpcJoinResult, RpcLeaveDecision, RpcRecordContribution, RpcRequestLeave, RpcTransactionState,
};

fn rpc_err(code: i32, msg: impl Into<String>) -> ErrorObject<'static> {
    ErrorObject::owned(code, msg.into(), None::<()>)
}

/// Maps a domain error to a stable JSON-RPC error code by `ErrorKind`,
/// mirroring the workspace's prior RPC server's one-function error mapping.
fn domain_err(e: Error) -> ErrorObject<'static> {
    let code = match e.kind() {
        ErrorKind::Validation => -32602,
        ErrorKind::Precondition => -32001,
        ErrorKind::Conflict => -32002,
        ErrorKind::Invariant => -32003,
        ErrorKind::External => -32004,
        ErrorKind::Transient => -32005,
        ErrorKind::NotFound => -32006,
        ErrorKind::Other => -32000,
    };
    rpc_err(code, e.to_string())
}

fn parse_period(s: &str) -> Result<Period, Error> {
    match s.to_ascii_lowercase().as_str() {
        "daily" => Ok(Period::Daily),
        "weekly" => Ok(Period::Weekly),
        "monthly" => Ok(Period::Monthly),
        other => Err(Error::InvalidGroup(format!("unknown period: {other}"))),
    }
}

fn parse_party(s: &str) -> Result<Party, Error> {
    match s.to_ascii_lowercase().as_str() {
        "sender" => Ok(Party::Sender),
        "recipient" => Ok(Party::Recipient),
        other => Err(Error::Other(format!("unknown party: {other}"))),
    }
}

fn money_to_cents(m: Money) -> i64 {
    let scaled = (m.as_decimal() * rust_decimal::Decimal::ONE_HUNDRED).round();
    scaled.to_string().parse::<i64>().unwrap_or(0)
}

fn group_config(group: &Group) -> GroupConfig {
    GroupConfig {
        contribution_amount: group.contribution_amount,
        member_limit: group.member_limit,
        deposit_multiplier: group.deposit_multiplier(),
    }
}

/// Shared state passed to the RPC server: the wired `CoreContext` plus one
/// instance of each engine, mirroring the teacher's `RpcServerState`.
pub struct RpcServerState {
    pub ctx: Arc<CoreContext>,
    pub rotation: RotationEngine,
    pub contribution: ContributionFsm,
    pub default_handler: DefaultHandler,
    pub cycle: CycleCloser,
    pub auditor: ConsistencyAuditor,
}

impl RpcServerState {
    pub fn new(ctx: Arc<CoreContext>) -> Self {
        let rotation = RotationEngine::new(ctx.db.clone(), ctx.locks.clone());
        let contribution = ContributionFsm::new(ctx.db.clone(), ctx.locks.clone());
        let default_handler = DefaultHandler::new(ctx.db.clone(), ctx.locks.clone());
        let cycle = CycleCloser::new(ctx.db.clone(), ctx.locks.clone());
        let auditor = ConsistencyAuditor::new(ctx.db.clone());
        Self {
            ctx,
            rotation,
            contribution,
            default_handler,
            cycle,
            auditor,
        }
    }
}

pub struct RpcServer {
    state: Arc<RpcServerState>,
}

impl RpcServer {
    pub fn new(state: Arc<RpcServerState>) -> Self {
        Self { state }
    }

    /// Starts the JSON-RPC server on `addr` with permissive CORS, matching
    /// the teacher's `RpcServer::start`.
    pub async fn start(self, addr: SocketAddr) -> anyhow::Result<ServerHandle> {
        let cors = CorsLayer::new()
            .allow_methods(Any)
            .allow_origin(Any)
            .allow_headers(Any);

        let server = Server::builder()
            .set_http_middleware(tower::ServiceBuilder::new().layer(cors))
            .build(addr)
            .await?;

        let module = self.into_rpc();
        let handle = server.start(module);
        info!(%addr, "tanda RPC server started");
        Ok(handle)
    }
}

// ── confirm_deposit: admin-confirmed funding of a member's security deposit ─
//
// Not owned by any engine crate — grounded in the same CAS-retry-loop shape
// `ContributionFsm::confirm` uses, since no richer state machine is needed
// for a single monotonic top-up.
async fn confirm_deposit_inner(
    ctx: &CoreContext,
    member_id: MemberId,
    amount: Money,
) -> Result<Member, Error> {
    let lease = ctx
        .locks
        .acquire(
            LockKind::SecurityDeposit,
            &member_id.to_string(),
            Duration::from_secs(DEFAULT_LEASE_TTL_SECS as u64),
        )
        .await?;

    let result = (|| {
        for _ in 0..RETRY_MAX_ATTEMPTS {
            let member = ctx
                .db
                .get_member(&member_id)?
                .ok_or_else(|| Error::MemberNotFound(member_id.to_string()))?;
            let group = ctx
                .db
                .get_group(&member.group_id)?
                .ok_or_else(|| Error::GroupNotFound(member.group_id.to_string()))?;

            if !matches!(member.deposit_status, DepositStatus::Pending | DepositStatus::Confirmed) {
                return Err(Error::InvalidTransition {
                    from: format!("{:?}", member.deposit_status),
                    event: "confirm_deposit".into(),
                });
            }

            let mut new_member = member.clone();
            new_member.deposit_amount += amount;

            let cfg = group_config(&group);
            let position = member.rotation_position.max(1).min(group.member_limit.max(1));
            if let Ok(required) = required_for_position(&cfg, position) {
                if new_member.deposit_amount >= required {
                    new_member.deposit_status = DepositStatus::Confirmed;
                    if matches!(new_member.status, MemberStatus::Pending) {
                        new_member.status = MemberStatus::Active;
                    }
                }
            }

            if ctx.db.cas_put_member(&member, &new_member)? {
                return Ok(new_member);
            }
        }
        Err(Error::Stale)
    })();

    lease.release().await?;
    result
}

// ── request_leave: pure eligibility check, no state change (§8 scenario 6) ──
fn request_leave_decision(member: &Member) -> (bool, String) {
    if member.is_locked_in {
        return (
            false,
            "member is locked in: they have received their payout and must remain until cycle close".into(),
        );
    }
    if matches!(member.status, MemberStatus::Removed) {
        return (false, "member has already left the group".into());
    }
    if member.has_received_payout {
        return (false, "member has already received a payout this cycle".into());
    }
    (true, "member has not yet received a payout and is not locked in".into())
}

#[async_trait]
impl TandaApiServer for RpcServer {
    async fn create_group(&self, req: RpcCreateGroup) -> RpcResult<String> {
        let period = parse_period(&req.period).map_err(domain_err)?;
        let tier = GroupTier::parse(&req.tier).unwrap_or(GroupTier::Basic);
        let max_members = self.state.ctx.tiers.max_members(tier);

        if req.member_limit < MIN_GROUP_MEMBERS || req.member_limit > max_members {
            return Err(domain_err(Error::InvalidMemberLimit(req.member_limit)));
        }
        if req.contribution_amount_cents <= 0 {
            return Err(domain_err(Error::ZeroAmount));
        }

        let multiplier = req.deposit_multiplier.unwrap_or_else(|| "1.0".to_string());
        let parsed_multiplier: rust_decimal::Decimal = multiplier
            .parse()
            .map_err(|_| domain_err(Error::InvalidMultiplier(multiplier.clone())))?;
        let min: rust_decimal::Decimal = MIN_DEPOSIT_MULTIPLIER.parse().expect("valid constant");
        let max: rust_decimal::Decimal = MAX_DEPOSIT_MULTIPLIER.parse().expect("valid constant");
        if parsed_multiplier < min || parsed_multiplier > max {
            return Err(domain_err(Error::InvalidMultiplier(multiplier)));
        }

        let group_id = GroupId::new();
        let mut rotation_started_at = std::collections::HashMap::new();
        rotation_started_at.insert(0, Utc::now());

        let group = Group {
            id: group_id,
            name: req.name,
            admin_ref: req.admin_ref,
            contribution_amount: Money::from_cents(req.contribution_amount_cents),
            period,
            member_limit: req.member_limit,
            deposit_multiplier: multiplier,
            status: GroupStatus::Active,
            current_rotation_index: 0,
            completed_rotations: 0,
            rotation_started_at,
            created_at: Utc::now(),
        };

        self.state.ctx.db.put_group(&group).map_err(domain_err)?;
        info!(group = %group_id, "group created");
        Ok(group_id.to_string())
    }

    async fn join_group(&self, req: RpcJoinGroup) -> RpcResult<RpcJoinResult> {
        let group_id = GroupId::parse(&req.group_id).map_err(|e| rpc_err(-32602, e.to_string()))?;
        let (member, assigned) = self
            .state
            .rotation
            .assign_position(group_id, &req.external_user_ref, req.preferred_position)
            .await
            .map_err(domain_err)?;

        Ok(RpcJoinResult {
            member_id: member.id.to_string(),
            required_deposit_cents: money_to_cents(assigned.required_deposit),
        })
    }

    async fn confirm_deposit(&self, req: RpcConfirmDeposit) -> RpcResult<RpcAck> {
        let member_id = MemberId::parse(&req.member_id).map_err(|e| rpc_err(-32602, e.to_string()))?;
        let amount = Money::from_cents(req.amount_cents);
        let member = confirm_deposit_inner(&self.state.ctx, member_id, amount)
            .await
            .map_err(domain_err)?;
        Ok(RpcAck {
            ok: true,
            message: format!(
                "deposit confirmed for member {member_id}, status={:?}, reference={}",
                member.deposit_status, req.reference
            ),
        })
    }

    async fn record_contribution(&self, req: RpcRecordContribution) -> RpcResult<String> {
        let group_id = GroupId::parse(&req.group_id).map_err(|e| rpc_err(-32602, e.to_string()))?;
        let from_member = MemberId::parse(&req.from_member).map_err(|e| rpc_err(-32602, e.to_string()))?;
        let to_member = MemberId::parse(&req.to_member).map_err(|e| rpc_err(-32602, e.to_string()))?;

        let group = self
            .state
            .ctx
            .db
            .get_group(&group_id)
            .map_err(domain_err)?
            .ok_or_else(|| domain_err(Error::GroupNotFound(group_id.to_string())))?;
        let deadline_at = group
            .rotation_started_at
            .get(&req.rotation_index)
            .map(|started| *started + chrono::Duration::hours(group.period.deadline_hours()));

        let mut tx = self
            .state
            .contribution
            .record_contribution(
                group_id,
                req.rotation_index,
                from_member,
                to_member,
                Money::from_cents(req.amount_cents),
                deadline_at,
            )
            .map_err(domain_err)?;
        tx.metadata.insert("external_ref".to_string(), req.external_ref);
        self.state.ctx.db.put_transaction(&tx).map_err(domain_err)?;

        if let Some(fire_at) = deadline_at {
            let _ = self
                .state
                .ctx
                .scheduler
                .arm(
                    &tx.id.to_string(),
                    fire_at,
                    serde_json::json!({
                        "kind": "deadline",
                        "group_id": group_id.to_string(),
                        "transaction_id": tx.id.to_string(),
                    }),
                )
                .await;

            let now = Utc::now();
            for offset_hours in REMINDER_OFFSETS_HOURS {
                let reminder_at = fire_at - chrono::Duration::hours(offset_hours);
                if reminder_at <= now {
                    // Deadline already inside this offset window; not feasible to remind.
                    continue;
                }
                let _ = self
                    .state
                    .ctx
                    .scheduler
                    .arm(
                        &format!("{}:reminder:{offset_hours}", tx.id),
                        reminder_at,
                        serde_json::json!({
                            "kind": "reminder",
                            "group_id": group_id.to_string(),
                            "transaction_id": tx.id.to_string(),
                            "hours_before": offset_hours,
                        }),
                    )
                    .await;
            }
        }

        Ok(tx.id.to_string())
    }

    async fn confirm_contribution(&self, req: RpcConfirmContribution) -> RpcResult<RpcTransactionState> {
        let transaction_id =
            TransactionId::parse(&req.transaction_id).map_err(|e| rpc_err(-32602, e.to_string()))?;
        let party = parse_party(&req.party).map_err(domain_err)?;
        let outcome = self
            .state
            .contribution
            .confirm(transaction_id, party)
            .await
            .map_err(domain_err)?;
        let tx = outcome.transaction;

        if outcome.newly_completed {
            let _ = self
                .state
                .ctx
                .events
                .publish(
                    tx.group_id,
                    tanda_ports::DomainEvent::ContributionCompleted { transaction_id: tx.id },
                )
                .await;

            let still_outstanding = self
                .state
                .ctx
                .db
                .iter_transactions_by_group(&tx.group_id)
                .map_err(domain_err)?
                .into_iter()
                .filter(|t| t.rotation_index == tx.rotation_index && t.kind == TransactionKind::Contribution)
                .any(|t| {
                    matches!(
                        t.status,
                        ConfirmationStatus::Pending
                            | ConfirmationStatus::SenderConfirmed
                            | ConfirmationStatus::RecipientConfirmed
                    )
                });
            if !still_outstanding {
                let _ = self
                    .state
                    .ctx
                    .events
                    .publish(
                        tx.group_id,
                        tanda_ports::DomainEvent::RotationReadyToAdvance { rotation_index: tx.rotation_index },
                    )
                    .await;
            }
        }

        Ok(to_rpc_transaction_state(&tx))
    }

    async fn advance_rotation(&self, req: RpcAdvanceRotation) -> RpcResult<i32> {
        let group_id = GroupId::parse(&req.group_id).map_err(|e| rpc_err(-32602, e.to_string()))?;
        let new_index = self
            .state
            .rotation
            .advance_rotation(group_id, req.expected_index)
            .await
            .map_err(domain_err)?;
        let _ = self
            .state
            .ctx
            .events
            .publish(group_id, tanda_ports::DomainEvent::RotationAdvanced { new_index })
            .await;
        Ok(new_index)
    }

    async fn request_leave(&self, req: RpcRequestLeave) -> RpcResult<RpcLeaveDecision> {
        let member_id = MemberId::parse(&req.member_id).map_err(|e| rpc_err(-32602, e.to_string()))?;
        let member = self
            .state
            .ctx
            .db
            .get_member(&member_id)
            .map_err(domain_err)?
            .ok_or_else(|| domain_err(Error::MemberNotFound(member_id.to_string())))?;
        let (allowed, reason) = request_leave_decision(&member);
        Ok(RpcLeaveDecision { allowed, reason })
    }

    async fn close_cycle(&self, req: RpcCloseCycle) -> RpcResult<RpcCycleSummary> {
        let group_id = GroupId::parse(&req.group_id).map_err(|e| rpc_err(-32602, e.to_string()))?;
        let summary = self.state.cycle.close_cycle(group_id).await.map_err(domain_err)?;
        let _ = self
            .state
            .ctx
            .events
            .publish(group_id, tanda_ports::DomainEvent::CycleClosed)
            .await;
        Ok(RpcCycleSummary {
            group_id: group_id.to_string(),
            members_returned: summary.return_transactions.len() as u32,
            total_returned_cents: money_to_cents(summary.total_returned),
        })
    }

    async fn audit(&self, _scope: Option<String>) -> RpcResult<RpcAuditReport> {
        let findings = self.state.auditor.scan_all().map_err(domain_err)?;
        let corrected = self.state.auditor.auto_correct(&findings).await.map_err(domain_err)?;
        Ok(RpcAuditReport {
            findings: findings
                .into_iter()
                .map(|f| RpcAuditFinding {
                    kind: format!("{:?}", f.kind),
                    severity: format!("{:?}", f.severity),
                    entity_type: f.entity_type.to_string(),
                    entity_id: f.entity_id,
                    message: f.message,
                    auto_correctable: f.auto_correctable,
                })
                .collect(),
            corrected,
        })
    }
}

fn to_rpc_transaction_state(tx: &Transaction) -> RpcTransactionState {
    RpcTransactionState {
        transaction_id: tx.id.to_string(),
        status: format!("{:?}", tx.status),
        sender_confirmed: tx.sender_confirmed_at.is_some()
            || matches!(tx.status, ConfirmationStatus::SenderConfirmed | ConfirmationStatus::BothConfirmed),
        recipient_confirmed: tx.recipient_confirmed_at.is_some()
            || matches!(tx.status, ConfirmationStatus::RecipientConfirmed | ConfirmationStatus::BothConfirmed),
    }
}
