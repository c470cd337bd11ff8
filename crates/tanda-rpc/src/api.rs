use jsonrpsee::core::RpcResult;
use jsonrpsee::proc_macros::rpc;

use crate::types::{
    RpcAck, RpcAdvanceRotation, RpcAuditReport, RpcCloseCycle, RpcConfirmContribution,
    RpcConfirmDeposit, RpcCreateGroup, RpcCycleSummary, RpcJoinGroup, RpcJoinResult,
    RpcLeaveDecision, RpcRecordContribution, RpcRequestLeave, RpcTransactionState,
};

/// Tanda engine JSON-RPC 2.0 API definition. All method names are prefixed
/// with "tanda_" via `namespace = "tanda"`, the command table of SPEC_FULL.md
/// §6 exposed transport-independent.
#[rpc(server, namespace = "tanda")]
pub trait TandaApi {
    #[method(name = "createGroup")]
    async fn create_group(&self, req: RpcCreateGroup) -> RpcResult<String>;

    #[method(name = "joinGroup")]
    async fn join_group(&self, req: RpcJoinGroup) -> RpcResult<RpcJoinResult>;

    #[method(name = "confirmDeposit")]
    async fn confirm_deposit(&self, req: RpcConfirmDeposit) -> RpcResult<RpcAck>;

    #[method(name = "recordContribution")]
    async fn record_contribution(&self, req: RpcRecordContribution) -> RpcResult<String>;

    #[method(name = "confirmContribution")]
    async fn confirm_contribution(&self, req: RpcConfirmContribution) -> RpcResult<RpcTransactionState>;

    #[method(name = "advanceRotation")]
    async fn advance_rotation(&self, req: RpcAdvanceRotation) -> RpcResult<i32>;

    #[method(name = "requestLeave")]
    async fn request_leave(&self, req: RpcRequestLeave) -> RpcResult<RpcLeaveDecision>;

    #[method(name = "closeCycle")]
    async fn close_cycle(&self, req: RpcCloseCycle) -> RpcResult<RpcCycleSummary>;

    #[method(name = "audit")]
    async fn audit(&self, scope: Option<String>) -> RpcResult<RpcAuditReport>;
}
