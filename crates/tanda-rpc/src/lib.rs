//! tanda-rpc
//!
//! JSON-RPC 2.0 server for the tanda rotation engine.
//!
//! Namespace: "tanda"
//! Methods:
//!   tanda_createGroup          — create a new rotation group
//!   tanda_joinGroup            — assign a member a rotation position
//!   tanda_confirmDeposit       — record a security-deposit payment
//!   tanda_recordContribution   — open a contribution transaction
//!   tanda_confirmContribution  — apply a sender/recipient confirmation
//!   tanda_advanceRotation      — advance the rotation by one turn
//!   tanda_requestLeave         — check whether a member may leave
//!   tanda_closeCycle           — validate and close a completed cycle
//!   tanda_audit                — run the consistency scan and auto-correct

pub mod api;
pub mod server;
pub mod types;

pub use api::TandaApiServer;
pub use server::{RpcServer, RpcServerState};
pub use types::{
    RpcAck, RpcAdvanceRotation, RpcAuditFinding, RpcAuditReport, RpcCloseCycle,
    RpcConfirmContribution, RpcConfirmDeposit, RpcCreateGroup, RpcCycleSummary, RpcJoinGroup,
    RpcJoinResult, RpcLeaveDecision, RpcRecordContribution, RpcRequestLeave, RpcTransactionState,
};
