use thiserror::Error;

/// Workspace-wide error taxonomy. Every variant is tagged with its error
/// kind (see the doc comment on each section) so callers at the RPC
/// boundary can map it to a stable retry/no-retry policy without
/// string-matching messages.
#[derive(Debug, Error)]
pub enum Error {
    // ── Validation (bad input; reject, no state change) ─────────────────────
    #[error("invalid position: {position} not in [1, {max}]")]
    InvalidPosition { position: i32, max: i32 },

    #[error("invalid group configuration: {0}")]
    InvalidGroup(String),

    #[error("amount must be greater than zero")]
    ZeroAmount,

    #[error("deposit multiplier out of range: {0} not in [0.5, 3.0]")]
    InvalidMultiplier(String),

    #[error("group member limit out of range: {0}")]
    InvalidMemberLimit(i32),

    // ── Precondition (right input, wrong state) ─────────────────────────────
    #[error("group is full")]
    GroupFull,

    #[error("group is halted pending operator review")]
    GroupHalted,

    #[error("position {0} already occupied")]
    PositionOccupied(i32),

    #[error("rotation blocked: outstanding contribution(s) unresolved")]
    RotationBlocked,

    #[error("member cannot be suspended: {0}")]
    MemberNotSuspendable(String),

    #[error("member is locked in and may not leave: {0}")]
    MemberLockedIn(String),

    #[error("cycle preconditions not met: {0}")]
    CyclePreconditionsNotMet(String),

    #[error("invalid confirmation state transition from {from} via {event}")]
    InvalidTransition { from: String, event: String },

    // ── Conflict (optimistic concurrency / lease contention; safe to retry) ─
    #[error("stale write: expected version did not match current state")]
    Stale,

    #[error("lease already held: {kind}:{resource}")]
    AlreadyHeld { kind: String, resource: String },

    // ── Invariant (must never happen; halt and escalate) ────────────────────
    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("insufficient deposit: need {need}, have {have}")]
    InsufficientDeposit { need: String, have: String },

    // ── External (payment / notification port failure) ──────────────────────
    #[error("payment gateway error: {0}")]
    PaymentGateway(String),

    #[error("notification delivery error: {0}")]
    Notification(String),

    // ── Transient (store unavailable; retry, else surface untouched) ───────
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    // ── Not found ─────────────────────────────────────────────────────────
    #[error("group not found: {0}")]
    GroupNotFound(String),

    #[error("member not found: {0}")]
    MemberNotFound(String),

    #[error("transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("lease not found: {0}")]
    LeaseNotFound(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Coarse error-kind classification used by retry policy and the
    /// RPC error-code mapping. See SPEC_FULL.md §7.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidPosition { .. }
            | Error::InvalidGroup(_)
            | Error::ZeroAmount
            | Error::InvalidMultiplier(_)
            | Error::InvalidMemberLimit(_) => ErrorKind::Validation,

            Error::GroupFull
            | Error::GroupHalted
            | Error::PositionOccupied(_)
            | Error::RotationBlocked
            | Error::MemberNotSuspendable(_)
            | Error::MemberLockedIn(_)
            | Error::CyclePreconditionsNotMet(_)
            | Error::InvalidTransition { .. } => ErrorKind::Precondition,

            Error::Stale | Error::AlreadyHeld { .. } => ErrorKind::Conflict,

            Error::Invariant(_) | Error::InsufficientDeposit { .. } => ErrorKind::Invariant,

            Error::PaymentGateway(_) | Error::Notification(_) => ErrorKind::External,

            Error::Storage(_) | Error::Serialization(_) => ErrorKind::Transient,

            Error::GroupNotFound(_)
            | Error::MemberNotFound(_)
            | Error::TransactionNotFound(_)
            | Error::LeaseNotFound(_) => ErrorKind::NotFound,

            Error::Other(_) => ErrorKind::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Precondition,
    Conflict,
    Invariant,
    External,
    Transient,
    NotFound,
    Other,
}
