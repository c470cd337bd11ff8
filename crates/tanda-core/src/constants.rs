//! ─── Tanda Engine Constants ─────────────────────────────────────────────────
//!
//! ROSCA state-engine tuning knobs: lease TTLs, deadlines, tier bounds.

// ── Group configuration bounds ───────────────────────────────────────────────

/// Minimum members for a viable rotation.
pub const MIN_GROUP_MEMBERS: i32 = 3;

/// Default maximum group size (overridable per tier).
pub const DEFAULT_MAX_GROUP_MEMBERS: i32 = 30;

/// Deposit multiplier bounds: 0.5x to 3.0x the no-loss minimum.
pub const MIN_DEPOSIT_MULTIPLIER: &str = "0.5";
pub const MAX_DEPOSIT_MULTIPLIER: &str = "3.0";
pub const DEFAULT_DEPOSIT_MULTIPLIER: &str = "1.0";

// ── Lease TTLs (seconds) ──────────────────────────────────────────────────────

/// Default lease TTL for group/member/transaction-scoped operations.
pub const DEFAULT_LEASE_TTL_SECS: i64 = 300;

/// Lease TTL for the longer-running cycle-close critical section.
pub const CYCLE_CLOSE_LEASE_TTL_SECS: i64 = 600;

/// Interval between lease-expiry sweeps.
pub const LEASE_SWEEP_INTERVAL_SECS: u64 = 30;

// ── Contribution deadlines & reminders ───────────────────────────────────────

/// Reminder offsets before a contribution deadline (hours before fire_at).
pub const REMINDER_OFFSETS_HOURS: [i64; 3] = [24, 6, 1];

/// Clock-skew tolerance for auditing future-dated records (minutes).
pub const CLOCK_SKEW_TOLERANCE_MINUTES: i64 = 5;

// ── Retry policy for Conflict/Transient errors ───────────────────────────────

pub const RETRY_BASE_DELAY_MS: u64 = 50;
pub const RETRY_MAX_ATTEMPTS: u32 = 6;
