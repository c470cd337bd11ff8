//! System-wide consistency scanning and safe auto-correction. Grounded in
//! the original system's `DataConsistencyChecker` (`run_full_consistency_check`,
//! `auto_correct_issues`, and its per-entity `_check_*`/`_correct_*` pairs) —
//! see SPEC_FULL.md §4.7.

use chrono::{Duration as ChronoDuration, Utc};
use tracing::{info, warn};

use tanda_core::{
    constants::CLOCK_SKEW_TOLERANCE_MINUTES, AuditEvent, AuditSeverity, ConfirmationStatus, Error,
    GroupId, Transaction, TransactionId,
};
use tanda_deposit::{required_for_position, GroupConfig};
use tanda_state::StateDb;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IssueKind {
    OrphanedReference,
    NegativeBalance,
    ConfirmationMismatch,
    PositionOutOfRange,
    DepositMismatch,
    FutureDated,
}

#[derive(Clone, Debug)]
pub struct Finding {
    pub kind: IssueKind,
    pub severity: AuditSeverity,
    pub entity_type: &'static str,
    pub entity_id: String,
    pub message: String,
    pub auto_correctable: bool,
}

pub struct ConsistencyAuditor {
    db: std::sync::Arc<StateDb>,
}

impl ConsistencyAuditor {
    pub fn new(db: std::sync::Arc<StateDb>) -> Self {
        Self { db }
    }

    /// Runs every check in §4.7 across the whole store (scope = all
    /// groups) and returns the findings, most severe first is not
    /// guaranteed — callers filter/sort by `severity` as needed.
    pub fn scan_all(&self) -> Result<Vec<Finding>, Error> {
        let mut findings = Vec::new();
        let groups = self.db.iter_groups()?;
        let members = self.db.iter_all_members()?;
        let transactions = self.db.iter_all_transactions()?;

        let group_ids: std::collections::HashSet<GroupId> = groups.iter().map(|g| g.id).collect();

        // ── Orphaned references ──────────────────────────────────────────
        for m in &members {
            if !group_ids.contains(&m.group_id) {
                findings.push(Finding {
                    kind: IssueKind::OrphanedReference,
                    severity: AuditSeverity::Error,
                    entity_type: "member",
                    entity_id: m.id.to_string(),
                    message: format!("member references missing group {}", m.group_id),
                    auto_correctable: false,
                });
            }
        }
        let member_ids: std::collections::HashSet<_> = members.iter().map(|m| m.id).collect();
        for t in &transactions {
            if !group_ids.contains(&t.group_id) {
                findings.push(Finding {
                    kind: IssueKind::OrphanedReference,
                    severity: AuditSeverity::Error,
                    entity_type: "transaction",
                    entity_id: t.id.to_string(),
                    message: format!("transaction references missing group {}", t.group_id),
                    auto_correctable: false,
                });
            }
            for m in [t.from_member, t.to_member].into_iter().flatten() {
                if !member_ids.contains(&m) {
                    findings.push(Finding {
                        kind: IssueKind::OrphanedReference,
                        severity: AuditSeverity::Error,
                        entity_type: "transaction",
                        entity_id: t.id.to_string(),
                        message: format!("transaction references missing member {m}"),
                        auto_correctable: false,
                    });
                }
            }
        }

        // ── Negative balances ─────────────────────────────────────────────
        for m in &members {
            if m.deposit_amount.is_negative() {
                findings.push(Finding {
                    kind: IssueKind::NegativeBalance,
                    severity: AuditSeverity::Critical,
                    entity_type: "member",
                    entity_id: m.id.to_string(),
                    message: format!("negative deposit balance: {}", m.deposit_amount),
                    auto_correctable: true,
                });
            }
        }

        // ── Confirmation symmetry ─────────────────────────────────────────
        for t in &transactions {
            let both_confirmed = matches!(t.status, ConfirmationStatus::BothConfirmed);
            let has_both_timestamps = t.sender_confirmed_at.is_some() && t.recipient_confirmed_at.is_some();
            if both_confirmed != has_both_timestamps {
                findings.push(Finding {
                    kind: IssueKind::ConfirmationMismatch,
                    severity: AuditSeverity::Warning,
                    entity_type: "transaction",
                    entity_id: t.id.to_string(),
                    message: format!(
                        "status={:?} but sender_ts={:?} recipient_ts={:?}",
                        t.status, t.sender_confirmed_at, t.recipient_confirmed_at
                    ),
                    auto_correctable: true,
                });
            }
        }

        // ── Rotation position range ───────────────────────────────────────
        for group in &groups {
            let active_count = members
                .iter()
                .filter(|m| m.group_id == group.id && matches!(m.status, tanda_core::MemberStatus::Active))
                .count() as i32;
            for m in members.iter().filter(|m| m.group_id == group.id) {
                if m.rotation_position > 0 && m.rotation_position > active_count {
                    findings.push(Finding {
                        kind: IssueKind::PositionOutOfRange,
                        severity: AuditSeverity::Error,
                        entity_type: "member",
                        entity_id: m.id.to_string(),
                        message: format!(
                            "rotation_position {} outside [1, {active_count}] for active members",
                            m.rotation_position
                        ),
                        auto_correctable: false,
                    });
                }
            }
        }

        // ── Deposit sum mismatch vs §4.1 formula ──────────────────────────
        for group in &groups {
            let cfg = GroupConfig {
                contribution_amount: group.contribution_amount,
                member_limit: group.member_limit,
                deposit_multiplier: group.deposit_multiplier(),
            };
            for m in members.iter().filter(|m| m.group_id == group.id) {
                if m.rotation_position < 1 || m.rotation_position > group.member_limit {
                    continue;
                }
                if !matches!(m.status, tanda_core::MemberStatus::Active) {
                    continue;
                }
                if let Ok(required) = required_for_position(&cfg, m.rotation_position) {
                    if m.deposit_amount < required {
                        findings.push(Finding {
                            kind: IssueKind::DepositMismatch,
                            severity: AuditSeverity::Warning,
                            entity_type: "member",
                            entity_id: m.id.to_string(),
                            message: format!(
                                "deposit {} below required {} for position {}",
                                m.deposit_amount, required, m.rotation_position
                            ),
                            auto_correctable: true,
                        });
                    }
                }
            }
        }

        // ── Future-dated records beyond clock-skew tolerance ──────────────
        let skew_limit = Utc::now() + ChronoDuration::minutes(CLOCK_SKEW_TOLERANCE_MINUTES);
        for t in &transactions {
            if t.created_at > skew_limit {
                findings.push(Finding {
                    kind: IssueKind::FutureDated,
                    severity: AuditSeverity::Warning,
                    entity_type: "transaction",
                    entity_id: t.id.to_string(),
                    message: format!("created_at {} is in the future", t.created_at),
                    auto_correctable: false,
                });
            }
        }

        info!(count = findings.len(), "consistency scan complete");
        Ok(findings)
    }

    /// Applies the auto-correctable subset of `findings`. Anything not
    /// explicitly handled here is reported only, per §4.7 ("everything
    /// else is reported only; never guessed").
    pub async fn auto_correct(&self, findings: &[Finding]) -> Result<usize, Error> {
        let mut corrected = 0;
        for finding in findings.iter().filter(|f| f.auto_correctable) {
            match finding.kind {
                IssueKind::NegativeBalance => {
                    if self.clamp_negative_deposit(&finding.entity_id)? {
                        corrected += 1;
                    }
                }
                IssueKind::ConfirmationMismatch => {
                    if let Ok(tx_id) = TransactionId::parse(&finding.entity_id) {
                        if self.fix_confirmation_status(tx_id)? {
                            corrected += 1;
                        }
                    }
                }
                // Deposit-mismatch auto-correction only recomputes the
                // expected figure for the audit trail; it never moves
                // funds, so it is reported but not mutated here.
                _ => {}
            }
        }
        Ok(corrected)
    }

    fn clamp_negative_deposit(&self, member_id_str: &str) -> Result<bool, Error> {
        let member_id = tanda_core::MemberId::parse(member_id_str).map_err(|e| Error::Other(e.to_string()))?;
        let Some(member) = self.db.get_member(&member_id)? else {
            return Ok(false);
        };
        if !member.deposit_amount.is_negative() {
            return Ok(false);
        }
        let mut fixed = member.clone();
        fixed.deposit_amount = tanda_core::Money::ZERO;
        let applied = self.db.cas_put_member(&member, &fixed)?;
        if applied {
            self.db.append_audit_event(&AuditEvent {
                id: uuid::Uuid::new_v4(),
                group_id: Some(member.group_id),
                severity: AuditSeverity::Critical,
                kind: "auto_correct_negative_deposit".into(),
                message: format!("clamped negative deposit to zero for member {member_id}"),
                auto_corrected: true,
                created_at: Utc::now(),
            })?;
            warn!(member = %member_id, "negative deposit clamped to zero");
        }
        Ok(applied)
    }

    fn fix_confirmation_status(&self, tx_id: TransactionId) -> Result<bool, Error> {
        let Some(tx) = self.db.get_transaction(&tx_id)? else {
            return Ok(false);
        };
        let correct_status = correct_status_for(&tx);
        if correct_status == tx.status {
            return Ok(false);
        }
        let mut fixed = tx.clone();
        fixed.status = correct_status;
        let applied = self.db.cas_put_transaction(&tx, &fixed)?;
        if applied {
            self.db.append_audit_event(&AuditEvent {
                id: uuid::Uuid::new_v4(),
                group_id: Some(tx.group_id),
                severity: AuditSeverity::Warning,
                kind: "auto_correct_confirmation_status".into(),
                message: format!("realigned transaction {tx_id} status to {correct_status:?} to match timestamps"),
                auto_corrected: true,
                created_at: Utc::now(),
            })?;
        }
        Ok(applied)
    }
}

fn correct_status_for(tx: &Transaction) -> ConfirmationStatus {
    match (tx.sender_confirmed_at.is_some(), tx.recipient_confirmed_at.is_some()) {
        (true, true) => ConfirmationStatus::BothConfirmed,
        (true, false) => ConfirmationStatus::SenderConfirmed,
        (false, true) => ConfirmationStatus::RecipientConfirmed,
        (false, false) => ConfirmationStatus::Pending,
    }
}
