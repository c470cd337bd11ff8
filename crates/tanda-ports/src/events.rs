//! `EventBus` (SPEC_FULL.md §4.9, EXPANDED): single-writer-per-group fan-out
//! to the `NotificationSink` and `Audit` ports. Grounded in the workspace's
//! `tracing`-based event logging convention — every publish also emits a
//! structured `info!` so operators get events "for free" in logs.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use tanda_core::{AuditSeverity, Error, GroupId, Money, TransactionId};

use crate::audit_sink::AuditSink;
use crate::notification::NotificationSink;

/// Closed set of domain events so both subscribers handle every kind
/// exhaustively (SPEC_FULL.md §4.9).
#[derive(Clone, Debug)]
pub enum DomainEvent {
    ContributionCompleted {
        transaction_id: TransactionId,
    },
    ContributionDefaulted {
        member_ref: String,
        amount: Money,
        recipient_ref: String,
    },
    ContributionReminder {
        transaction_id: TransactionId,
        hours_before: i64,
    },
    RotationReadyToAdvance {
        rotation_index: i32,
    },
    RotationAdvanced {
        new_index: i32,
    },
    MemberSuspended {
        member_ref: String,
    },
    DepositReplenished {
        member_ref: String,
    },
    CycleClosed,
    AuditFinding {
        severity: AuditSeverity,
        message: String,
    },
}

impl DomainEvent {
    fn kind(&self) -> &'static str {
        match self {
            DomainEvent::ContributionCompleted { .. } => "contribution_completed",
            DomainEvent::ContributionDefaulted { .. } => "contribution_defaulted",
            DomainEvent::ContributionReminder { .. } => "contribution_reminder",
            DomainEvent::RotationReadyToAdvance { .. } => "rotation_ready_to_advance",
            DomainEvent::RotationAdvanced { .. } => "rotation_advanced",
            DomainEvent::MemberSuspended { .. } => "member_suspended",
            DomainEvent::DepositReplenished { .. } => "deposit_replenished",
            DomainEvent::CycleClosed => "cycle_closed",
            DomainEvent::AuditFinding { .. } => "audit_finding",
        }
    }

    /// Member-facing notification target and template, or `None` for events
    /// with no single recipient (e.g. audit findings, which are operator
    /// facing only and go through the audit sink alone).
    fn notification_target(&self) -> Option<(&str, HashMap<String, String>)> {
        match self {
            DomainEvent::ContributionCompleted { transaction_id } => {
                let mut vars = HashMap::new();
                vars.insert("transaction_id".to_string(), transaction_id.to_string());
                Some(("contribution_completed", vars))
            }
            DomainEvent::ContributionDefaulted {
                member_ref,
                amount,
                recipient_ref,
            } => {
                let mut vars = HashMap::new();
                vars.insert("member_ref".to_string(), member_ref.clone());
                vars.insert("amount".to_string(), amount.to_string());
                vars.insert("recipient_ref".to_string(), recipient_ref.clone());
                Some(("contribution_defaulted", vars))
            }
            DomainEvent::ContributionReminder {
                transaction_id,
                hours_before,
            } => {
                let mut vars = HashMap::new();
                vars.insert("transaction_id".to_string(), transaction_id.to_string());
                vars.insert("hours_before".to_string(), hours_before.to_string());
                Some(("contribution_reminder", vars))
            }
            DomainEvent::MemberSuspended { member_ref } => {
                let mut vars = HashMap::new();
                vars.insert("member_ref".to_string(), member_ref.clone());
                Some(("member_suspended", vars))
            }
            DomainEvent::DepositReplenished { member_ref } => {
                let mut vars = HashMap::new();
                vars.insert("member_ref".to_string(), member_ref.clone());
                Some(("deposit_replenished", vars))
            }
            DomainEvent::RotationReadyToAdvance { .. }
            | DomainEvent::RotationAdvanced { .. }
            | DomainEvent::CycleClosed
            | DomainEvent::AuditFinding { .. } => None,
        }
    }

    fn audit_message(&self, group_id: GroupId) -> String {
        match self {
            DomainEvent::ContributionCompleted { transaction_id } => {
                format!("group {group_id}: contribution {transaction_id} completed")
            }
            DomainEvent::ContributionDefaulted {
                member_ref,
                amount,
                recipient_ref,
            } => format!(
                "group {group_id}: member {member_ref} defaulted {amount} owed to {recipient_ref}"
            ),
            DomainEvent::ContributionReminder {
                transaction_id,
                hours_before,
            } => format!("group {group_id}: contribution {transaction_id} due in {hours_before}h"),
            DomainEvent::RotationReadyToAdvance { rotation_index } => {
                format!("group {group_id}: rotation {rotation_index} ready to advance")
            }
            DomainEvent::RotationAdvanced { new_index } => {
                format!("group {group_id}: rotation advanced to {new_index}")
            }
            DomainEvent::MemberSuspended { member_ref } => {
                format!("group {group_id}: member {member_ref} suspended")
            }
            DomainEvent::DepositReplenished { member_ref } => {
                format!("group {group_id}: member {member_ref} replenished deposit")
            }
            DomainEvent::CycleClosed => format!("group {group_id}: cycle closed"),
            DomainEvent::AuditFinding { message, .. } => {
                format!("group {group_id}: audit finding: {message}")
            }
        }
    }

    fn severity(&self) -> AuditSeverity {
        match self {
            DomainEvent::ContributionDefaulted { .. } => AuditSeverity::Warning,
            DomainEvent::AuditFinding { severity, .. } => *severity,
            _ => AuditSeverity::Info,
        }
    }
}

pub struct EventBus {
    notifications: Arc<dyn NotificationSink>,
    audit: Arc<dyn AuditSink>,
}

impl EventBus {
    pub fn new(notifications: Arc<dyn NotificationSink>, audit: Arc<dyn AuditSink>) -> Self {
        Self { notifications, audit }
    }

    pub async fn publish(&self, group_id: GroupId, event: DomainEvent) -> Result<(), Error> {
        info!(group_id = %group_id, kind = event.kind(), "domain event");

        if let Some((template_key, vars)) = event.notification_target() {
            self.notifications
                .notify(&group_id.to_string(), template_key, vars)
                .await?;
        }

        self.audit
            .record(tanda_core::AuditEvent {
                id: uuid::Uuid::new_v4(),
                group_id: Some(group_id),
                severity: event.severity(),
                kind: event.kind().to_string(),
                message: event.audit_message(group_id),
                auto_corrected: false,
                created_at: chrono::Utc::now(),
            })
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit_sink::StubAuditSink;
    use crate::notification::StubNotificationSink;
    use tanda_core::GroupId;

    #[tokio::test]
    async fn publish_notifies_and_audits_member_facing_event() {
        let notifications = Arc::new(StubNotificationSink::new());
        let audit = Arc::new(StubAuditSink::new());
        let bus = EventBus::new(notifications.clone(), audit.clone());

        bus.publish(
            GroupId::new(),
            DomainEvent::MemberSuspended {
                member_ref: "user-9".into(),
            },
        )
        .await
        .unwrap();

        assert_eq!(notifications.sent.lock().unwrap().len(), 1);
        assert_eq!(audit.recorded.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn publish_notifies_for_contribution_reminder() {
        let notifications = Arc::new(StubNotificationSink::new());
        let audit = Arc::new(StubAuditSink::new());
        let bus = EventBus::new(notifications.clone(), audit.clone());

        bus.publish(
            GroupId::new(),
            DomainEvent::ContributionReminder {
                transaction_id: TransactionId::new(),
                hours_before: 24,
            },
        )
        .await
        .unwrap();

        let sent = notifications.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "contribution_reminder");
        assert_eq!(sent[0].2.get("hours_before").map(String::as_str), Some("24"));
    }

    #[tokio::test]
    async fn publish_audits_but_does_not_notify_operator_only_events() {
        let notifications = Arc::new(StubNotificationSink::new());
        let audit = Arc::new(StubAuditSink::new());
        let bus = EventBus::new(notifications.clone(), audit.clone());

        bus.publish(GroupId::new(), DomainEvent::CycleClosed)
            .await
            .unwrap();

        assert_eq!(notifications.sent.lock().unwrap().len(), 0);
        assert_eq!(audit.recorded.lock().unwrap().len(), 1);
    }
}
