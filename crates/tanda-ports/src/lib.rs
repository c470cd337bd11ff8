//! Side-effectful collaborator ports (SPEC_FULL.md §6): `StateStore` is
//! `tanda-state::StateDb` itself; everything else the core touches outside
//! its own persisted state — payments, notifications, timers, the clock,
//! feature flags, and the audit log — is an `#[async_trait]` trait here,
//! with one production adapter and one in-memory test adapter each.

pub mod audit_sink;
pub mod clock;
pub mod context;
pub mod events;
pub mod feature_flags;
pub mod notification;
pub mod payment;
pub mod scheduler;
pub mod tiers;

pub use audit_sink::{AuditSink, StateDbAuditSink, StubAuditSink};
pub use clock::{Clock, FixedClock, SystemClock};
pub use context::CoreContext;
pub use events::{DomainEvent, EventBus};
pub use feature_flags::{FeatureFlags, StaticFeatureFlags};
pub use notification::{NotificationSink, StubNotificationSink, TracingNotificationSink, WebhookNotificationSink};
pub use payment::{HttpPaymentGateway, PaymentCallback, PaymentGateway, PaymentRequest, PaymentStatus, StubPaymentGateway};
pub use scheduler::{spawn_timer_dispatcher, InProcessScheduler, Scheduler, StubScheduler, TimerFire, TimerHandle};
pub use tiers::{GroupTier, GroupTierConfig};
