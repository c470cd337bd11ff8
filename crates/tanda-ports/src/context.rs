//! `CoreContext`: the bundle of store, locks, clock, ports, and event bus
//! every engine crate's entry points take, so call sites wire dependencies
//! once at startup (in `tanda-node`) instead of threading eight parameters
//! through every function.

use std::sync::Arc;

use tanda_locks::LockManager;
use tanda_state::StateDb;

use crate::audit_sink::AuditSink;
use crate::clock::Clock;
use crate::events::EventBus;
use crate::feature_flags::FeatureFlags;
use crate::payment::PaymentGateway;
use crate::scheduler::Scheduler;
use crate::tiers::GroupTierConfig;

pub struct CoreContext {
    pub db: Arc<StateDb>,
    pub locks: Arc<LockManager>,
    pub clock: Arc<dyn Clock>,
    pub payments: Arc<dyn PaymentGateway>,
    pub scheduler: Arc<dyn Scheduler>,
    pub feature_flags: Arc<dyn FeatureFlags>,
    pub audit: Arc<dyn AuditSink>,
    pub events: EventBus,
    pub tiers: GroupTierConfig,
}

impl CoreContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<StateDb>,
        locks: Arc<LockManager>,
        clock: Arc<dyn Clock>,
        payments: Arc<dyn PaymentGateway>,
        scheduler: Arc<dyn Scheduler>,
        feature_flags: Arc<dyn FeatureFlags>,
        audit: Arc<dyn AuditSink>,
        events: EventBus,
    ) -> Self {
        Self {
            db,
            locks,
            clock,
            payments,
            scheduler,
            feature_flags,
            audit,
            events,
            tiers: GroupTierConfig::default_tiers(),
        }
    }
}
