//! tanda-node — the tanda rotation-engine full-node binary.
//!
//! Startup sequence:
//!   1. Open (or initialise) the state database
//!   2. Wire the port adapters (payments, notifications, scheduler, clock,
//!      feature flags, audit) into a `CoreContext`
//!   3. Spawn the lease-expiry sweeper and the timer-fire dispatcher
//!   4. Start the JSON-RPC 2.0 server

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use tanda_contribution::ContributionFsm;
use tanda_core::constants::LEASE_SWEEP_INTERVAL_SECS;
use tanda_default::DefaultHandler;
use tanda_locks::LockManager;
use tanda_ports::{
    CoreContext, EventBus, HttpPaymentGateway, InProcessScheduler, StateDbAuditSink,
    StaticFeatureFlags, StubPaymentGateway, SystemClock, TracingNotificationSink,
    WebhookNotificationSink,
};
use tanda_rpc::{RpcServer, RpcServerState};
use tanda_state::StateDb;

#[derive(Parser, Debug)]
#[command(
    name = "tanda-node",
    version,
    about = "tanda rotation engine node — the ledger for a rotating savings circle"
)]
struct Args {
    /// Directory for the persistent state database.
    #[arg(long, default_value = "~/.tanda/data")]
    data_dir: PathBuf,

    /// JSON-RPC listen address.
    #[arg(long, default_value = "127.0.0.1:8646")]
    rpc_addr: SocketAddr,

    /// Base URL of the payment gateway. With none, payments are stubbed.
    #[arg(long)]
    payment_gateway_url: Option<String>,

    /// Webhook URL for member notifications. With none, notifications are
    /// only logged.
    #[arg(long)]
    notification_webhook_url: Option<String>,

    /// Feature flags to enable at startup (comma-separated).
    #[arg(long, value_delimiter = ',')]
    feature_flags: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tanda=debug".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    info!("tanda node starting");

    // ── State database ───────────────────────────────────────────────────────
    let data_dir = expand_tilde(&args.data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;

    let db = Arc::new(StateDb::open(&data_dir).context("opening state database")?);
    let locks = Arc::new(LockManager::new(db.clone()));

    // ── Port adapters ─────────────────────────────────────────────────────────
    let clock = Arc::new(SystemClock);
    let payments: Arc<dyn tanda_ports::PaymentGateway> = match &args.payment_gateway_url {
        Some(url) => Arc::new(HttpPaymentGateway::new(url.clone())),
        None => {
            warn!("no --payment-gateway-url given, using stub payment gateway");
            Arc::new(StubPaymentGateway::default())
        }
    };
    let notifications: Arc<dyn tanda_ports::NotificationSink> =
        match &args.notification_webhook_url {
            Some(url) => Arc::new(WebhookNotificationSink::new(url.clone())),
            None => Arc::new(TracingNotificationSink),
        };
    let feature_flags = Arc::new(StaticFeatureFlags::new(args.feature_flags.clone()));
    let audit_sink = Arc::new(StateDbAuditSink::new(db.clone()));

    let (fire_tx, fire_rx) = tokio::sync::mpsc::channel(256);
    let scheduler = Arc::new(InProcessScheduler::new(fire_tx));

    let events = EventBus::new(notifications, audit_sink.clone());

    let ctx = Arc::new(CoreContext::new(
        db.clone(),
        locks.clone(),
        clock,
        payments,
        scheduler,
        feature_flags,
        audit_sink,
        events,
    ));

    // ── Background tasks ──────────────────────────────────────────────────────
    let _sweeper = tanda_locks::spawn_expiry_sweeper(
        locks.clone(),
        Duration::from_secs(LEASE_SWEEP_INTERVAL_SECS),
    );

    // A timer fire only means a contribution's deadline passed; the FSM
    // re-checks whether it is still pending before cancelling it. A fire
    // that actually cancels a still-open contribution hands off to
    // `DefaultHandler` and publishes `ContributionDefaulted` (SPEC_FULL.md
    // §8 scenario 5).
    let contribution_for_timers = Arc::new(ContributionFsm::new(db.clone(), locks.clone()));
    let default_handler_for_timers = Arc::new(DefaultHandler::new(db.clone(), locks.clone()));
    let ctx_for_timers = ctx.clone();
    let db_for_timers = db.clone();
    let _dispatcher = tanda_ports::spawn_timer_dispatcher(fire_rx, move |fire| {
        let contribution = contribution_for_timers.clone();
        let default_handler = default_handler_for_timers.clone();
        let ctx = ctx_for_timers.clone();
        let db = db_for_timers.clone();
        async move {
            let Some(transaction_id) = fire
                .payload
                .get("transaction_id")
                .and_then(|v| v.as_str())
                .and_then(|s| tanda_core::TransactionId::parse(s).ok())
            else {
                warn!(task_id = %fire.task_id, "timer fire missing transaction_id");
                return;
            };

            // Reminder fires never mutate state (SPEC_FULL.md §4.4): they only
            // publish a notification-facing event at T-24h/T-6h/T-1h.
            if fire.payload.get("kind").and_then(|v| v.as_str()) == Some("reminder") {
                let Some(hours_before) = fire.payload.get("hours_before").and_then(|v| v.as_i64())
                else {
                    warn!(task_id = %fire.task_id, "reminder fire missing hours_before");
                    return;
                };
                let Some(tx) = db.get_transaction(&transaction_id).ok().flatten() else {
                    return;
                };
                if !matches!(
                    tx.status,
                    tanda_core::ConfirmationStatus::BothConfirmed | tanda_core::ConfirmationStatus::Cancelled
                ) {
                    let _ = ctx
                        .events
                        .publish(
                            tx.group_id,
                            tanda_ports::DomainEvent::ContributionReminder {
                                transaction_id,
                                hours_before,
                            },
                        )
                        .await;
                }
                return;
            }

            let cancelled = match contribution.deadline_elapsed(transaction_id).await {
                Ok(Some(tx)) => tx,
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "deadline_elapsed failed");
                    return;
                }
            };
            info!(transaction_id = %cancelled.id, "contribution deadline elapsed");

            let (Some(from_member), Some(to_member)) = (cancelled.from_member, cancelled.to_member)
            else {
                return;
            };
            let outcome = default_handler
                .handle_default(
                    cancelled.group_id,
                    cancelled.rotation_index,
                    from_member,
                    to_member,
                    cancelled.amount,
                )
                .await;
            match outcome {
                Ok(outcome) => {
                    let member_ref = db
                        .get_member(&from_member)
                        .ok()
                        .flatten()
                        .map(|m| m.external_user_ref)
                        .unwrap_or_else(|| from_member.to_string());
                    let recipient_ref = db
                        .get_member(&to_member)
                        .ok()
                        .flatten()
                        .map(|m| m.external_user_ref)
                        .unwrap_or_else(|| to_member.to_string());
                    let _ = ctx
                        .events
                        .publish(
                            cancelled.group_id,
                            tanda_ports::DomainEvent::ContributionDefaulted {
                                member_ref,
                                amount: outcome.coverage_tx.amount,
                                recipient_ref,
                            },
                        )
                        .await;
                }
                Err(e) => warn!(error = %e, "default handling failed"),
            }
        }
    });

    // ── RPC server ────────────────────────────────────────────────────────────
    let rpc_state = Arc::new(RpcServerState::new(ctx));
    let _rpc_handle = RpcServer::new(rpc_state)
        .start(args.rpc_addr)
        .await
        .context("starting RPC server")?;

    info!(addr = %args.rpc_addr, "node ready");

    // Park the main task; the RPC server and background tasks run to
    // completion (or until the process is killed).
    std::future::pending::<()>().await;
    Ok(())
}

/// Expand a leading `~` to the user's home directory (`HOME` or `USERPROFILE`).
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Ok(home) = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")) {
            return PathBuf::from(home).join(stripped);
        }
    }
    path.to_path_buf()
}
