// All service modules
pub mod aggregate_cache;
pub mod aggregation;
pub mod fanout;
pub mod proof_verifier;
pub mod reconciliation;
pub mod settlement;

// Re-export for convenience
pub use aggregate_cache::{AggregateCache, CacheDelta, InMemoryAggregateCache, RedisAggregateCache};
pub use fanout::{DomainEvent, EventBus, EventPublisher, EventStream};
pub use proof_verifier::{build_verifier, ProofVerifier, VerificationFailure, VerifiedPayload};
pub use reconciliation::{ReconciliationJob, ReconciliationReport};
pub use settlement::{
    CoordinatorSettings, ReceiptStatus, SettlementCoordinator, SettlementReceipt,
    SettlementRejection,
};

use crate::config::Config;
use std::sync::Arc;

/// Start all background services
pub async fn start_background_services(reconciler: Arc<ReconciliationJob>, config: &Config) {
    tracing::info!("Starting background services...");

    if config.enable_reconciler {
        // First run happens immediately, so a restart repairs drift right away.
        reconciler.start().await;
        tracing::info!(
            "Reconciliation job scheduled every {}s ({:?})",
            config.reconcile_interval_secs,
            config.reconcile_scope
        );
    } else {
        tracing::warn!("Reconciliation job disabled via ENABLE_RECONCILER");
    }

    tracing::info!("All background services started successfully");
}
