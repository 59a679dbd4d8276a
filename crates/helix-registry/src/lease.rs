//! Lease-expiry sweep: a missed `RenewLease` beyond `T_lease_expire` fails
//! the session (`spec.md` §4.5), reusing a periodic sweep-task
//! polling-loop idiom instead of a timer-wheel crate.

use std::time::Duration;

use helix_dbus::types::LifecycleState;

use crate::catalog::Catalog;
use crate::config::RegistryConfig;

pub async fn sweep_loop(cfg: RegistryConfig, catalog: Catalog) {
    let mut interval = tokio::time::interval(Duration::from_secs(cfg.sweep_interval_secs));
    loop {
        interval.tick().await;
        for session_id in catalog.expired_leases(cfg.lease_expire_secs).await {
            tracing::warn!(session_id, "lease expired, failing session");
            catalog
                .transition(&session_id, LifecycleState::Failed, Some("LeaseExpired".to_string()))
                .await;
        }
    }
}
