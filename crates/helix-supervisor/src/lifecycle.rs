//! `CreateSession`/`StopSession`/`HealthLoop`/`Reap` — the Sandbox
//! Supervisor's public contract (`spec.md` §4.3). The polling shape behind
//! `HealthLoop`/`Reap` is the same periodic sweep idiom used elsewhere in
//! this workspace; the per-connection accept loop a single-host broker
//! would use is replaced since sessions are created by explicit D-Bus
//! call, not by an inbound client connection.

use std::time::Duration;

use helix_dbus::types::{HostResources, LifecycleState, SandboxErrorReason};

use crate::config::SupervisorConfig;
use crate::session::{now_unix, ResourceRequest, Session, SessionTable};
use crate::spawner;
use crate::tunnel::TunnelRegistry;

/// Create a new session: admission control, image pull, container
/// create+start, then wait for the Edge Server's tunnel dial-back.
///
/// # Errors
///
/// Returns the [`SandboxErrorReason`] matching the failure per `spec.md`
/// §4.3's failure semantics.
pub async fn create_session(
    cfg: &SupervisorConfig,
    table: &SessionTable,
    tunnels: &TunnelRegistry,
    session_id: String,
    owner: String,
    image_ref: String,
    resources: ResourceRequest,
) -> Result<(), SandboxErrorReason> {
    let resource_err = table.try_admit(&resources).await;
    if resource_err.is_err() {
        tracing::warn!(session_id, "admission refused, host at capacity");
        return Err(SandboxErrorReason::ResourceExhausted);
    }

    let session = Session {
        session_id: session_id.clone(),
        owner,
        image_ref: image_ref.clone(),
        host_id: cfg.host_id.clone(),
        container_id: String::new(),
        resources: resources.clone(),
        lifecycle_state: LifecycleState::Pending,
        created_at: now_unix(),
        ready_at: None,
        terminated_at: None,
        last_reason: None,
        consecutive_health_failures: 0,
    };
    table.insert(session).await;

    let runtime = match spawner::probe_runtime(cfg.runtime).await {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(session_id, error = %e, "no container runtime available");
            fail_session(table, &resources, &session_id, "ImageUnavailable").await;
            return Err(SandboxErrorReason::ImageUnavailable);
        }
    };

    table.mutate(&session_id, |s| s.transition(LifecycleState::Starting)).await;

    if let Err(e) = spawner::pull_image(runtime, &image_ref).await {
        tracing::error!(session_id, error = %e, "image pull failed after retries");
        fail_session(table, &resources, &session_id, "ImageUnavailable").await;
        return Err(SandboxErrorReason::ImageUnavailable);
    }

    let container_id = match spawner::create_and_start(
        runtime,
        &session_id,
        &image_ref,
        &resources,
        &cfg.tunnel_bind,
    )
    .await
    {
        Ok(id) => id,
        Err(e) => {
            tracing::error!(session_id, error = %e, "container start failed");
            fail_session(table, &resources, &session_id, "ContainerStartFailed").await;
            return Err(SandboxErrorReason::ContainerStartFailed);
        }
    };
    table
        .mutate(&session_id, |s| s.container_id.clone_from(&container_id))
        .await;

    let dialed = wait_for_tunnel(tunnels, &container_id, Duration::from_secs(cfg.dial_timeout_secs)).await;
    if !dialed {
        tracing::error!(session_id, container_id, "tunnel dial-back timed out");
        fail_session(table, &resources, &session_id, "TunnelTimeout").await;
        return Err(SandboxErrorReason::TunnelTimeout);
    }

    table.mutate(&session_id, |s| s.transition(LifecycleState::Ready)).await;
    tracing::info!(session_id, container_id, "session ready");
    let _ = table.save_state().await;
    Ok(())
}

async fn fail_session(table: &SessionTable, resources: &ResourceRequest, session_id: &str, reason: &str) {
    table
        .mutate(session_id, |s| {
            s.last_reason = Some(reason.to_string());
            s.transition(LifecycleState::Failed);
        })
        .await;
    table.release(resources).await;
    let _ = table.save_state().await;
}

async fn wait_for_tunnel(tunnels: &TunnelRegistry, container_id: &str, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut poll = tokio::time::interval(Duration::from_millis(100));
    loop {
        if tunnels.get(container_id).is_some() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        poll.tick().await;
    }
}

/// `StopSession`: transition to `Draining`, attempt a cooperative shutdown,
/// then force-kill after `T_drain` (`spec.md` §4.3). Idempotent — repeat
/// calls on an already-terminal session are no-ops.
pub async fn stop_session(cfg: &SupervisorConfig, table: &SessionTable, session_id: &str, reason: &str) {
    let Some(session) = table.get(session_id).await else {
        tracing::warn!(session_id, "stop_session for unknown session");
        return;
    };
    if session.lifecycle_state.is_terminal() {
        return;
    }

    table
        .mutate(session_id, |s| {
            s.last_reason = Some(reason.to_string());
            s.transition(LifecycleState::Draining);
        })
        .await;

    let runtime = match spawner::probe_runtime(cfg.runtime).await {
        Ok(r) => r,
        Err(_) => {
            finalize_stop(table, &session, LifecycleState::Failed).await;
            return;
        }
    };

    let grace = Duration::from_secs(cfg.drain_timeout_secs);
    let outcome = spawner::stop(runtime, &session.container_id, grace).await;
    let final_state = if outcome.is_ok() { LifecycleState::Stopped } else { LifecycleState::Failed };
    finalize_stop(table, &session, final_state).await;
}

async fn finalize_stop(table: &SessionTable, session: &Session, final_state: LifecycleState) {
    table.mutate(&session.session_id, |s| s.transition(final_state)).await;
    table.release(&session.resources).await;
    let _ = table.save_state().await;
    tracing::info!(session_id = %session.session_id, state = %final_state, "session stop finalized");
}

/// `HealthLoop`: every `T_probe` verify container liveness and tunnel
/// presence for every active session; three consecutive failures fail the
/// session (`spec.md` §4.3).
pub async fn health_loop(cfg: SupervisorConfig, table: SessionTable, tunnels: TunnelRegistry) {
    let mut interval = tokio::time::interval(Duration::from_secs(cfg.probe_interval_secs));
    loop {
        interval.tick().await;
        let runtime = match spawner::probe_runtime(cfg.runtime).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "health loop: no container runtime available");
                continue;
            }
        };

        for session in table.list_active().await {
            if session.lifecycle_state == LifecycleState::Pending
                || session.lifecycle_state == LifecycleState::Starting
            {
                continue;
            }
            let container_ok = spawner::container_alive(runtime, &session.container_id).await;
            let tunnel_ok = tunnels.get(&session.container_id).is_some();

            if container_ok && tunnel_ok {
                table
                    .mutate(&session.session_id, |s| s.consecutive_health_failures = 0)
                    .await;
                continue;
            }

            let failures = {
                let mut count = 0;
                table
                    .mutate(&session.session_id, |s| {
                        s.consecutive_health_failures += 1;
                        count = s.consecutive_health_failures;
                    })
                    .await;
                count
            };
            tracing::warn!(
                session_id = %session.session_id,
                container_ok,
                tunnel_ok,
                failures,
                "health probe failed"
            );
            if failures >= 3 {
                tracing::error!(session_id = %session.session_id, "three consecutive health failures, failing session");
                table
                    .mutate(&session.session_id, |s| {
                        s.last_reason = Some("HealthProbeFailed".to_string());
                        s.transition(LifecycleState::Failed);
                    })
                    .await;
                table.release(&session.resources).await;
                stop_session(&cfg, &table, &session.session_id, "HealthProbeFailed").await;
            }
        }
        let _ = table.save_state().await;
    }
}

/// `Reap`: remove containers with no matching session, idle tunnels older
/// than `T_idle`, and exited-but-not-removed containers older than
/// `T_reap` (`spec.md` §4.3).
pub async fn reap(cfg: &SupervisorConfig, table: &SessionTable, tunnels: &TunnelRegistry) {
    let runtime = match spawner::probe_runtime(cfg.runtime).await {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(error = %e, "reap: no container runtime available");
            return;
        }
    };

    let known: std::collections::HashSet<String> =
        table.list().await.into_iter().map(|s| s.container_id).collect();

    match spawner::list_helix_containers(runtime).await {
        Ok(containers) => {
            for container_id in containers {
                if known.contains(&container_id) {
                    continue;
                }
                tracing::info!(container_id, "reaping orphaned container");
                let _ = spawner::remove(runtime, &container_id).await;
            }
        }
        Err(e) => tracing::warn!(error = %e, "reap: failed to list containers"),
    }

    tunnels.reap_idle(Duration::from_secs(cfg.idle_tunnel_secs));
}

/// Resource advertisement exposed to admission callers.
#[must_use]
pub async fn resources(table: &SessionTable) -> HostResources {
    table.resources().await
}
