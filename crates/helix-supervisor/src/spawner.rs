//! Container lifecycle operations, shelled to the configured container
//! runtime CLI (`podman`/`docker`) via `tokio::process::Command` — the same
//! subprocess-wrapping idiom used for `systemd-run`/`systemctl`
//! (`spawn_user_server`/`stop_user_server`), generalized from "spawn a
//! per-user RDP server" to "run an opaque desktop image" since no
//! container-runtime crate appears anywhere in the retrieval corpus.

use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::config::ContainerRuntime;
use crate::session::ResourceRequest;

/// Probe for a working container runtime binary on `$PATH`, honoring an
/// explicit config choice first.
pub async fn probe_runtime(configured: ContainerRuntime) -> Result<ContainerRuntime> {
    if !matches!(configured, ContainerRuntime::Auto) {
        return Ok(configured);
    }
    for candidate in [ContainerRuntime::Podman, ContainerRuntime::Docker] {
        let ok = tokio::process::Command::new(candidate.binary_name())
            .arg("--version")
            .output()
            .await
            .is_ok_and(|o| o.status.success());
        if ok {
            return Ok(candidate);
        }
    }
    bail!("no working container runtime found on PATH (tried podman, docker)")
}

/// Pull (or resolve, if already present locally) the image reference.
/// Capped exponential backoff per `spec.md` §4.3: 3 attempts, 1s/4s/15s.
pub async fn pull_image(runtime: ContainerRuntime, image_ref: &str) -> Result<()> {
    let delays = [Duration::from_secs(1), Duration::from_secs(4), Duration::from_secs(15)];
    let mut last_err = None;
    for (attempt, delay) in delays.iter().enumerate() {
        match run(runtime, &["pull", image_ref]).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::warn!(image_ref, attempt, error = %e, "image pull attempt failed");
                last_err = Some(e);
                tokio::time::sleep(*delay).await;
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("image pull exhausted retries")))
}

/// Create and start a container from `image_ref` with the given resource
/// shape, publishing the Edge Server's local port only to loopback (the
/// Supervisor's tunnel accept port is the only externally reachable path
/// in, per `spec.md` §4.2's "well-known local port exposed only via the
/// Sandbox Supervisor's tunnel").
///
/// Returns the runtime-assigned container id.
pub async fn create_and_start(
    runtime: ContainerRuntime,
    session_id: &str,
    image_ref: &str,
    resources: &ResourceRequest,
    tunnel_bind: &str,
) -> Result<String> {
    let name = format!("helix-{session_id}");
    let mem_arg = format!("{}m", resources.ram_mb);
    let cpu_arg = resources.cpu_cores.to_string();

    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        name,
        "--memory".to_string(),
        mem_arg,
        "--cpus".to_string(),
        cpu_arg,
        "--env".to_string(),
        format!("HELIX_SESSION_ID={session_id}"),
        "--env".to_string(),
        format!("HELIX_TUNNEL_ADDR={tunnel_bind}"),
    ];
    if resources.gpu_vendor.eq_ignore_ascii_case("nvidia") {
        args.push("--device".to_string());
        args.push("nvidia.com/gpu=all".to_string());
    }
    args.push(image_ref.to_string());

    let args_ref: Vec<&str> = args.iter().map(String::as_str).collect();
    let output = run_capture(runtime, &args_ref).await?;
    let container_id = output.trim().to_string();
    if container_id.is_empty() {
        bail!("container runtime returned an empty container id");
    }
    Ok(container_id)
}

/// Whether the container is still alive, per `docker/podman inspect`.
pub async fn container_alive(runtime: ContainerRuntime, container_id: &str) -> bool {
    run_capture(runtime, &["inspect", "-f", "{{.State.Running}}", container_id])
        .await
        .map(|out| out.trim() == "true")
        .unwrap_or(false)
}

/// Cooperatively stop, falling back to a hard kill if the container doesn't
/// exit within `grace`.
pub async fn stop(runtime: ContainerRuntime, container_id: &str, grace: Duration) -> Result<()> {
    let secs = grace.as_secs().to_string();
    let result = run(runtime, &["stop", "-t", &secs, container_id]).await;
    if let Err(e) = result {
        tracing::warn!(container_id, error = %e, "graceful stop failed, killing");
        run(runtime, &["kill", container_id]).await?;
    }
    Ok(())
}

/// Remove a stopped container (`Reap`'s cleanup of exited-but-not-removed
/// containers, `spec.md` §4.3).
pub async fn remove(runtime: ContainerRuntime, container_id: &str) -> Result<()> {
    run(runtime, &["rm", "-f", container_id]).await
}

/// List every container id the runtime knows about with the `helix-`
/// naming convention, used by `Reap` to find containers with no matching
/// session in the table (`spec.md` §4.3 "containers whose session is not
/// in the Registry").
pub async fn list_helix_containers(runtime: ContainerRuntime) -> Result<Vec<String>> {
    let out = run_capture(
        runtime,
        &["ps", "-a", "--filter", "name=helix-", "--format", "{{.ID}}"],
    )
    .await?;
    Ok(out.lines().map(str::trim).filter(|l| !l.is_empty()).map(str::to_string).collect())
}

async fn run(runtime: ContainerRuntime, args: &[&str]) -> Result<()> {
    let output = tokio::process::Command::new(runtime.binary_name())
        .args(args)
        .output()
        .await
        .with_context(|| format!("failed to run {} {:?}", runtime.binary_name(), args))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("{} {:?} failed: {stderr}", runtime.binary_name(), args);
    }
    Ok(())
}

async fn run_capture(runtime: ContainerRuntime, args: &[&str]) -> Result<String> {
    let output = tokio::process::Command::new(runtime.binary_name())
        .args(args)
        .output()
        .await
        .with_context(|| format!("failed to run {} {:?}", runtime.binary_name(), args))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("{} {:?} failed: {stderr}", runtime.binary_name(), args);
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}
