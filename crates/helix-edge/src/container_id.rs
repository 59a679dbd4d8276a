//! Derives this container's own identity for the tunnel handshake.
//!
//! The Supervisor hands the container `HELIX_SESSION_ID` and
//! `HELIX_TUNNEL_ADDR` (`helix-supervisor`'s `spawner.rs`) but not its own
//! `container_id` — the container has no way to learn the id the runtime
//! assigned it except by asking the runtime. Docker and Podman both default
//! a container's hostname to its short container id unless the image or
//! launch args override it, and `spawner.rs` sets no `--hostname`, so
//! `gethostname` is the grounded, dependency-free way to recover it
//! (documented as an Open Question disposition in `DESIGN.md`).
//!
//! # Errors
//!
//! Returns an error if the hostname cannot be read or is empty.
pub fn derive() -> anyhow::Result<String> {
    let hostname = nix::unistd::gethostname()
        .map_err(|e| anyhow::anyhow!("gethostname failed: {e}"))?
        .into_string()
        .map_err(|_| anyhow::anyhow!("hostname is not valid UTF-8"))?;
    if hostname.is_empty() {
        anyhow::bail!("hostname is empty");
    }
    Ok(hostname)
}
