/// Well-known system-bus name for the Sandbox Supervisor (C3).
pub const SUPERVISOR_SERVICE_NAME: &str = "dev.helix.Supervisor1";
/// Object path the Supervisor interface is served at.
pub const SUPERVISOR_OBJECT_PATH: &str = "/dev/helix/Supervisor1";

/// Well-known system-bus name for the Session Registry (C5).
pub const REGISTRY_SERVICE_NAME: &str = "dev.helix.Registry1";
/// Object path the Registry interface is served at.
pub const REGISTRY_OBJECT_PATH: &str = "/dev/helix/Registry1";
