//! Shared D-Bus service interfaces and proxies for the Sandbox Supervisor
//! (`dev.helix.Supervisor1`) and Session Registry (`dev.helix.Registry1`).

pub mod constants;
pub mod registry;
pub mod supervisor;
pub mod types;

pub use registry::{Registry1Proxy, RegistryBackend, RegistryInterface};
pub use supervisor::{Supervisor1Proxy, SupervisorBackend, SupervisorInterface};
