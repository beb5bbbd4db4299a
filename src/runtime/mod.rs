//! Container runtime adapter - the narrow capability set the lifecycle manager needs
//!
//! Every call takes an absolute deadline. Implementations must give up and
//! return [`RuntimeError::Timeout`] once it passes.

pub mod docker;

use std::path::PathBuf;
use std::time::{Duration, Instant};

pub use docker::DockerCli;

/// Errors reported by a container runtime
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    /// The referenced container does not exist
    #[error("container '{0}' not found")]
    NotFound(String),

    /// The runtime could not be reached at all
    #[error("runtime unavailable: {0}")]
    Unavailable(String),

    /// The call did not finish before its deadline
    #[error("{operation} timed out after {elapsed:?}")]
    Timeout {
        operation: &'static str,
        elapsed: Duration,
    },

    /// The runtime was reachable but rejected the operation
    #[error("{operation} failed: {reason}")]
    Failed {
        operation: &'static str,
        reason: String,
    },
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// Opaque handle to a container; the instance name doubles as container name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerRef(pub String);

impl ContainerRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContainerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Bind mount from the host into the container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host_path: PathBuf,
    pub container_path: String,
    pub read_only: bool,
}

impl Mount {
    pub fn read_write(host_path: impl Into<PathBuf>, container_path: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
            read_only: false,
        }
    }
}

/// Host port published to a container port, bound to loopback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
}

/// Everything needed to create a container for one instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub mounts: Vec<Mount>,
    pub ports: Vec<PortMapping>,
    pub environment: Vec<(String, String)>,
}

/// Live state as observed by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerState {
    pub running: bool,
}

/// Capability interface over the container runtime
pub trait ContainerRuntime: Send + Sync {
    fn create_container(&self, spec: &ContainerSpec, deadline: Instant)
        -> RuntimeResult<ContainerRef>;

    fn start(&self, container: &ContainerRef, deadline: Instant) -> RuntimeResult<()>;

    fn stop(&self, container: &ContainerRef, deadline: Instant) -> RuntimeResult<()>;

    fn remove(&self, container: &ContainerRef, deadline: Instant) -> RuntimeResult<()>;

    fn inspect(&self, container: &ContainerRef, deadline: Instant)
        -> RuntimeResult<ContainerState>;
}
