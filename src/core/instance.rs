//! Instance records and the declared-vs-observed reconciliation rule

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{ManagerError, Result};

/// Status of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Record and directories exist, no container started yet
    Created,
    /// Container confirmed live
    Running,
    /// Container stopped or gone
    Stopped,
    /// Runtime could not be reached; only ever reported, never persisted
    Unknown,
}

impl InstanceStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown instance status '{}'", other)),
        }
    }
}

/// Arguments for creating an instance
#[derive(Debug, Clone, Default)]
pub struct InstanceConfig {
    pub name: String,
    pub version: String,
    pub port: u16,
    pub proxy_port: Option<u16>,
    pub admin_key: Option<String>,
    /// Full image reference used instead of `<repository>:<version>`
    pub image: Option<String>,
    /// Extra container environment
    pub environment: Vec<(String, String)>,
}

impl InstanceConfig {
    pub fn new(name: impl Into<String>, version: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            port,
            ..Default::default()
        }
    }

    pub fn with_admin_key(mut self, key: impl Into<String>) -> Self {
        self.admin_key = Some(key.into());
        self
    }

    pub fn with_proxy_port(mut self, port: u16) -> Self {
        self.proxy_port = Some(port);
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.push((key.into(), value.into()));
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_name("instance name", &self.name)?;
        if self.name == crate::core::layout::SHARED_DIR {
            return Err(ManagerError::invalid(
                "instance name",
                &self.name,
                "reserved for the shared data area",
            ));
        }
        if self.version.trim().is_empty() {
            return Err(ManagerError::invalid("version", &self.version, "must not be empty"));
        }
        if self.port == 0 {
            return Err(ManagerError::invalid("port", "0", "must be between 1 and 65535"));
        }
        if self.proxy_port == Some(0) {
            return Err(ManagerError::invalid("proxy port", "0", "must be between 1 and 65535"));
        }
        if self.proxy_port == Some(self.port) {
            return Err(ManagerError::invalid(
                "proxy port",
                self.port.to_string(),
                "must differ from the instance port",
            ));
        }
        if let Some(image) = &self.image {
            if image.is_empty() || image.chars().any(char::is_whitespace) {
                return Err(ManagerError::invalid(
                    "image",
                    image,
                    "must be a non-empty image reference without spaces",
                ));
            }
        }
        for (key, _) in &self.environment {
            if key.is_empty() || key.contains('=') {
                return Err(ManagerError::invalid(
                    "environment variable",
                    key,
                    "names must be non-empty and contain no '='",
                ));
            }
        }
        Ok(())
    }
}

/// Persisted metadata for one instance, merged with live status when reported
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    pub version: String,
    pub port: u16,
    pub proxy_port: Option<u16>,
    /// Reference into the secrets table, never the key itself
    pub admin_key_ref: Option<String>,
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
    pub base_dir: PathBuf,
    /// Image chosen at create time, overriding the version tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_image: Option<String>,
    #[serde(default)]
    pub environment: Vec<(String, String)>,
}

impl Instance {
    /// Root of this instance's directory tree
    pub fn root_dir(&self) -> PathBuf {
        self.base_dir.join(&self.name)
    }

    /// Container image reference: the custom image if one was given,
    /// otherwise `repository` tagged with the instance version
    pub fn image(&self, repository: &str) -> String {
        match &self.custom_image {
            Some(image) => image.clone(),
            None => format!("{}:{}", repository, self.version),
        }
    }

    /// Ports this instance claims on the host
    pub fn claimed_ports(&self) -> impl Iterator<Item = u16> {
        std::iter::once(self.port).chain(self.proxy_port)
    }
}

/// What the runtime reported about an instance's container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observed {
    Running,
    NotRunning,
    Missing,
    Unreachable,
}

/// Outcome of reconciling declared and observed state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciled {
    /// Status to report
    pub status: InstanceStatus,
    /// Whether the stored status must be overwritten with `status`
    pub persist: bool,
}

/// Resolve declared status against live observation.
///
/// The runtime wins for liveness, the record wins for everything else. An
/// unreachable runtime yields `Unknown` without touching the record.
pub fn reconcile(declared: InstanceStatus, observed: Observed) -> Reconciled {
    use InstanceStatus::*;

    let (status, persist) = match (declared, observed) {
        (_, Observed::Unreachable) => (Unknown, false),
        (Running, Observed::Running) => (Running, false),
        (Running, Observed::NotRunning | Observed::Missing) => (Stopped, true),
        (Created | Stopped | Unknown, Observed::Running) => (Running, true),
        (Unknown, Observed::NotRunning | Observed::Missing) => (Stopped, true),
        (other, Observed::NotRunning | Observed::Missing) => (other, false),
    };
    Reconciled { status, persist }
}

/// Names become directory and container names, so keep them to a portable set
pub fn validate_name(what: &'static str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ManagerError::invalid(what, name, "must not be empty"));
    }
    if name.len() > 64 {
        return Err(ManagerError::invalid(what, name, "must be at most 64 characters"));
    }
    if name.starts_with(['.', '-']) {
        return Err(ManagerError::invalid(what, name, "must not start with '.' or '-'"));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(ManagerError::invalid(
            what,
            name,
            format!("contains unsupported character '{}'", c),
        ));
    }
    Ok(())
}
