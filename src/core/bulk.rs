//! Bulk instance definitions read from a JSON file
//!
//! ```json
//! {
//!   "instances": {
//!     "alpha": { "version": "13.0", "port": 30000, "environment": { "TZ": "UTC" } },
//!     "beta":  { "version": "12.331", "port": 30001, "image": "registry.local/foundry:12" }
//!   }
//! }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::Deserialize;

use super::instance::InstanceConfig;
use crate::error::{IoContext, ManagerError, Result};

/// Port used when an entry does not name one
const DEFAULT_PORT: u16 = 30000;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BulkConfig {
    /// Instance definitions keyed by name
    #[serde(default)]
    pub instances: BTreeMap<String, BulkInstance>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BulkInstance {
    pub version: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub proxy_port: Option<u16>,
    #[serde(default)]
    pub admin_key: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl BulkConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).at(path)?;
        Self::parse(&bytes, &path.display().to_string())
    }

    pub fn parse(bytes: &[u8], source: &str) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| ManagerError::invalid("instance config", source, e.to_string()))
    }

    /// Validated create arguments, ordered by name.
    ///
    /// Ports claimed twice within the file are rejected here, before anything
    /// is created.
    pub fn into_instance_configs(self) -> Result<Vec<InstanceConfig>> {
        let mut claimed: HashMap<u16, String> = HashMap::new();
        let mut configs = Vec::with_capacity(self.instances.len());

        for (name, entry) in self.instances {
            let config = InstanceConfig {
                name,
                version: entry.version,
                port: entry.port,
                proxy_port: entry.proxy_port,
                admin_key: entry.admin_key,
                image: entry.image,
                environment: entry.environment.into_iter().collect(),
            };
            config.validate()?;

            for port in std::iter::once(config.port).chain(config.proxy_port) {
                if let Some(owner) = claimed.insert(port, config.name.clone()) {
                    return Err(ManagerError::PortInUse { port, owner });
                }
            }
            configs.push(config);
        }
        Ok(configs)
    }
}
