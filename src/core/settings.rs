//! Persisted settings, read once per invocation and handed to every manager

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Account used by the container image to download the application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Application settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Root of all instance trees and the shared area
    pub base_dir: Option<PathBuf>,
    /// Application account passed into new containers
    pub credentials: Option<Credentials>,
    /// Image repository; the instance version becomes the tag
    pub image_repository: String,
    /// Container runtime client binary
    pub docker_binary: PathBuf,
    /// Deadline for each runtime call in seconds
    pub runtime_timeout_secs: u64,
    /// Deadline for each content download in seconds
    pub fetch_timeout_secs: u64,
    /// How long to wait for another process holding the same instance lock
    pub lock_timeout_secs: u64,
    /// Keep instance history for N days (0 = forever)
    pub history_retention_days: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_dir: None,
            credentials: None,
            image_repository: "felddy/foundryvtt".to_string(),
            docker_binary: PathBuf::from("docker"),
            runtime_timeout_secs: 60,
            fetch_timeout_secs: 120,
            lock_timeout_secs: 30,
            history_retention_days: 30,
        }
    }
}

impl Settings {
    /// Get the base directory, using default if not set
    pub fn get_base_dir(&self) -> PathBuf {
        self.base_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("foundry-instances")
        })
    }

    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(base_dir.into());
        self
    }

    pub fn runtime_deadline(&self) -> Instant {
        Instant::now() + Duration::from_secs(self.runtime_timeout_secs)
    }

    pub fn fetch_deadline(&self) -> Instant {
        Instant::now() + Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    /// Validate settings and fix any invalid values
    pub fn validate(&mut self) {
        self.runtime_timeout_secs = self.runtime_timeout_secs.clamp(5, 3600);
        self.fetch_timeout_secs = self.fetch_timeout_secs.clamp(5, 3600);
        self.lock_timeout_secs = self.lock_timeout_secs.min(600);
        if self.image_repository.trim().is_empty() {
            self.image_repository = Self::default().image_repository;
        }
        if self.docker_binary.as_os_str().is_empty() {
            self.docker_binary = Self::default().docker_binary;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_clamps_timeouts() {
        let mut settings = Settings {
            runtime_timeout_secs: 0,
            fetch_timeout_secs: 100_000,
            lock_timeout_secs: 10_000,
            image_repository: "  ".into(),
            ..Default::default()
        };
        settings.validate();
        assert_eq!(settings.runtime_timeout_secs, 5);
        assert_eq!(settings.fetch_timeout_secs, 3600);
        assert_eq!(settings.lock_timeout_secs, 600);
        assert_eq!(settings.image_repository, "felddy/foundryvtt");
    }

    #[test]
    fn explicit_base_dir_wins() {
        let settings = Settings::default().with_base_dir("/srv/foundry");
        assert_eq!(settings.get_base_dir(), PathBuf::from("/srv/foundry"));
    }

    #[test]
    fn missing_fields_take_defaults() {
        let settings: Settings = serde_json::from_str(r#"{"base_dir":"/x"}"#).unwrap();
        assert_eq!(settings.base_dir, Some(PathBuf::from("/x")));
        assert_eq!(settings.runtime_timeout_secs, 60);
        assert!(settings.credentials.is_none());
    }
}
