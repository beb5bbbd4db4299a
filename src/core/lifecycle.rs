//! Instance lifecycle - create, start, stop, delete and reconciled status

use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::content::ContentManager;
use super::bulk::BulkConfig;
use super::instance::{reconcile, Instance, InstanceConfig, InstanceStatus, Observed};
use super::layout::{FsLayout, InstancePaths, SHARED_DIR};
use super::lock::ScopedLock;
use super::settings::Settings;
use super::world::WorldManager;
use crate::error::{ManagerError, Result};
use crate::fetch::Fetcher;
use crate::persistence::{Database, HistoryEvent};
use crate::runtime::{
    ContainerRef, ContainerRuntime, ContainerSpec, Mount, PortMapping, RuntimeError,
    RuntimeResult,
};

/// Port the application listens on inside the container
pub const CONTAINER_HTTP_PORT: u16 = 30000;
/// TLS port inside the container, published when a proxy port is set
pub const CONTAINER_PROXY_PORT: u16 = 443;

/// Steps of a delete, in the order they run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteStep {
    StopContainer,
    RemoveContainer,
    RemoveDirectory,
    RemoveSecret,
}

impl std::fmt::Display for DeleteStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::StopContainer => "stop container",
            Self::RemoveContainer => "remove container",
            Self::RemoveDirectory => "remove directory tree",
            Self::RemoveSecret => "remove admin key",
        })
    }
}

/// Outcome of a delete. Failures are only collected under `force`; without
/// it the first failing step aborts the delete.
#[derive(Debug)]
pub struct DeleteReport {
    pub name: String,
    pub failures: Vec<(DeleteStep, ManagerError)>,
}

impl DeleteReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Orchestrates the metadata store, the container runtime and the directory layout
pub struct InstanceManager {
    database: Arc<Database>,
    runtime: Arc<dyn ContainerRuntime>,
    settings: Settings,
    layout: FsLayout,
}

impl InstanceManager {
    pub fn new(
        database: Arc<Database>,
        runtime: Arc<dyn ContainerRuntime>,
        settings: Settings,
    ) -> Self {
        let layout = FsLayout::new(settings.get_base_dir());
        Self {
            database,
            runtime,
            settings,
            layout,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn layout(&self) -> &FsLayout {
        &self.layout
    }

    /// Content operations against instances of this store
    pub fn content(&self, fetcher: Arc<dyn Fetcher>) -> ContentManager {
        ContentManager::new(self.database.clone(), fetcher, self.settings.clone())
    }

    /// World operations against instances of this store
    pub fn worlds(&self) -> WorldManager {
        WorldManager::new(self.database.clone(), self.settings.clone())
    }

    /// Create the record and directory tree; no container is started
    pub fn create(&self, config: InstanceConfig) -> Result<Instance> {
        config.validate()?;
        let _lock = self.lock(&config.name)?;

        if self.database.get_instance(&config.name)?.is_some() {
            return Err(ManagerError::DuplicateInstance(config.name));
        }

        let InstanceConfig {
            name,
            version,
            port,
            proxy_port,
            admin_key,
            image,
            environment,
        } = config;
        let mut instance = Instance {
            name,
            version,
            port,
            proxy_port,
            admin_key_ref: None,
            status: InstanceStatus::Created,
            created_at: Utc::now(),
            base_dir: self.layout.base_dir().to_path_buf(),
            custom_image: image,
            environment,
        };

        for port in instance.claimed_ports() {
            if let Some(owner) = self.database.find_port_owner(port)? {
                return Err(ManagerError::PortInUse { port, owner });
            }
            if TcpListener::bind(("127.0.0.1", port)).is_err() {
                warn!("Port {} is already bound on this host", port);
            }
        }

        let (paths, fresh) = self.layout.ensure_instance(&instance.name)?;
        if !fresh {
            warn!(
                "Adopting existing directory {:?} for new instance '{}'",
                paths.root, instance.name
            );
        }

        if let Some(key) = &admin_key {
            instance.admin_key_ref = Some(self.database.save_secret(key)?);
        }

        if let Err(e) = self.database.insert_instance(&instance) {
            if fresh {
                if let Err(cleanup) = paths.remove() {
                    warn!("Failed to roll back directory {:?}: {}", paths.root, cleanup);
                }
            }
            if let Some(reference) = &instance.admin_key_ref {
                if let Err(cleanup) = self.database.delete_secret(reference) {
                    warn!("Failed to roll back admin key: {}", cleanup);
                }
            }
            return Err(e);
        }

        self.record_event(
            &instance.name,
            "created",
            Some(&format!("version {} on port {}", instance.version, instance.port)),
        );
        info!(
            "Created instance '{}' (image {}, port {})",
            instance.name,
            instance.image(&self.settings.image_repository),
            instance.port
        );
        Ok(instance)
    }

    /// Create every instance of a bulk configuration, in name order.
    ///
    /// All entries are validated before the first one is created; creation
    /// stops at the first failure and keeps the instances made so far.
    pub fn create_from_config(&self, config: BulkConfig) -> Result<Vec<Instance>> {
        let configs = config.into_instance_configs()?;
        let mut created = Vec::with_capacity(configs.len());
        for instance_config in configs {
            let name = instance_config.name.clone();
            match self.create(instance_config) {
                Ok(instance) => created.push(instance),
                Err(e) => {
                    error!(
                        "Failed to create instance '{}' from config ({} created before it): {}",
                        name,
                        created.len(),
                        e
                    );
                    return Err(e);
                }
            }
        }
        Ok(created)
    }

    /// Bring the container up, creating it if the runtime has none
    pub fn start(&self, name: &str) -> Result<Instance> {
        let _lock = self.lock(name)?;
        let record = self.require(name)?;
        let observed = self.probe(name).map_err(|e| ManagerError::runtime(name, e))?;

        if record.status == InstanceStatus::Running && observed == Observed::Running {
            return Err(ManagerError::AlreadyRunning(name.to_string()));
        }
        self.start_locked(record, observed)
    }

    fn start_locked(&self, mut record: Instance, observed: Observed) -> Result<Instance> {
        let name = record.name.clone();
        let corrected = reconcile(record.status, observed);
        if corrected.persist {
            self.persist_correction(&record, corrected.status)?;
            record.status = corrected.status;
        }
        if observed == Observed::Running {
            // Already live outside our control; the record now says so
            return Ok(record);
        }

        let layout = FsLayout::new(&record.base_dir);
        let (paths, rebuilt) = layout.ensure_instance(&name)?;
        if rebuilt {
            warn!("Rebuilt missing directory tree for instance '{}'", name);
        }

        let container = ContainerRef::new(&name);
        let deadline = self.settings.runtime_deadline();
        if observed == Observed::Missing {
            let spec = self.container_spec(&record, &layout, &paths)?;
            self.runtime
                .create_container(&spec, deadline)
                .map_err(|e| ManagerError::runtime(&name, e))?;
            debug!("Created container for '{}' from {}", name, spec.image);
        }

        self.runtime
            .start(&container, deadline)
            .map_err(|e| ManagerError::runtime(&name, e))?;
        let state = self
            .runtime
            .inspect(&container, deadline)
            .map_err(|e| ManagerError::runtime(&name, e))?;
        if !state.running {
            return Err(ManagerError::runtime(
                &name,
                RuntimeError::Failed {
                    operation: "start",
                    reason: "container exited right after starting".to_string(),
                },
            ));
        }

        self.database
            .update_instance_status(&name, InstanceStatus::Running)?;
        self.record_event(&name, "started", None);
        info!("Started instance '{}' on port {}", name, record.port);
        record.status = InstanceStatus::Running;
        Ok(record)
    }

    /// Stop the container; stopping a stopped instance is a no-op
    pub fn stop(&self, name: &str) -> Result<Instance> {
        let _lock = self.lock(name)?;
        let mut record = self.require(name)?;
        let observed = self.probe(name).map_err(|e| ManagerError::runtime(name, e))?;

        if observed != Observed::Running && record.status != InstanceStatus::Running {
            debug!("Instance '{}' is already stopped", name);
            return Ok(record);
        }

        let deadline = self.settings.runtime_deadline();
        match self.runtime.stop(&ContainerRef::new(name), deadline) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                warn!("Container for '{}' was already gone", name);
            }
            Err(e) => return Err(ManagerError::runtime(name, e)),
        }

        self.database
            .update_instance_status(name, InstanceStatus::Stopped)?;
        self.record_event(name, "stopped", None);
        info!("Stopped instance '{}'", name);
        record.status = InstanceStatus::Stopped;
        Ok(record)
    }

    /// Remove container, directory tree, admin key and record, in that order.
    ///
    /// With `force` a running instance is stopped first and failing steps are
    /// collected in the report instead of aborting. The record is always the
    /// last thing removed and a failure there is never tolerated.
    pub fn delete(&self, name: &str, force: bool) -> Result<DeleteReport> {
        let _lock = self.lock(name)?;
        let record = self.require(name)?;
        let observed = self.observe(name);

        let running = match observed {
            Observed::Running => true,
            Observed::Unreachable => record.status == InstanceStatus::Running,
            Observed::NotRunning | Observed::Missing => false,
        };
        if running && !force {
            return Err(ManagerError::InstanceRunning(name.to_string()));
        }

        let mut report = DeleteReport {
            name: name.to_string(),
            failures: Vec::new(),
        };
        let container = ContainerRef::new(name);
        let deadline = self.settings.runtime_deadline();

        if running {
            run_step(&mut report, DeleteStep::StopContainer, force, || {
                tolerate_missing(self.runtime.stop(&container, deadline))
                    .map_err(|e| ManagerError::runtime(name, e))
            })?;
        }
        run_step(&mut report, DeleteStep::RemoveContainer, force, || {
            tolerate_missing(self.runtime.remove(&container, deadline))
                .map_err(|e| ManagerError::runtime(name, e))
        })?;
        run_step(&mut report, DeleteStep::RemoveDirectory, force, || {
            FsLayout::new(&record.base_dir).instance(name).remove()
        })?;
        if let Some(reference) = &record.admin_key_ref {
            run_step(&mut report, DeleteStep::RemoveSecret, force, || {
                self.database.delete_secret(reference)
            })?;
        }

        self.database.delete_instance(name)?;
        let details = (!report.is_clean())
            .then(|| format!("{} step(s) failed under --force", report.failures.len()));
        self.record_event(name, "deleted", details.as_deref());
        info!("Deleted instance '{}'", name);
        Ok(report)
    }

    /// Every record with its reconciled status; an unreachable runtime yields `unknown`
    pub fn list(&self) -> Result<Vec<Instance>> {
        let records = self.database.load_all_instances()?;
        Ok(records
            .into_iter()
            .map(|record| self.reconciled_view(record))
            .collect())
    }

    pub fn status(&self, name: &str) -> Result<Instance> {
        let record = self.require(name)?;
        Ok(self.reconciled_view(record))
    }

    /// Switch an instance to another application version.
    ///
    /// The container is recreated from the new image; a running instance is
    /// started again afterwards.
    pub fn migrate(&self, name: &str, version: &str) -> Result<Instance> {
        if version.trim().is_empty() {
            return Err(ManagerError::invalid("version", version, "must not be empty"));
        }
        let _lock = self.lock(name)?;
        let mut record = self.require(name)?;
        let observed = self.probe(name).map_err(|e| ManagerError::runtime(name, e))?;
        let was_running = observed == Observed::Running;
        let previous = record.version.clone();

        let container = ContainerRef::new(name);
        let deadline = self.settings.runtime_deadline();
        if was_running {
            tolerate_missing(self.runtime.stop(&container, deadline))
                .map_err(|e| ManagerError::runtime(name, e))?;
        }
        if observed != Observed::Missing {
            tolerate_missing(self.runtime.remove(&container, deadline))
                .map_err(|e| ManagerError::runtime(name, e))?;
        }

        self.database.update_instance_version(name, version)?;
        record.version = version.to_string();
        if let Some(image) = &record.custom_image {
            warn!(
                "Instance '{}' uses custom image {}; the new version is recorded but the image is unchanged",
                name, image
            );
        }
        self.record_event(
            name,
            "migrated",
            Some(&format!("{} -> {}", previous, version)),
        );
        info!("Migrated instance '{}' from {} to {}", name, previous, version);

        if was_running {
            // The old container is gone on purpose, not a liveness mismatch
            record.status = InstanceStatus::Stopped;
            return self.start_locked(record, Observed::Missing);
        }
        if record.status == InstanceStatus::Running {
            self.persist_correction(&record, InstanceStatus::Stopped)?;
            record.status = InstanceStatus::Stopped;
        }
        Ok(record)
    }

    /// Lifecycle events, newest first; kept after the instance is deleted
    pub fn history(&self, name: &str) -> Result<Vec<HistoryEvent>> {
        self.database.get_instance_history(name)
    }

    fn require(&self, name: &str) -> Result<Instance> {
        self.database
            .get_instance(name)?
            .ok_or_else(|| ManagerError::InstanceNotFound(name.to_string()))
    }

    fn lock(&self, name: &str) -> Result<ScopedLock> {
        ScopedLock::instance(self.database.scope(), name, self.settings.lock_timeout())
    }

    /// Ask the runtime about the instance's container
    fn probe(&self, name: &str) -> RuntimeResult<Observed> {
        let deadline = self.settings.runtime_deadline();
        match self.runtime.inspect(&ContainerRef::new(name), deadline) {
            Ok(state) if state.running => Ok(Observed::Running),
            Ok(_) => Ok(Observed::NotRunning),
            Err(e) if e.is_not_found() => Ok(Observed::Missing),
            Err(e) => Err(e),
        }
    }

    fn observe(&self, name: &str) -> Observed {
        self.probe(name).unwrap_or_else(|e| {
            warn!("Cannot observe instance '{}': {}", name, e);
            Observed::Unreachable
        })
    }

    /// Merge live status into a record, persisting liveness corrections.
    ///
    /// Corrections are skipped while another process holds the instance lock,
    /// since that process is about to write the status itself.
    fn reconciled_view(&self, mut record: Instance) -> Instance {
        let corrected = reconcile(record.status, self.observe(&record.name));
        if corrected.persist {
            match ScopedLock::instance(self.database.scope(), &record.name, Duration::ZERO) {
                Ok(_lock) => {
                    if let Err(e) = self.persist_correction(&record, corrected.status) {
                        error!("Failed to persist status of '{}': {}", record.name, e);
                    }
                }
                Err(_) => debug!(
                    "Instance '{}' is busy; reporting without persisting",
                    record.name
                ),
            }
        }
        record.status = corrected.status;
        record
    }

    fn persist_correction(&self, record: &Instance, status: InstanceStatus) -> Result<()> {
        warn!(
            "Instance '{}' recorded as {} but runtime says {}; correcting",
            record.name, record.status, status
        );
        self.database.update_instance_status(&record.name, status)?;
        self.record_event(
            &record.name,
            "reconciled",
            Some(&format!("{} -> {}", record.status, status)),
        );
        Ok(())
    }

    fn container_spec(
        &self,
        record: &Instance,
        layout: &FsLayout,
        paths: &InstancePaths,
    ) -> Result<ContainerSpec> {
        let mut environment = Vec::new();
        if let Some(credentials) = &self.settings.credentials {
            environment.push(("FOUNDRY_USERNAME".to_string(), credentials.username.clone()));
            environment.push(("FOUNDRY_PASSWORD".to_string(), credentials.password.clone()));
        }
        if let Some(reference) = &record.admin_key_ref {
            let key = self
                .database
                .load_secret(reference)?
                .ok_or_else(|| ManagerError::CorruptRecord {
                    name: record.name.clone(),
                    reason: format!("admin key {} is missing from the store", reference),
                })?;
            environment.push(("FOUNDRY_ADMIN_KEY".to_string(), key));
        }
        if let Some(proxy) = record.proxy_port {
            environment.push(("FOUNDRY_PROXY_PORT".to_string(), proxy.to_string()));
            environment.push(("FOUNDRY_PROXY_SSL".to_string(), "true".to_string()));
        }
        environment.extend(record.environment.iter().cloned());

        let mut ports = vec![PortMapping {
            host_port: record.port,
            container_port: CONTAINER_HTTP_PORT,
        }];
        if let Some(proxy) = record.proxy_port {
            ports.push(PortMapping {
                host_port: proxy,
                container_port: CONTAINER_PROXY_PORT,
            });
        }

        Ok(ContainerSpec {
            name: record.name.clone(),
            image: record.image(&self.settings.image_repository),
            mounts: vec![
                Mount::read_write(&paths.data, "/data"),
                Mount::read_write(&paths.content, "/data/Data/systems"),
                Mount::read_write(&paths.worlds, "/data/Data/worlds"),
                Mount::read_write(layout.shared_dir(), format!("/data/Data/{}", SHARED_DIR)),
            ],
            ports,
            environment,
        })
    }

    fn record_event(&self, name: &str, event: &str, details: Option<&str>) {
        if let Err(e) = self.database.record_instance_event(name, event, details) {
            warn!("Failed to record '{}' event for '{}': {}", event, name, e);
        }
    }
}

fn tolerate_missing(result: RuntimeResult<()>) -> RuntimeResult<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

fn run_step(
    report: &mut DeleteReport,
    step: DeleteStep,
    force: bool,
    action: impl FnOnce() -> Result<()>,
) -> Result<()> {
    match action() {
        Ok(()) => Ok(()),
        Err(e) if force => {
            warn!("Delete of '{}': {} failed: {}", report.name, step, e);
            report.failures.push((step, e));
            Ok(())
        }
        Err(e) => Err(e),
    }
}
