//! Common test infrastructure: in-process fakes for the container runtime and
//! the network fetcher, plus a temporary store and base directory.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use sha2::{Digest, Sha256};
use tempfile::TempDir;

use foundry_instance_manager::core::archive::ArchiveBuilder;
use foundry_instance_manager::core::{
    ContentManager, InstanceConfig, InstanceManager, Settings, WorldManager,
};
use foundry_instance_manager::fetch::{FetchError, Fetcher};
use foundry_instance_manager::persistence::Database;
use foundry_instance_manager::runtime::{
    ContainerRef, ContainerRuntime, ContainerSpec, ContainerState, RuntimeError, RuntimeResult,
};

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub spec: ContainerSpec,
    pub running: bool,
}

#[derive(Default)]
struct FakeState {
    containers: HashMap<String, FakeContainer>,
    unreachable: bool,
    exit_on_start: bool,
    calls: Vec<String>,
}

/// Container runtime kept entirely in memory
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every call fails as if the daemon were down
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unwrap().unreachable = unreachable;
    }

    /// Containers stop immediately after `start`
    pub fn set_exit_on_start(&self, exit: bool) {
        self.state.lock().unwrap().exit_on_start = exit;
    }

    /// Simulate `docker rm -f` run by someone else
    pub fn remove_externally(&self, name: &str) {
        self.state.lock().unwrap().containers.remove(name);
    }

    /// Simulate the container dying on its own
    pub fn stop_externally(&self, name: &str) {
        if let Some(c) = self.state.lock().unwrap().containers.get_mut(name) {
            c.running = false;
        }
    }

    pub fn container(&self, name: &str) -> Option<FakeContainer> {
        self.state.lock().unwrap().containers.get(name).cloned()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.container(name).is_some_and(|c| c.running)
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    fn enter(&self, call: String) -> RuntimeResult<std::sync::MutexGuard<'_, FakeState>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        if state.unreachable {
            return Err(RuntimeError::Unavailable("fake daemon is down".to_string()));
        }
        Ok(state)
    }
}

impl ContainerRuntime for FakeRuntime {
    fn create_container(&self, spec: &ContainerSpec, _deadline: Instant) -> RuntimeResult<ContainerRef> {
        let mut state = self.enter(format!("create {}", spec.name))?;
        if state.containers.contains_key(&spec.name) {
            return Err(RuntimeError::Failed {
                operation: "create",
                reason: format!("name {} already in use", spec.name),
            });
        }
        state.containers.insert(
            spec.name.clone(),
            FakeContainer {
                spec: spec.clone(),
                running: false,
            },
        );
        Ok(ContainerRef::new(&spec.name))
    }

    fn start(&self, container: &ContainerRef, _deadline: Instant) -> RuntimeResult<()> {
        let mut state = self.enter(format!("start {}", container))?;
        let exit = state.exit_on_start;
        let c = state
            .containers
            .get_mut(container.as_str())
            .ok_or_else(|| RuntimeError::NotFound(container.to_string()))?;
        c.running = !exit;
        Ok(())
    }

    fn stop(&self, container: &ContainerRef, _deadline: Instant) -> RuntimeResult<()> {
        let mut state = self.enter(format!("stop {}", container))?;
        let c = state
            .containers
            .get_mut(container.as_str())
            .ok_or_else(|| RuntimeError::NotFound(container.to_string()))?;
        c.running = false;
        Ok(())
    }

    fn remove(&self, container: &ContainerRef, _deadline: Instant) -> RuntimeResult<()> {
        let mut state = self.enter(format!("remove {}", container))?;
        state
            .containers
            .remove(container.as_str())
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NotFound(container.to_string()))
    }

    fn inspect(&self, container: &ContainerRef, _deadline: Instant) -> RuntimeResult<ContainerState> {
        let state = self.enter(format!("inspect {}", container))?;
        state
            .containers
            .get(container.as_str())
            .map(|c| ContainerState { running: c.running })
            .ok_or_else(|| RuntimeError::NotFound(container.to_string()))
    }
}

/// Serves canned bodies; unknown URLs answer 404
#[derive(Default)]
pub struct FakeFetcher {
    bodies: Mutex<HashMap<String, Vec<u8>>>,
}

impl FakeFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, url: &str, body: Vec<u8>) {
        self.bodies.lock().unwrap().insert(url.to_string(), body);
    }
}

impl Fetcher for FakeFetcher {
    fn fetch(&self, url: &str, _deadline: Instant) -> Result<Vec<u8>, FetchError> {
        self.bodies
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or(FetchError::Status(404))
    }
}

/// A store, base directory and fakes wired into the managers
pub struct TestEnv {
    pub database: Arc<Database>,
    pub runtime: Arc<FakeRuntime>,
    pub fetcher: Arc<FakeFetcher>,
    pub settings: Settings,
    pub base_dir: PathBuf,
    _temp_dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let base_dir = temp_dir.path().join("instances");

        let database = Database::in_memory().unwrap();
        database.initialize().unwrap();

        let mut settings = Settings::default().with_base_dir(&base_dir);
        settings.lock_timeout_secs = 5;

        Self {
            database: Arc::new(database),
            runtime: FakeRuntime::new(),
            fetcher: FakeFetcher::new(),
            settings,
            base_dir,
            _temp_dir: temp_dir,
        }
    }

    pub fn manager(&self) -> InstanceManager {
        InstanceManager::new(
            self.database.clone(),
            self.runtime.clone(),
            self.settings.clone(),
        )
    }

    pub fn content(&self) -> ContentManager {
        self.manager().content(self.fetcher.clone())
    }

    pub fn worlds(&self) -> WorldManager {
        self.manager().worlds()
    }

    /// Create an instance with a fixed version on `port`
    pub fn create(&self, name: &str, port: u16) {
        self.manager()
            .create(InstanceConfig::new(name, "13.0", port))
            .unwrap();
    }

    pub fn instance_dir(&self, name: &str) -> PathBuf {
        self.base_dir.join(name)
    }

    pub fn scratch(&self) -> &Path {
        self._temp_dir.path()
    }
}

/// Hash of every relative path, file content and link target below `dir`
pub fn hash_dir(dir: &Path) -> String {
    let mut hasher = Sha256::new();
    hash_into(dir, dir, &mut hasher);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

fn hash_into(root: &Path, dir: &Path, hasher: &mut Sha256) {
    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    entries.sort();
    for path in entries {
        let relative = path.strip_prefix(root).unwrap().to_string_lossy().to_string();
        hasher.update(relative.as_bytes());
        let file_type = std::fs::symlink_metadata(&path).unwrap().file_type();
        if file_type.is_symlink() {
            hasher.update(b"->");
            hasher.update(std::fs::read_link(&path).unwrap().to_string_lossy().as_bytes());
        } else if file_type.is_dir() {
            hasher.update(b"/");
            hash_into(root, &path, hasher);
        } else {
            hasher.update(std::fs::read(&path).unwrap());
        }
    }
}

/// In-memory zip with the given files
pub fn zip_of(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = ArchiveBuilder::new(Cursor::new(Vec::new()));
    for (name, data) in files {
        builder.add_bytes(name, data).unwrap();
    }
    builder.finish().unwrap().into_inner()
}
