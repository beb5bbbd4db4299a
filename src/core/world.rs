//! Worlds inside an instance, plus their backup archives

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, SubsecRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::archive::{self, ArchiveBuilder, ArchiveError};
use super::instance::validate_name;
use super::layout::{dir_size, list_subdirs, InstanceLocator, InstancePaths};
use super::lock::ScopedLock;
use super::settings::Settings;
use crate::error::{IoContext, ManagerError, Result};

/// Manifest file at the root of every world directory
pub const WORLD_MANIFEST: &str = "world.json";

/// Archive entry describing a backup
pub const BACKUP_MANIFEST: &str = "fim-backup.json";

const BACKUP_EXTENSION: &str = "zip";
const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%.3fZ";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct WorldManifest {
    id: Option<String>,
    title: Option<String>,
    system: Option<String>,
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BackupManifest {
    world: String,
    created_at: DateTime<Utc>,
    /// Entries in the archive, not counting this manifest
    entries: usize,
}

/// One world directory. Fields read from the manifest are `None` when the
/// manifest is missing or unreadable, with the reason in `manifest_error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct World {
    pub name: String,
    pub title: Option<String>,
    pub system: Option<String>,
    pub description: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub path: PathBuf,
    pub size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_error: Option<String>,
}

/// An immutable backup file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupArchive {
    pub path: PathBuf,
    pub world: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
}

pub struct WorldManager {
    locator: Arc<dyn InstanceLocator>,
    settings: Settings,
}

impl WorldManager {
    pub fn new(locator: Arc<dyn InstanceLocator>, settings: Settings) -> Self {
        Self { locator, settings }
    }

    pub fn create(
        &self,
        instance: &str,
        world: &str,
        system: &str,
        description: Option<&str>,
    ) -> Result<World> {
        validate_name("world name", world)?;
        validate_name("system id", system)?;
        let _lock = self.lock(instance)?;
        let paths = self.locator.locate(instance)?;

        let dir = paths.world_dir(world);
        match std::fs::create_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(ManagerError::WorldAlreadyExists {
                    instance: instance.to_string(),
                    world: world.to_string(),
                })
            }
            Err(e) => return Err(e).at(&dir),
        }

        let manifest = WorldManifest {
            id: Some(world.to_string()),
            title: Some(world.to_string()),
            system: Some(system.to_string()),
            description: description.map(str::to_string),
            created_at: Some(Utc::now()),
        };
        let manifest_path = dir.join(WORLD_MANIFEST);
        let written = serde_json::to_vec_pretty(&manifest)
            .map_err(ManagerError::from)
            .and_then(|bytes| std::fs::write(&manifest_path, bytes).at(&manifest_path));
        if let Err(e) = written {
            let _ = std::fs::remove_dir_all(&dir);
            return Err(e);
        }

        info!("Created world '{}' in instance '{}'", world, instance);
        Ok(read_world(world.to_string(), dir))
    }

    /// Every world directory; unreadable manifests yield partial records
    pub fn list(&self, instance: &str) -> Result<Vec<World>> {
        let paths = self.locator.locate(instance)?;
        Ok(list_subdirs(&paths.worlds)?
            .into_iter()
            .map(|(name, dir)| read_world(name, dir))
            .collect())
    }

    pub fn info(&self, instance: &str, world: &str) -> Result<World> {
        let paths = self.locator.locate(instance)?;
        let dir = existing_world(instance, &paths, world)?;
        Ok(read_world(world.to_string(), dir))
    }

    /// Archive the whole world directory into a new timestamped file
    pub fn backup(&self, instance: &str, world: &str) -> Result<BackupArchive> {
        let _lock = self.lock(instance)?;
        let paths = self.locator.locate(instance)?;
        let dir = existing_world(instance, &paths, world)?;
        let backups = &paths.world_backups;

        // File names carry millisecond precision
        let mut created_at = Utc::now().trunc_subsecs(3);
        let mut target = backups.join(backup_file_name(world, &created_at));
        while target.exists() {
            created_at += TimeDelta::milliseconds(1);
            target = backups.join(backup_file_name(world, &created_at));
        }
        let staging = backups.join(format!(".{}.partial", backup_file_name(world, &created_at)));

        let written = write_backup(&dir, world, created_at, &staging)
            .and_then(|entries| std::fs::rename(&staging, &target).at(&target).map(|_| entries));
        let entries = match written {
            Ok(entries) => entries,
            Err(e) => {
                if let Err(cleanup) = std::fs::remove_file(&staging) {
                    if cleanup.kind() != std::io::ErrorKind::NotFound {
                        warn!("Failed to remove partial backup {:?}: {}", staging, cleanup);
                    }
                }
                return Err(e);
            }
        };

        let size_bytes = std::fs::metadata(&target).at(&target)?.len();
        info!(
            "Backed up world '{}' of instance '{}' to {:?} ({} entries, {} bytes)",
            world, instance, target, entries, size_bytes
        );
        Ok(BackupArchive {
            path: target,
            world: world.to_string(),
            created_at,
            size_bytes,
        })
    }

    /// Replace the world recorded in `archive_path` with the archive's content.
    ///
    /// The restore is unpacked beside the live world and swapped in only after
    /// every entry has been verified, so a failed restore leaves the old world.
    pub fn restore(&self, instance: &str, archive_path: &Path) -> Result<World> {
        let _lock = self.lock(instance)?;
        let paths = self.locator.locate(instance)?;
        if !archive_path.is_file() {
            return Err(ManagerError::ArchiveNotFound(archive_path.to_path_buf()));
        }

        let corrupt = |reason: String| ManagerError::CorruptArchive {
            path: archive_path.to_path_buf(),
            reason,
        };

        let file = File::open(archive_path).at(archive_path)?;
        let mut zip = archive::open(BufReader::new(file)).map_err(|e| corrupt(e.to_string()))?;

        let (world, expected_entries) = match archive::read_entry(&mut zip, BACKUP_MANIFEST)
            .map_err(|e| corrupt(e.to_string()))?
        {
            Some(bytes) => {
                let manifest: BackupManifest = serde_json::from_slice(&bytes)
                    .map_err(|e| corrupt(format!("unreadable {}: {}", BACKUP_MANIFEST, e)))?;
                (manifest.world, Some(manifest.entries))
            }
            None => (legacy_world_name(&mut zip, archive_path)?, None),
        };
        validate_name("world name", &world)
            .map_err(|e| ManagerError::unpack(archive_path.display().to_string(), e))?;

        if let Some(expected) = expected_entries {
            let found = zip.len().saturating_sub(1);
            if found != expected {
                return Err(corrupt(format!(
                    "expected {} entries, found {}; the backup is incomplete",
                    expected, found
                )));
            }
        }

        let token = Uuid::new_v4().simple().to_string();
        let staging = paths.worlds.join(format!(".{}.restore-{}", world, token));

        let extracted = archive::extract(&mut zip, &staging, Some(&world), &[BACKUP_MANIFEST]);
        if let Err(e) = extracted {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(match e {
                ArchiveError::Corrupt(reason) => corrupt(reason),
                ArchiveError::UnsafePath(entry) => ManagerError::unpack(
                    archive_path.display().to_string(),
                    format!("entry '{}' escapes the world directory", entry),
                ),
                ArchiveError::Unsupported { path, reason } => ManagerError::unpack(
                    archive_path.display().to_string(),
                    format!("{}: {}", path.display(), reason),
                ),
                ArchiveError::Io { path, source } => ManagerError::Io { path, source },
            });
        }

        let target = paths.world_dir(&world);
        swap_in(&staging, &target, &paths.worlds.join(format!(".{}.old-{}", world, token)))?;

        info!(
            "Restored world '{}' of instance '{}' from {:?}",
            world, instance, archive_path
        );
        Ok(read_world(world, target))
    }

    /// Delete a world directory; its backups are kept
    pub fn remove(&self, instance: &str, world: &str) -> Result<()> {
        let _lock = self.lock(instance)?;
        let paths = self.locator.locate(instance)?;
        let dir = existing_world(instance, &paths, world)?;
        std::fs::remove_dir_all(&dir).at(&dir)?;
        info!("Removed world '{}' from instance '{}'", world, instance);
        Ok(())
    }

    /// Backups of one world, or of every world, oldest first
    pub fn list_backups(&self, instance: &str, world: Option<&str>) -> Result<Vec<BackupArchive>> {
        let paths = self.locator.locate(instance)?;
        let dir = &paths.world_backups;
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut result = Vec::new();
        for entry in std::fs::read_dir(dir).at(dir)? {
            let entry = entry.at(dir)?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            if file_name.starts_with('.') || !entry.file_type().at(entry.path())?.is_file() {
                continue;
            }
            let Some((name, created_at)) = parse_backup_file_name(&file_name) else {
                debug!("Ignoring unrecognised file {:?} in backups", file_name);
                continue;
            };
            if world.is_some_and(|w| w != name) {
                continue;
            }
            result.push(BackupArchive {
                size_bytes: entry.metadata().at(entry.path())?.len(),
                path: entry.path(),
                world: name,
                created_at,
            });
        }
        result.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.world.cmp(&b.world)));
        Ok(result)
    }

    /// Writers hold the instance lock so a concurrent delete cannot leave
    /// directories behind without a record
    fn lock(&self, instance: &str) -> Result<ScopedLock> {
        ScopedLock::instance(self.locator.scope(), instance, self.settings.lock_timeout())
    }
}

fn existing_world(instance: &str, paths: &InstancePaths, world: &str) -> Result<PathBuf> {
    let not_found = || ManagerError::WorldNotFound {
        instance: instance.to_string(),
        world: world.to_string(),
    };
    validate_name("world name", world).map_err(|_| not_found())?;
    let dir = paths.world_dir(world);
    if dir.is_dir() {
        Ok(dir)
    } else {
        Err(not_found())
    }
}

fn read_world(name: String, path: PathBuf) -> World {
    let size_bytes = dir_size(&path).unwrap_or_else(|e| {
        warn!("Cannot size world {:?}: {}", path, e);
        0
    });
    let manifest_path = path.join(WORLD_MANIFEST);
    let (manifest, manifest_error) = match std::fs::read(&manifest_path) {
        Ok(bytes) => match serde_json::from_slice::<WorldManifest>(&bytes) {
            Ok(manifest) => (manifest, None),
            Err(e) => (WorldManifest::default(), Some(format!("invalid manifest: {}", e))),
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            (WorldManifest::default(), Some("manifest missing".to_string()))
        }
        Err(e) => (WorldManifest::default(), Some(e.to_string())),
    };

    World {
        name,
        title: manifest.title,
        system: manifest.system,
        description: manifest.description,
        created_at: manifest.created_at,
        path,
        size_bytes,
        manifest_error,
    }
}

fn backup_file_name(world: &str, created_at: &DateTime<Utc>) -> String {
    format!(
        "{}_{}.{}",
        world,
        created_at.format(TIMESTAMP_FORMAT),
        BACKUP_EXTENSION
    )
}

/// Split `<world>_<timestamp>.zip`; world names may themselves contain `_`
fn parse_backup_file_name(file_name: &str) -> Option<(String, DateTime<Utc>)> {
    let stem = file_name.strip_suffix(&format!(".{}", BACKUP_EXTENSION))?;
    let (world, stamp) = stem.rsplit_once('_')?;
    let created_at = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT)
        .ok()?
        .and_utc();
    if world.is_empty() {
        return None;
    }
    Some((world.to_string(), created_at))
}

/// Write the archive to `staging` and flush it to disk; returns the entry count
fn write_backup(
    dir: &Path,
    world: &str,
    created_at: DateTime<Utc>,
    staging: &Path,
) -> Result<usize> {
    let failure = |e: ArchiveError| match e {
        ArchiveError::Io { path, source } => ManagerError::Io { path, source },
        ArchiveError::Unsupported { path, reason } => ManagerError::Unarchivable { path, reason },
        other => ManagerError::CorruptArchive {
            path: staging.to_path_buf(),
            reason: other.to_string(),
        },
    };

    let file = File::create(staging).at(staging)?;
    let mut builder = ArchiveBuilder::new(BufWriter::new(file));
    builder.add_dir(dir, world).map_err(failure)?;

    let entries = builder.entries();
    let manifest = BackupManifest {
        world: world.to_string(),
        created_at,
        entries,
    };
    builder
        .add_bytes(BACKUP_MANIFEST, &serde_json::to_vec_pretty(&manifest)?)
        .map_err(failure)?;

    let writer = builder.finish().map_err(failure)?;
    let file = writer
        .into_inner()
        .map_err(|e| ManagerError::Io {
            path: staging.to_path_buf(),
            source: e.into_error(),
        })?;
    file.sync_all().at(staging)?;
    Ok(entries)
}

/// Archives without a manifest are accepted when they wrap exactly one world
fn legacy_world_name<R: std::io::Read + std::io::Seek>(
    zip: &mut zip::ZipArchive<R>,
    archive_path: &Path,
) -> Result<String> {
    let unpack = |reason: &str| ManagerError::unpack(archive_path.display().to_string(), reason);
    let root = archive::common_root(zip)
        .ok_or_else(|| unpack("no backup manifest and no single world directory"))?;
    let manifest = archive::read_entry(zip, &format!("{}/{}", root, WORLD_MANIFEST))
        .map_err(|e| ManagerError::CorruptArchive {
            path: archive_path.to_path_buf(),
            reason: e.to_string(),
        })?;
    if manifest.is_none() {
        return Err(unpack("no backup manifest and no world manifest"));
    }
    warn!(
        "{:?} has no {}; restoring it as world '{}'",
        archive_path, BACKUP_MANIFEST, root
    );
    Ok(root)
}

/// Move `staging` to `target`, parking any existing world at `parked` until
/// the swap has succeeded
fn swap_in(staging: &Path, target: &Path, parked: &Path) -> Result<()> {
    if !target.exists() {
        return std::fs::rename(staging, target).at(target);
    }

    if let Err(e) = std::fs::rename(target, parked) {
        let _ = std::fs::remove_dir_all(staging);
        return Err(e).at(target);
    }
    if let Err(e) = std::fs::rename(staging, target) {
        if let Err(rollback) = std::fs::rename(parked, target) {
            warn!(
                "Could not put {:?} back after a failed restore: {}",
                parked, rollback
            );
        }
        let _ = std::fs::remove_dir_all(staging);
        return Err(e).at(target);
    }
    if let Err(e) = std::fs::remove_dir_all(parked) {
        warn!("Failed to remove replaced world {:?}: {}", parked, e);
    }
    Ok(())
}
