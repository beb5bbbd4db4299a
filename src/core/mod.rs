//! Core module - Instance records, lifecycle orchestration, content and worlds

pub mod archive;
mod bulk;
mod content;
mod instance;
pub mod layout;
mod lifecycle;
pub mod lock;
pub mod settings;
mod world;

pub use bulk::{BulkConfig, BulkInstance};
pub use content::{ContentManager, ContentPackage};
pub use instance::{
    reconcile, validate_name, Instance, InstanceConfig, InstanceStatus, Observed, Reconciled,
};
pub use layout::{FsLayout, InstanceLocator, InstancePaths};
pub use lifecycle::{DeleteReport, DeleteStep, InstanceManager};
pub use settings::{Credentials, Settings};
pub use world::{BackupArchive, World, WorldManager, BACKUP_MANIFEST, WORLD_MANIFEST};
