//! Error types shared by the lifecycle, content and world managers

use std::path::PathBuf;

use crate::fetch::FetchError;
use crate::runtime::RuntimeError;

/// Result alias used across the library
pub type Result<T> = std::result::Result<T, ManagerError>;

/// Coarse classification of every failure the managers report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Instance, world, package or archive absent
    NotFound,
    /// Duplicate name, port in use, already running, lock held
    Conflict,
    /// Container runtime, network or local I/O failed
    ExternalFailure,
    /// Archive unreadable, metadata inconsistent with the filesystem
    CorruptState,
    /// Operation not allowed in the current state or with these arguments
    PreconditionFailed,
}

impl ErrorKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::NotFound => "NotFound",
            Self::Conflict => "Conflict",
            Self::ExternalFailure => "ExternalFailure",
            Self::CorruptState => "CorruptState",
            Self::PreconditionFailed => "PreconditionFailed",
        }
    }

    /// Process exit code the CLI uses for this kind
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::NotFound => 2,
            Self::Conflict => 3,
            Self::ExternalFailure => 4,
            Self::CorruptState => 5,
            Self::PreconditionFailed => 6,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    // === Instances ===
    #[error("instance '{0}' not found")]
    InstanceNotFound(String),

    #[error("instance '{0}' already exists")]
    DuplicateInstance(String),

    #[error("port {port} is already assigned to instance '{owner}'")]
    PortInUse { port: u16, owner: String },

    #[error("instance '{0}' is already running")]
    AlreadyRunning(String),

    #[error("instance '{0}' is running; stop it first or pass --force")]
    InstanceRunning(String),

    #[error("invalid {what} '{value}': {reason}")]
    InvalidArgument {
        what: &'static str,
        value: String,
        reason: String,
    },

    #[error("instance '{name}' metadata is inconsistent: {reason}")]
    CorruptRecord { name: String, reason: String },

    #[error("'{scope}' is busy with another operation")]
    Busy { scope: String },

    // === Content packages ===
    #[error("package '{package}' not found in instance '{instance}'")]
    PackageNotFound { instance: String, package: String },

    #[error("package '{package}' is already installed in instance '{instance}'")]
    PackageAlreadyInstalled { instance: String, package: String },

    // === Worlds ===
    #[error("world '{world}' not found in instance '{instance}'")]
    WorldNotFound { instance: String, world: String },

    #[error("world '{world}' already exists in instance '{instance}'")]
    WorldAlreadyExists { instance: String, world: String },

    #[error("archive not found: {0}")]
    ArchiveNotFound(PathBuf),

    #[error("cannot unpack '{source_name}': {reason}")]
    Unpack { source_name: String, reason: String },

    #[error("archive {path} is corrupt: {reason}")]
    CorruptArchive { path: PathBuf, reason: String },

    #[error("cannot archive {path}: {reason}")]
    Unarchivable { path: PathBuf, reason: String },

    // === External collaborators ===
    #[error("container runtime failed for instance '{instance}': {source}")]
    Runtime {
        instance: String,
        #[source]
        source: RuntimeError,
    },

    #[error("failed to fetch {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },

    #[error("metadata store error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ManagerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InstanceNotFound(_)
            | Self::PackageNotFound { .. }
            | Self::WorldNotFound { .. }
            | Self::ArchiveNotFound(_) => ErrorKind::NotFound,
            Self::DuplicateInstance(_)
            | Self::PortInUse { .. }
            | Self::AlreadyRunning(_)
            | Self::Busy { .. }
            | Self::PackageAlreadyInstalled { .. }
            | Self::WorldAlreadyExists { .. } => ErrorKind::Conflict,
            Self::Runtime { .. } | Self::Fetch { .. } | Self::Storage(_) | Self::Io { .. } => {
                ErrorKind::ExternalFailure
            }
            Self::Unpack { .. }
            | Self::CorruptArchive { .. }
            | Self::Unarchivable { .. }
            | Self::CorruptRecord { .. }
            | Self::Serialization(_) => ErrorKind::CorruptState,
            Self::InstanceRunning(_) | Self::InvalidArgument { .. } => {
                ErrorKind::PreconditionFailed
            }
        }
    }

    pub fn runtime(instance: &str, source: RuntimeError) -> Self {
        Self::Runtime {
            instance: instance.to_string(),
            source,
        }
    }

    pub fn invalid(what: &'static str, value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            what,
            value: value.into(),
            reason: reason.into(),
        }
    }

    pub fn unpack(source_name: impl Into<String>, reason: impl ToString) -> Self {
        Self::Unpack {
            source_name: source_name.into(),
            reason: reason.to_string(),
        }
    }
}

/// Attach a path to a raw I/O error
pub trait IoContext<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| ManagerError::Io {
            path: path.into(),
            source,
        })
    }
}
