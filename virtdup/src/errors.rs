//! Error taxonomy for the duplication engine.
//!
//! Everything except [`DupError::Descriptor`] raised for the source domain
//! aborts only the target being processed; the orchestrator records the
//! failure and moves on to the next target name.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub type DupResult<T> = Result<T, DupError>;

/// Errors raised while duplicating a virtual machine.
#[derive(Debug, Error)]
pub enum DupError {
    /// Every slot in the bounded NBD device pool is attached elsewhere.
    #[error("no free nbd slot among {pool_size} devices")]
    NoFreeDevice { pool_size: usize },

    /// An attached device never reported a non-zero size.
    #[error("{device} not ready after {attempts} attempts")]
    StageTimeout { device: String, attempts: u32 },

    /// A detached device is still visible in the kernel table. Treated as
    /// fatal for the target: a live handle poisons every later free-slot
    /// scan.
    #[error("{device} still attached after disconnect")]
    StaleDevice { device: String },

    /// No partition matched any known root-filesystem layout, or an overlay
    /// spec could not be located.
    #[error("no recognizable guest layout on {device}")]
    UnknownLayout { device: String },

    /// A guest file the layout requires is absent.
    #[error("expected guest file missing: {}", .0.display())]
    Missing(PathBuf),

    /// An external tool exited non-zero or could not be spawned.
    #[error("{tool}: {message}")]
    Tool { tool: &'static str, message: String },

    /// The domain XML lacks a field every descriptor must carry.
    #[error("domain XML has no <{0}> element")]
    Descriptor(&'static str),

    /// mount(2)/umount(2) failure.
    #[error("mount {}: {errno}", target.display())]
    Mount {
        target: PathBuf,
        #[source]
        errno: nix::Error,
    },

    /// Filesystem I/O with path context.
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl DupError {
    /// External tool failure with its name and whatever it said.
    pub fn tool(tool: &'static str, message: impl Into<String>) -> Self {
        Self::Tool {
            tool,
            message: message.into(),
        }
    }

    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn mount(target: impl AsRef<Path>, errno: nix::Error) -> Self {
        Self::Mount {
            target: target.as_ref().to_path_buf(),
            errno,
        }
    }
}
