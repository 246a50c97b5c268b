//! The virtual filesystem contract consumed by the FTP server, plus the
//! authenticated-access seam in front of it. Implementations live with
//! the embedding application; [`memfs`] provides the in-memory one used
//! by the demo binary and the tests.

pub mod memfs;

use std::io::{self, Read};

use chrono::{DateTime, Local};

use crate::interfaces::ByteSink;

#[derive(Debug, thiserror::Error)]
pub enum VfsError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("no such file or directory: {0}")]
    NotFound(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("is a directory: {0}")]
    IsADirectory(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type VfsResult<T> = Result<T, VfsError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Dir,
}

/// One directory entry, shaped for `ls -l` emulation.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub kind: NodeKind,
    pub name: String,
    pub size: Option<u64>,
    pub mtime: Option<DateTime<Local>>,
    pub nlinks: u32,
    pub owner_name: String,
    pub group_name: String,
    pub owner_readable: bool,
    pub owner_writable: bool,
    pub owner_executable: bool,
    pub group_readable: bool,
    pub group_writable: bool,
    pub group_executable: bool,
    pub other_readable: bool,
    pub other_writable: bool,
    pub other_executable: bool,
}

impl FileInfo {
    pub fn new(kind: NodeKind, name: &str) -> Self {
        let executable = matches!(kind, NodeKind::Dir);
        FileInfo {
            kind,
            name: name.to_string(),
            size: None,
            mtime: None,
            nlinks: 1,
            owner_name: "na".to_string(),
            group_name: "na".to_string(),
            owner_readable: true,
            owner_writable: true,
            owner_executable: executable,
            group_readable: true,
            group_writable: true,
            group_executable: executable,
            other_readable: false,
            other_writable: false,
            other_executable: executable,
        }
    }
}

/// Filesystem operations the FTP channel performs. All paths are POSIX
/// paths; implementations must not keep per-connection state.
pub trait Filesystem: Send + Sync {
    /// What lives at `path`, if anything.
    fn kind(&self, path: &str) -> Option<NodeKind>;

    /// Streams `path`'s content into `out`, starting at byte `start`,
    /// stopping before `end` when given.
    fn readfile(
        &self,
        path: &str,
        out: &mut dyn ByteSink,
        start: u64,
        end: Option<u64>,
    ) -> VfsResult<()>;

    /// Writes `input` to `path`. `start` positions the write inside an
    /// existing file; `append` adds to the end instead.
    fn writefile(
        &self,
        path: &str,
        input: &mut dyn Read,
        start: Option<u64>,
        end: Option<u64>,
        append: bool,
    ) -> VfsResult<()>;

    /// Whether `path` could be written, without opening it.
    fn writable(&self, path: &str) -> bool;

    fn names(&self, path: &str) -> VfsResult<Vec<String>>;

    fn ls(&self, path: &str) -> VfsResult<Vec<FileInfo>>;

    fn lsinfo(&self, path: &str) -> VfsResult<FileInfo>;

    fn mtime(&self, path: &str) -> VfsResult<Option<DateTime<Local>>>;

    fn size(&self, path: &str) -> VfsResult<u64>;

    fn mkdir(&self, path: &str) -> VfsResult<()>;

    fn remove(&self, path: &str) -> VfsResult<()>;

    fn rmdir(&self, path: &str) -> VfsResult<()>;

    fn rename(&self, old: &str, new: &str) -> VfsResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Authenticated access to a filesystem. `authenticate` gates the login;
/// `open` returns the filesystem view for those credentials.
pub trait FilesystemAccess: Send + Sync {
    fn authenticate(&self, credentials: &Credentials) -> VfsResult<()>;

    fn open(&self, credentials: Option<&Credentials>) -> VfsResult<std::sync::Arc<dyn Filesystem>>;
}
