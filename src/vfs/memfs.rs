//! In-memory filesystem with username/password gating, enough for the
//! demo binary and the test suite.

use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::sync::Arc;

use chrono::{DateTime, Local};
use parking_lot::RwLock;

use super::{Credentials, FileInfo, Filesystem, FilesystemAccess, NodeKind, VfsError, VfsResult};
use crate::interfaces::ByteSink;

enum Node {
    File {
        data: Vec<u8>,
        mtime: DateTime<Local>,
    },
    Dir {
        entries: BTreeMap<String, Node>,
        mtime: DateTime<Local>,
    },
}

impl Node {
    fn dir() -> Node {
        Node::Dir {
            entries: BTreeMap::new(),
            mtime: Local::now(),
        }
    }

    fn kind(&self) -> NodeKind {
        match self {
            Node::File { .. } => NodeKind::File,
            Node::Dir { .. } => NodeKind::Dir,
        }
    }

    fn info(&self, name: &str) -> FileInfo {
        let mut info = FileInfo::new(self.kind(), name);
        info.owner_name = "root".to_string();
        info.group_name = "root".to_string();
        match self {
            Node::File { data, mtime } => {
                info.size = Some(data.len() as u64);
                info.mtime = Some(*mtime);
            }
            Node::Dir { entries, mtime } => {
                info.size = Some(entries.len() as u64);
                info.mtime = Some(*mtime);
            }
        }
        info
    }
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty() && *s != ".").collect()
}

pub struct MemoryFilesystem {
    root: RwLock<Node>,
}

impl MemoryFilesystem {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryFilesystem {
            root: RwLock::new(Node::dir()),
        })
    }

    /// Test/demo convenience: create a file, making parent directories.
    pub fn put(&self, path: &str, data: &[u8]) {
        let mut root = self.root.write();
        let segs = segments(path);
        let (name, dirs) = segs.split_last().expect("path must not be root");
        let mut node = &mut *root;
        for dir in dirs {
            let Node::Dir { entries, .. } = node else {
                panic!("not a directory: {}", dir);
            };
            node = entries.entry(dir.to_string()).or_insert_with(Node::dir);
        }
        let Node::Dir { entries, .. } = node else {
            panic!("not a directory");
        };
        entries.insert(
            name.to_string(),
            Node::File {
                data: data.to_vec(),
                mtime: Local::now(),
            },
        );
    }

    pub fn mkdirs(&self, path: &str) {
        let mut root = self.root.write();
        let mut node = &mut *root;
        for dir in segments(path) {
            let Node::Dir { entries, .. } = node else {
                panic!("not a directory: {}", dir);
            };
            node = entries.entry(dir.to_string()).or_insert_with(Node::dir);
        }
    }

    /// Test convenience: read a file's full content.
    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        let root = self.root.read();
        match find(&root, path) {
            Some(Node::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    fn with_node<T>(&self, path: &str, f: impl FnOnce(&Node) -> VfsResult<T>) -> VfsResult<T> {
        let root = self.root.read();
        match find(&root, path) {
            Some(node) => f(node),
            None => Err(VfsError::NotFound(path.to_string())),
        }
    }
}

fn find<'a>(root: &'a Node, path: &str) -> Option<&'a Node> {
    let mut node = root;
    for seg in segments(path) {
        match node {
            Node::Dir { entries, .. } => node = entries.get(seg)?,
            Node::File { .. } => return None,
        }
    }
    Some(node)
}

fn find_mut<'a>(root: &'a mut Node, path: &str) -> Option<&'a mut Node> {
    let mut node = root;
    for seg in segments(path) {
        match node {
            Node::Dir { entries, .. } => node = entries.get_mut(seg)?,
            Node::File { .. } => return None,
        }
    }
    Some(node)
}

/// Splits `path` into (parent directory node, entry name).
fn find_parent<'a>(root: &'a mut Node, path: &str) -> VfsResult<(&'a mut BTreeMap<String, Node>, String)> {
    let segs = segments(path);
    let Some((name, dirs)) = segs.split_last() else {
        return Err(VfsError::PermissionDenied("/".to_string()));
    };
    let mut node = root;
    for dir in dirs {
        match node {
            Node::Dir { entries, .. } => match entries.get_mut(*dir) {
                Some(next) => node = next,
                None => return Err(VfsError::NotFound(path.to_string())),
            },
            Node::File { .. } => return Err(VfsError::NotADirectory(path.to_string())),
        }
    }
    match node {
        Node::Dir { entries, .. } => Ok((entries, name.to_string())),
        Node::File { .. } => Err(VfsError::NotADirectory(path.to_string())),
    }
}

impl Filesystem for MemoryFilesystem {
    fn kind(&self, path: &str) -> Option<NodeKind> {
        let root = self.root.read();
        find(&root, path).map(|n| n.kind())
    }

    fn readfile(
        &self,
        path: &str,
        out: &mut dyn ByteSink,
        start: u64,
        end: Option<u64>,
    ) -> VfsResult<()> {
        self.with_node(path, |node| match node {
            Node::File { data, .. } => {
                let len = data.len() as u64;
                let start = start.min(len) as usize;
                let end = end.unwrap_or(len).min(len) as usize;
                if start < end {
                    out.write_bytes(&data[start..end])?;
                }
                Ok(())
            }
            Node::Dir { .. } => Err(VfsError::IsADirectory(path.to_string())),
        })
    }

    fn writefile(
        &self,
        path: &str,
        input: &mut dyn Read,
        start: Option<u64>,
        end: Option<u64>,
        append: bool,
    ) -> VfsResult<()> {
        let mut incoming = Vec::new();
        input.read_to_end(&mut incoming)?;
        if let Some(end) = end {
            let window = end.saturating_sub(start.unwrap_or(0)) as usize;
            incoming.truncate(window);
        }

        let mut root = self.root.write();
        let (entries, name) = find_parent(&mut root, path)?;
        match entries.get_mut(&name) {
            Some(Node::Dir { .. }) => return Err(VfsError::IsADirectory(path.to_string())),
            Some(Node::File { data, mtime }) => {
                if append {
                    data.extend_from_slice(&incoming);
                } else {
                    let at = start.unwrap_or(0) as usize;
                    if at > data.len() {
                        data.resize(at, 0);
                    }
                    data.truncate(at);
                    data.extend_from_slice(&incoming);
                }
                *mtime = Local::now();
            }
            None => {
                entries.insert(
                    name,
                    Node::File {
                        data: incoming,
                        mtime: Local::now(),
                    },
                );
            }
        }
        Ok(())
    }

    fn writable(&self, path: &str) -> bool {
        let root = self.root.read();
        match find(&root, path) {
            Some(Node::File { .. }) => true,
            Some(Node::Dir { .. }) => false,
            // Writable if the parent directory exists.
            None => {
                let segs = segments(path);
                match segs.split_last() {
                    Some((_, dirs)) => {
                        let parent = dirs.join("/");
                        matches!(find(&root, &parent), Some(Node::Dir { .. }))
                    }
                    None => false,
                }
            }
        }
    }

    fn names(&self, path: &str) -> VfsResult<Vec<String>> {
        self.with_node(path, |node| match node {
            Node::Dir { entries, .. } => Ok(entries.keys().cloned().collect()),
            Node::File { .. } => Err(VfsError::NotADirectory(path.to_string())),
        })
    }

    fn ls(&self, path: &str) -> VfsResult<Vec<FileInfo>> {
        self.with_node(path, |node| match node {
            Node::Dir { entries, .. } => {
                Ok(entries.iter().map(|(name, n)| n.info(name)).collect())
            }
            Node::File { .. } => Err(VfsError::NotADirectory(path.to_string())),
        })
    }

    fn lsinfo(&self, path: &str) -> VfsResult<FileInfo> {
        let name = segments(path).last().map(|s| s.to_string()).unwrap_or_else(|| "/".to_string());
        self.with_node(path, |node| Ok(node.info(&name)))
    }

    fn mtime(&self, path: &str) -> VfsResult<Option<DateTime<Local>>> {
        self.with_node(path, |node| match node {
            Node::File { mtime, .. } | Node::Dir { mtime, .. } => Ok(Some(*mtime)),
        })
    }

    fn size(&self, path: &str) -> VfsResult<u64> {
        self.with_node(path, |node| match node {
            Node::File { data, .. } => Ok(data.len() as u64),
            Node::Dir { .. } => Err(VfsError::IsADirectory(path.to_string())),
        })
    }

    fn mkdir(&self, path: &str) -> VfsResult<()> {
        let mut root = self.root.write();
        let (entries, name) = find_parent(&mut root, path)?;
        if entries.contains_key(&name) {
            return Err(VfsError::AlreadyExists(path.to_string()));
        }
        entries.insert(name, Node::dir());
        Ok(())
    }

    fn remove(&self, path: &str) -> VfsResult<()> {
        let mut root = self.root.write();
        let (entries, name) = find_parent(&mut root, path)?;
        match entries.get(&name) {
            Some(Node::File { .. }) => {
                entries.remove(&name);
                Ok(())
            }
            Some(Node::Dir { .. }) => Err(VfsError::IsADirectory(path.to_string())),
            None => Err(VfsError::NotFound(path.to_string())),
        }
    }

    fn rmdir(&self, path: &str) -> VfsResult<()> {
        let mut root = self.root.write();
        let (entries, name) = find_parent(&mut root, path)?;
        match entries.get(&name) {
            Some(Node::Dir { entries: inner, .. }) => {
                if !inner.is_empty() {
                    return Err(VfsError::PermissionDenied(path.to_string()));
                }
                entries.remove(&name);
                Ok(())
            }
            Some(Node::File { .. }) => Err(VfsError::NotADirectory(path.to_string())),
            None => Err(VfsError::NotFound(path.to_string())),
        }
    }

    fn rename(&self, old: &str, new: &str) -> VfsResult<()> {
        let mut root = self.root.write();
        // Verify the destination's parent before detaching the source.
        find_parent(&mut root, new)?;
        let node = {
            let (entries, name) = find_parent(&mut root, old)?;
            match entries.remove(&name) {
                Some(node) => node,
                None => return Err(VfsError::NotFound(old.to_string())),
            }
        };
        let (entries, name) =
            find_parent(&mut root, new).expect("destination parent verified above");
        entries.insert(name, node);
        Ok(())
    }
}

/// Username/password table in front of a shared [`MemoryFilesystem`].
pub struct MemfsAccess {
    fs: Arc<MemoryFilesystem>,
    users: HashMap<String, String>,
}

impl MemfsAccess {
    pub fn new(fs: Arc<MemoryFilesystem>) -> Self {
        MemfsAccess {
            fs,
            users: HashMap::new(),
        }
    }

    pub fn with_user(mut self, username: &str, password: &str) -> Self {
        self.users.insert(username.to_string(), password.to_string());
        self
    }
}

impl FilesystemAccess for MemfsAccess {
    fn authenticate(&self, credentials: &Credentials) -> VfsResult<()> {
        match self.users.get(&credentials.username) {
            Some(password) if *password == credentials.password => Ok(()),
            _ => Err(VfsError::Unauthorized),
        }
    }

    fn open(&self, credentials: Option<&Credentials>) -> VfsResult<Arc<dyn Filesystem>> {
        match credentials {
            Some(credentials) => {
                self.authenticate(credentials)?;
                Ok(Arc::clone(&self.fs) as Arc<dyn Filesystem>)
            }
            None => Err(VfsError::Unauthorized),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fs() -> Arc<MemoryFilesystem> {
        let fs = MemoryFilesystem::new();
        fs.mkdirs("/test");
        fs.put("/test/existing.txt", b"root initial data");
        fs
    }

    #[test]
    fn kind_and_size() {
        let fs = fs();
        assert_eq!(fs.kind("/test"), Some(NodeKind::Dir));
        assert_eq!(fs.kind("/test/existing.txt"), Some(NodeKind::File));
        assert_eq!(fs.kind("/nope"), None);
        assert_eq!(fs.size("/test/existing.txt").unwrap(), 17);
    }

    #[test]
    fn readfile_honors_start_offset() {
        let fs = fs();
        let mut out = Vec::new();
        fs.readfile("/test/existing.txt", &mut out, 1, None).unwrap();
        assert_eq!(out, b"oot initial data");
    }

    #[test]
    fn writefile_create_overwrite_append() {
        let fs = fs();
        fs.writefile("/test/new.txt", &mut &b"hello"[..], None, None, false)
            .unwrap();
        assert_eq!(fs.contents("/test/new.txt").unwrap(), b"hello");

        fs.writefile("/test/new.txt", &mut &b" more"[..], None, None, true)
            .unwrap();
        assert_eq!(fs.contents("/test/new.txt").unwrap(), b"hello more");

        fs.writefile("/test/new.txt", &mut &b"X"[..], Some(2), None, false)
            .unwrap();
        assert_eq!(fs.contents("/test/new.txt").unwrap(), b"heX");
    }

    #[test]
    fn writable_for_new_files_needs_a_parent_dir() {
        let fs = fs();
        assert!(fs.writable("/test/brand-new"));
        assert!(fs.writable("/test/existing.txt"));
        assert!(!fs.writable("/missing/file"));
        assert!(!fs.writable("/test"));
    }

    #[test]
    fn rename_moves_nodes() {
        let fs = fs();
        fs.rename("/test/existing.txt", "/test/renamed.txt").unwrap();
        assert_eq!(fs.kind("/test/existing.txt"), None);
        assert_eq!(
            fs.contents("/test/renamed.txt").unwrap(),
            b"root initial data"
        );
    }

    #[test]
    fn mkdir_rmdir_remove() {
        let fs = fs();
        fs.mkdir("/test/sub").unwrap();
        assert_eq!(fs.kind("/test/sub"), Some(NodeKind::Dir));
        assert!(matches!(
            fs.mkdir("/test/sub"),
            Err(VfsError::AlreadyExists(_))
        ));
        fs.rmdir("/test/sub").unwrap();
        fs.remove("/test/existing.txt").unwrap();
        assert_eq!(fs.names("/test").unwrap().len(), 0);
    }

    #[test]
    fn access_checks_credentials() {
        let access = MemfsAccess::new(fs()).with_user("foo", "bar");
        let good = Credentials {
            username: "foo".to_string(),
            password: "bar".to_string(),
        };
        let bad = Credentials {
            username: "foo".to_string(),
            password: "wrong".to_string(),
        };
        assert!(access.authenticate(&good).is_ok());
        assert!(matches!(
            access.authenticate(&bad),
            Err(VfsError::Unauthorized)
        ));
        assert!(access.open(Some(&good)).is_ok());
        assert!(access.open(None).is_err());
    }
}
