mod metadata;
mod snapshot;

use std::sync::{Arc, Mutex};

use buddyfs_proto::NetAddress;

use crate::error::{PosixError, PosixResult};

pub use metadata::{MetadataRecord, ingest_record, parse_metadata_list, write_full_list};
pub use snapshot::{load_local, save_local};

pub(crate) fn leaf_name(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

/// POSIX-ish metadata carried by every node, written verbatim into the
/// snapshot record (spec.md §4.7).
#[derive(Clone, Copy)]
pub struct Meta {
    pub mode: u32,
    pub mtime: u32,
    pub ctime: u32,
}

impl Meta {
    pub fn now(mode: u32) -> Self {
        let now = now_u32();
        Self { mode, mtime: now, ctime: now }
    }
}

pub(crate) fn now_u32() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// A regular file: either materialized locally (`data` holds the bytes) or
/// known only by metadata, fetched on demand from its storage clique
/// (spec.md §4.6, §4.7).
pub struct File {
    pub name: String,
    pub owner: NetAddress,
    pub size: u64,
    pub meta: Meta,
    pub version: i32,
    data: Vec<u8>,
    /// Write shadow buffer: snapshotted from `data` on open-for-write,
    /// swapped in on flush (§4.8).
    wb: Option<Vec<u8>>,
    local: bool,
    /// Cache expiry (unix seconds). Zero means "never expires"; only ever
    /// set on entries learned from a remote peer, never on locally owned
    /// files (§4.7's slice-driven cache GC).
    pub expire: u32,
    /// Set for the duration of a chunked `DATA_BLOCK` download, cleared by
    /// `finish_download` (§4.6). A reader checks this alongside `received`
    /// to know whether a byte range it wants has actually landed yet.
    downloading: bool,
    /// Bytes of `data` filled in by the download so far. Meaningless once
    /// `downloading` is false (§4.8).
    received: usize,
}

impl File {
    pub fn new_local(name: impl Into<String>, owner: NetAddress, data: Vec<u8>) -> Self {
        let size = data.len() as u64;
        Self {
            name: name.into(),
            owner,
            size,
            meta: Meta::now(0o644),
            version: 0,
            data,
            wb: None,
            local: true,
            expire: 0,
            downloading: false,
            received: 0,
        }
    }

    pub fn new_remote(name: impl Into<String>, owner: NetAddress, size: u64) -> Self {
        Self {
            name: name.into(),
            owner,
            size,
            meta: Meta::now(0o644),
            version: 0,
            data: Vec::new(),
            wb: None,
            local: false,
            expire: 0,
            downloading: false,
            received: 0,
        }
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn is_downloading(&self) -> bool {
        self.downloading
    }

    pub fn received(&self) -> usize {
        self.received
    }

    /// Starts a fresh chunked download of `size` bytes, discarding
    /// whatever content is local (spec.md §4.6).
    pub fn begin_download(&mut self, size: u64) {
        self.size = size;
        self.data.clear();
        self.downloading = true;
        self.received = 0;
    }

    pub fn open_for_write(&mut self) {
        self.wb = Some(self.data.clone());
    }

    pub fn read(&self, offset: u64, len: usize) -> &[u8] {
        let start = (offset as usize).min(self.data.len());
        let end = (start + len).min(self.data.len());
        &self.data[start..end]
    }

    /// Writes into the shadow buffer. Caller has already checked `Drm`.
    pub fn write(&mut self, offset: u64, bytes: &[u8]) {
        let wb = self.wb.get_or_insert_with(|| self.data.clone());
        let end = offset as usize + bytes.len();
        if wb.len() < end {
            wb.resize(end, 0);
        }
        wb[offset as usize..end].copy_from_slice(bytes);
    }

    /// Swaps the shadow buffer into `data`, making writes visible to reads.
    pub fn flush(&mut self) {
        if let Some(wb) = self.wb.take() {
            self.size = wb.len() as u64;
            self.data = wb;
            self.version += 1;
            self.meta.mtime = now_u32();
        }
        self.local = true;
    }

    /// Appends a replicated `DATA_BLOCK` chunk directly into `data`, growing
    /// it as bytes arrive, and advances `received` (spec.md §4.6). Bypasses
    /// `wb`/`flush` entirely: a download's bytes must be visible to `read`
    /// as soon as they land, not staged behind the local-write shadow
    /// buffer.
    pub fn receive_block(&mut self, offset: u64, bytes: &[u8]) {
        let start = offset as usize;
        let end = start + bytes.len();
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(bytes);
        self.received = self.received.max(end);
    }

    /// Marks a chunked download complete: the file is now fully local.
    /// Does not touch `data`, which `receive_block` has already filled.
    pub fn finish_download(&mut self) {
        self.downloading = false;
        self.version += 1;
        self.meta.mtime = now_u32();
        self.local = true;
    }

    /// Clears `downloading` without otherwise changing the file, keeping
    /// whatever content and size are already present (spec.md §4.6).
    pub fn cancel_download(&mut self) {
        self.downloading = false;
    }

    /// Whether a read of `[offset, offset+len)` needs to wait for more of
    /// the file to download first (spec.md §4.8).
    pub fn needs_wait_for(&self, offset: u64, len: usize) -> bool {
        self.downloading && offset as usize + len > self.received
    }

    /// `10s` plus `1s` per `16 MiB` still pending, the budget a reader of
    /// an in-progress download is willing to wait before giving up on a
    /// byte range (spec.md §4.8).
    pub fn wait_budget(&self) -> std::time::Duration {
        let pending = self.size.saturating_sub(self.received as u64);
        std::time::Duration::from_secs(10) + std::time::Duration::from_secs_f64(pending as f64 / 16_777_216.0)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// A directory: an ordered set of children, looked up by name.
pub struct Folder {
    pub name: String,
    pub meta: Meta,
    pub children: Vec<Arc<Mutex<FsNode>>>,
    /// Cache expiry, set only on folders created purely to hold a remote
    /// entry's broken path (§4.7's slice-driven cache GC).
    pub expire: u32,
}

impl Folder {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), meta: Meta::now(0o755), children: Vec::new(), expire: 0 }
    }

    fn find(&self, name: &str) -> Option<&Arc<Mutex<FsNode>>> {
        self.children.iter().find(|c| match &*c.lock().unwrap() {
            FsNode::Folder(f) => f.name == name,
            FsNode::File(f) => f.name == name,
        })
    }

    fn remove_child(&mut self, name: &str) -> Option<Arc<Mutex<FsNode>>> {
        let idx = self.children.iter().position(|c| match &*c.lock().unwrap() {
            FsNode::Folder(f) => f.name == name,
            FsNode::File(f) => f.name == name,
        })?;
        Some(self.children.remove(idx))
    }
}

/// Either a folder or a file. Parents are never stored as back-pointers —
/// a lookup always walks from the root, sidestepping `Weak<Folder>`
/// entirely since there is a single owning root (§9).
pub enum FsNode {
    Folder(Folder),
    File(File),
}

impl FsNode {
    pub fn name(&self) -> &str {
        match self {
            Self::Folder(f) => &f.name,
            Self::File(f) => &f.name,
        }
    }

    pub fn meta(&self) -> Meta {
        match self {
            Self::Folder(f) => f.meta,
            Self::File(f) => f.meta,
        }
    }

    pub fn as_file(&self) -> Option<&File> {
        match self {
            Self::File(f) => Some(f),
            Self::Folder(_) => None,
        }
    }

    pub fn as_file_mut(&mut self) -> Option<&mut File> {
        match self {
            Self::File(f) => Some(f),
            Self::Folder(_) => None,
        }
    }
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Owns the single root folder (`"/"`) of a BuddyFS node's metadata tree
/// (spec.md §4.7).
pub struct FilesystemTree {
    root: Arc<Mutex<FsNode>>,
}

impl Default for FilesystemTree {
    fn default() -> Self {
        Self { root: Arc::new(Mutex::new(FsNode::Folder(Folder::new("/")))) }
    }
}

impl FilesystemTree {
    /// Walks the tree for `path`, locally only. Does not attempt the
    /// alpha-miss `FS_REQ` round trip — that lives one layer up, where the
    /// request registry and clique runtime are available.
    pub fn get_local(&self, path: &str) -> Option<Arc<Mutex<FsNode>>> {
        let parts = split_path(path);
        let mut current = self.root.clone();
        for part in parts {
            let next = match &*current.lock().unwrap() {
                FsNode::Folder(folder) => folder.find(part).cloned(),
                FsNode::File(_) => None,
            }?;
            current = next;
        }
        Some(current)
    }

    /// Inserts `node` as a child of the folder at `parent_path`. Returns
    /// `Enoent` if the parent doesn't exist, `Enotdir` if it isn't a
    /// folder, `Eexist` if a child with the same name is already present
    /// (§4.7 idempotence: a racing `AddObject` for the same name is a no-op
    /// collision, not a panic).
    pub fn add_object(&self, parent_path: &str, node: FsNode) -> PosixResult<()> {
        let parent = if parent_path.is_empty() || parent_path == "/" {
            self.root.clone()
        } else {
            self.get_local(parent_path).ok_or(PosixError::Enoent)?
        };
        let mut guard = parent.lock().unwrap();
        let FsNode::Folder(folder) = &mut *guard else { return Err(PosixError::Enotdir) };
        if folder.find(node.name()).is_some() {
            return Err(PosixError::Eexist);
        }
        folder.children.push(Arc::new(Mutex::new(node)));
        Ok(())
    }

    /// Removes the object at `path`, recursing children-first so nested
    /// files are unlocked/dropped before their parent folder (§4.7).
    pub fn remove_object(&self, path: &str) -> PosixResult<()> {
        let (parent_path, name) = split_parent(path)?;
        let parent = if parent_path.is_empty() { self.root.clone() } else { self.get_local(&parent_path).ok_or(PosixError::Enoent)? };

        let removed = {
            let mut guard = parent.lock().unwrap();
            let FsNode::Folder(folder) = &mut *guard else { return Err(PosixError::Enotdir) };
            folder.remove_child(&name).ok_or(PosixError::Enoent)?
        };

        remove_descendants(&removed);
        Ok(())
    }

    /// Unlinks the object at `src`, walks `dst`'s parent path creating
    /// broken intermediate folders as needed, and relinks it there.
    ///
    /// A collision with an existing folder at the destination aborts
    /// *without* relinking the source back — matching the original
    /// exactly (Open Question 2): the object is already unlinked and
    /// simply ends up attached nowhere.
    pub fn move_object(&self, src: &str, dst: &str) -> PosixResult<()> {
        let (src_parent_path, src_name) = split_parent(src)?;
        let src_parent = if src_parent_path.is_empty() {
            self.root.clone()
        } else {
            self.get_local(&src_parent_path).ok_or(PosixError::Enoent)?
        };

        let node = {
            let mut guard = src_parent.lock().unwrap();
            let FsNode::Folder(folder) = &mut *guard else { return Err(PosixError::Enotdir) };
            folder.remove_child(&src_name).ok_or(PosixError::Enoent)?
        };

        let (dst_parent_path, dst_name) = split_parent(dst)?;
        let dst_parent = self.mkdirs(&dst_parent_path);

        {
            let mut guard = node.lock().unwrap();
            match &mut *guard {
                FsNode::Folder(f) => f.name = dst_name.clone(),
                FsNode::File(f) => f.name = dst_name.clone(),
            }
        }

        let mut guard = dst_parent.lock().unwrap();
        let FsNode::Folder(folder) = &mut *guard else { return Err(PosixError::Enotdir) };
        if folder.find(&dst_name).is_some() {
            // Collision: the source stays unlinked, matching the original.
            return Err(PosixError::Eexist);
        }
        folder.children.push(node);
        Ok(())
    }

    /// Creates any missing folders along `path`, returning the final one.
    fn mkdirs(&self, path: &str) -> Arc<Mutex<FsNode>> {
        let mut current = self.root.clone();
        for part in split_path(path) {
            let next = {
                let mut guard = current.lock().unwrap();
                let FsNode::Folder(folder) = &mut *guard else { break };
                match folder.find(part) {
                    Some(existing) => existing.clone(),
                    None => {
                        let new_folder = Arc::new(Mutex::new(FsNode::Folder(Folder::new(part))));
                        folder.children.push(new_folder.clone());
                        new_folder
                    }
                }
            };
            current = next;
        }
        current
    }

    /// Root handle, for the snapshot writer's recursive walk.
    pub(crate) fn root(&self) -> Arc<Mutex<FsNode>> {
        self.root.clone()
    }

    /// Inserts `node` at `path`, creating any missing intermediate folders.
    /// Used by `load_local` to rebuild the tree from a snapshot, where
    /// records are not guaranteed to list a parent strictly before its
    /// children's siblings but always list a folder before anything nested
    /// under it.
    pub(crate) fn insert_at(&self, path: &str, node: FsNode) {
        let (parent_path, _name) = match split_parent(path) {
            Ok(v) => v,
            Err(_) => return,
        };
        let parent = self.mkdirs(&parent_path);
        let mut guard = parent.lock().unwrap();
        if let FsNode::Folder(folder) = &mut *guard {
            folder.children.push(Arc::new(Mutex::new(node)));
        }
    }

    /// Recursively collects the paths of every locally materialized file,
    /// for the `LOCAL_FILES` frame sent during `HANDSHAKE_RESP` handling
    /// (grounded on the original's `FileSystem::BuildList`).
    pub fn build_local_file_list(&self) -> Vec<String> {
        let mut out = Vec::new();
        collect_local(&self.root, String::new(), &mut out);
        out
    }

    /// Removes every non-local entry whose `expire` has passed, recursing
    /// so a folder is only dropped once all of its children are gone
    /// (§4.7). Run once a slice, and only while this node is not alpha.
    /// The root is never a candidate.
    pub fn expire_stale(&self, now: u32) {
        if let FsNode::Folder(folder) = &mut *self.root.lock().unwrap() {
            let children = std::mem::take(&mut folder.children);
            folder.children = children.into_iter().filter(|c| !expire_node(c, now)).collect();
        }
    }
}

/// Returns whether `node` should be dropped from its parent.
fn expire_node(node: &Arc<Mutex<FsNode>>, now: u32) -> bool {
    enum Probe {
        File { is_local: bool, expire: u32 },
        Folder { expire: u32 },
    }

    let (probe, children) = {
        let guard = node.lock().unwrap();
        match &*guard {
            FsNode::File(f) => (Probe::File { is_local: f.is_local(), expire: f.expire }, Vec::new()),
            FsNode::Folder(f) => (Probe::Folder { expire: f.expire }, f.children.clone()),
        }
    };

    match probe {
        Probe::File { is_local, expire } => !is_local && expire > 0 && expire < now,
        Probe::Folder { expire } => {
            let kept: Vec<_> = children.into_iter().filter(|c| !expire_node(c, now)).collect();
            let emptied = kept.is_empty();
            if let FsNode::Folder(folder) = &mut *node.lock().unwrap() {
                folder.children = kept;
            }
            emptied && expire > 0 && expire < now
        }
    }
}

fn collect_local(node: &Arc<Mutex<FsNode>>, prefix: String, out: &mut Vec<String>) {
    match &*node.lock().unwrap() {
        FsNode::Folder(folder) => {
            for child in &folder.children {
                let name = child.lock().unwrap().name().to_string();
                let path = format!("{prefix}/{name}");
                collect_local(child, path, out);
            }
        }
        FsNode::File(file) => {
            if file.is_local() {
                out.push(prefix);
            }
        }
    }
}

fn remove_descendants(node: &Arc<Mutex<FsNode>>) {
    let children: Vec<Arc<Mutex<FsNode>>> = match &*node.lock().unwrap() {
        FsNode::Folder(folder) => folder.children.clone(),
        FsNode::File(_) => return,
    };
    for child in &children {
        remove_descendants(child);
    }
    if let FsNode::Folder(folder) = &mut *node.lock().unwrap() {
        folder.children.clear();
    }
}

/// Splits `path` into its parent directory path and final component name.
fn split_parent(path: &str) -> PosixResult<(String, String)> {
    let parts = split_path(path);
    let (name, parent) = parts.split_last().ok_or(PosixError::Einval)?;
    Ok((parent.join("/"), (*name).to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> NetAddress {
        NetAddress::NONE
    }

    #[test]
    fn add_then_get_round_trips() {
        let tree = FilesystemTree::default();
        tree.add_object("/", FsNode::Folder(Folder::new("docs"))).unwrap();
        tree.add_object("/docs", FsNode::File(File::new_local("a.txt", addr(), b"hi".to_vec())))
            .unwrap();

        let found = tree.get_local("/docs/a.txt").unwrap();
        let guard = found.lock().unwrap();
        assert_eq!(guard.as_file().unwrap().read(0, 2), b"hi");
    }

    #[test]
    fn add_object_collision_is_eexist() {
        let tree = FilesystemTree::default();
        tree.add_object("/", FsNode::Folder(Folder::new("a"))).unwrap();
        let err = tree.add_object("/", FsNode::Folder(Folder::new("a"))).unwrap_err();
        assert_eq!(err, PosixError::Eexist);
    }

    #[test]
    fn remove_object_recurses_children_first() {
        let tree = FilesystemTree::default();
        tree.add_object("/", FsNode::Folder(Folder::new("a"))).unwrap();
        tree.add_object("/a", FsNode::File(File::new_local("b", addr(), vec![1]))).unwrap();

        tree.remove_object("/a").unwrap();
        assert!(tree.get_local("/a").is_none());
    }

    #[test]
    fn move_creates_broken_intermediate_folders() {
        let tree = FilesystemTree::default();
        tree.add_object("/", FsNode::File(File::new_local("f", addr(), vec![9]))).unwrap();

        tree.move_object("/f", "/new/nested/f").unwrap();
        assert!(tree.get_local("/f").is_none());
        assert!(tree.get_local("/new/nested/f").is_some());
    }

    #[test]
    fn move_collision_does_not_reattach_source() {
        let tree = FilesystemTree::default();
        tree.add_object("/", FsNode::File(File::new_local("f", addr(), vec![1]))).unwrap();
        tree.add_object("/", FsNode::Folder(Folder::new("g"))).unwrap();

        let err = tree.move_object("/f", "/g").unwrap_err();
        assert_eq!(err, PosixError::Eexist);
        assert!(tree.get_local("/f").is_none(), "source must stay unlinked on collision");
    }

    #[test]
    fn build_local_file_list_only_reports_materialized_files() {
        let tree = FilesystemTree::default();
        tree.add_object("/", FsNode::File(File::new_local("local.txt", addr(), vec![1]))).unwrap();
        tree.add_object("/", FsNode::File(File::new_remote("remote.txt", addr(), 10))).unwrap();

        let mut list = tree.build_local_file_list();
        list.sort();
        assert_eq!(list, vec!["/local.txt".to_string()]);
    }

    #[test]
    fn expire_stale_drops_expired_remote_file_but_keeps_local() {
        let tree = FilesystemTree::default();
        tree.add_object("/", FsNode::File(File::new_local("keep.txt", addr(), vec![1]))).unwrap();
        let mut stale = File::new_remote("stale.txt", addr(), 10);
        stale.expire = 100;
        tree.add_object("/", FsNode::File(stale)).unwrap();

        tree.expire_stale(200);
        assert!(tree.get_local("/keep.txt").is_some());
        assert!(tree.get_local("/stale.txt").is_none());
    }

    #[test]
    fn expire_stale_drops_emptied_remote_folder() {
        let tree = FilesystemTree::default();
        let mut folder = Folder::new("remote");
        folder.expire = 100;
        tree.add_object("/", FsNode::Folder(folder)).unwrap();
        let mut stale = File::new_remote("f", addr(), 1);
        stale.expire = 100;
        tree.add_object("/remote", FsNode::File(stale)).unwrap();

        tree.expire_stale(200);
        assert!(tree.get_local("/remote").is_none());
    }

    #[test]
    fn file_write_is_shadowed_until_flush() {
        let mut file = File::new_local("f", addr(), b"hello".to_vec());
        file.open_for_write();
        file.write(0, b"H");
        assert_eq!(file.read(0, 5), b"hello", "read sees old data before flush");
        file.flush();
        assert_eq!(file.read(0, 5), b"Hello");
    }
}
