use buddyfs_proto::{Command, Frame, FrameReader, FrameWriter, NetAddress};

use super::{File, FilesystemTree, Folder, FsNode, Meta};

/// One entry of the `MAKE_ALPHA` payload / `WriteFullList` broadcast
/// (spec.md §4.7): `[path][type][mode][mtime][ctime]`, plus for files
/// `[size][n_replicas][replicas…]`.
pub struct MetadataRecord {
    pub path: String,
    pub is_folder: bool,
    pub meta: Meta,
    pub size: u32,
    pub replicas: Vec<NetAddress>,
}

/// Serializes every node of `tree` (skipping the root itself) into a
/// single payload, for `MAKE_ALPHA`/`WriteFullList`.
pub fn write_full_list(tree: &FilesystemTree) -> Vec<u8> {
    let mut w = Frame::writer(Command::MakeAlpha, 0);
    write_node(&tree.root(), String::new(), &mut w);
    w.finish().payload
}

fn write_node(node: &std::sync::Arc<std::sync::Mutex<FsNode>>, prefix: String, w: &mut FrameWriter) {
    let guard = node.lock().unwrap();
    match &*guard {
        FsNode::Folder(folder) => {
            let path = format!("{prefix}/{}", folder.name);
            if !prefix.is_empty() || folder.name != "/" {
                w.write_ascii(&path)
                    .write_u8(0)
                    .write_u32(folder.meta.mode)
                    .write_u32(folder.meta.mtime)
                    .write_u32(folder.meta.ctime);
            }
            let children = folder.children.clone();
            drop(guard);
            for child in &children {
                write_node(child, path.clone(), w);
            }
        }
        FsNode::File(file) => {
            let path = format!("{prefix}/{}", file.name);
            w.write_ascii(&path)
                .write_u8(1)
                .write_u32(file.meta.mode)
                .write_u32(file.meta.mtime)
                .write_u32(file.meta.ctime)
                .write_u32(file.size as u32)
                .write_i32(1);
            w.write_addr(file.owner);
        }
    }
}

/// Parses a `write_full_list` payload back into individual records.
pub fn parse_metadata_list(payload: Vec<u8>) -> Vec<MetadataRecord> {
    let mut reader = FrameReader::new(Command::MakeAlpha, 0, payload);
    let mut out = Vec::new();
    while reader.remaining() > 0 {
        let Some(path) = reader.read_ascii(4096) else { break };
        let Some(kind) = reader.read_u8() else { break };
        let Some(mode) = reader.read_u32() else { break };
        let Some(mtime) = reader.read_u32() else { break };
        let Some(ctime) = reader.read_u32() else { break };
        let meta = Meta { mode, mtime, ctime };
        if kind == 0 {
            out.push(MetadataRecord { path, is_folder: true, meta, size: 0, replicas: Vec::new() });
            continue;
        }
        let Some(size) = reader.read_u32() else { break };
        let Some(n_replicas) = reader.read_i32() else { break };
        let mut replicas = Vec::new();
        for _ in 0..n_replicas.max(0) {
            let Some(addr) = reader.read_addr() else { break };
            replicas.push(addr);
        }
        out.push(MetadataRecord { path, is_folder: false, meta, size, replicas });
    }
    out
}

/// How long a remote entry learned from another peer's broadcast is kept
/// before `FilesystemTree::expire_stale` is allowed to drop it, absent any
/// fresher broadcast that refreshes it first (§4.7's slice-driven cache GC).
const CACHE_TTL_SECS: u32 = 300;

/// Ensures an entry exists for `record`, creating intermediate folders as
/// needed ("broken path" mode), and applies its attributes. Returns the
/// replica list for files, so the caller can enlist them in the file's
/// storage clique.
pub fn ingest_record(tree: &FilesystemTree, record: &MetadataRecord) -> Vec<NetAddress> {
    if tree.get_local(&record.path).is_some() {
        return record.replicas.clone();
    }

    let expire = record.meta.mtime.saturating_add(CACHE_TTL_SECS).max(CACHE_TTL_SECS);
    if record.is_folder {
        tree.insert_at(&record.path, FsNode::Folder({
            let mut f = Folder::new(super::leaf_name(&record.path));
            f.meta = record.meta;
            f.expire = expire;
            f
        }));
    } else {
        let owner = record.replicas.first().copied().unwrap_or(NetAddress::NONE);
        let mut file = File::new_remote(super::leaf_name(&record.path), owner, record.size as u64);
        file.meta = record.meta;
        file.expire = expire;
        tree.insert_at(&record.path, FsNode::File(file));
    }
    record.replicas.clone()
}

