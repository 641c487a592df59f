use std::{io, path::Path};

use buddyfs_proto::{Command, Frame, FrameReader, FrameWriter};

use super::{File, FilesystemTree, Folder, FsNode, Meta};
use crate::drm::Drm;

/// Record type tags, reusing the wire frame's `[cmd][length][reqid]`
/// envelope for the on-disk layout (spec.md §4.7: "read with the same
/// frame cursor used on the wire"). `reqid` is unused on disk and written
/// as zero.
const FOLDER_TAG: Command = Command::Nothing;
const FILE_TAG: Command = Command::CreateReq;

/// Writes every node of `tree` to `path` as the concatenation of per-object
/// records described in spec.md §4.7, via an atomic temp-file-then-rename
/// (Open Question 3).
pub fn save_local(tree: &FilesystemTree, path: &Path, drm: &dyn Drm) -> io::Result<()> {
    let mut out = Vec::new();
    write_node(&tree.root(), String::new(), drm, &mut out);

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    {
        use std::io::Write as _;
        tmp.write_all(&out)?;
        tmp.flush()?;
    }
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn write_node(node: &std::sync::Arc<std::sync::Mutex<FsNode>>, prefix: String, drm: &dyn Drm, out: &mut Vec<u8>) {
    let guard = node.lock().unwrap();
    match &*guard {
        FsNode::Folder(folder) => {
            let path = format!("{prefix}/{}", folder.name);
            if !prefix.is_empty() || folder.name != "/" {
                let mut w = Frame::writer(FOLDER_TAG, 0);
                write_meta(&mut w, &path, folder.meta);
                out.extend_from_slice(&w.finish_bytes());
            }
            let children = folder.children.clone();
            drop(guard);
            for child in &children {
                write_node(child, path.clone(), drm, out);
            }
        }
        FsNode::File(file) => {
            let path = format!("{prefix}/{}", file.name);
            let mut w = Frame::writer(FILE_TAG, 0);
            write_meta(&mut w, &path, file.meta);
            w.write_bool(file.is_local());
            if file.is_local() {
                w.write_i32(file.version).write_u32(file.size as u32);
                drm.write_drm(file, &mut w);
                drm.encrypt(file, file.data(), &mut w);
            }
            out.extend_from_slice(&w.finish_bytes());
        }
    }
}

fn write_meta(w: &mut FrameWriter, path: &str, meta: Meta) {
    w.write_ascii(path).write_u32(meta.mode).write_u32(meta.mtime).write_u32(meta.ctime);
}

/// Rebuilds a `FilesystemTree` from a snapshot written by `save_local`.
/// Run once at startup (spec.md §4.7).
pub fn load_local(path: &Path, drm: &dyn Drm) -> io::Result<FilesystemTree> {
    let bytes = std::fs::read(path)?;
    let tree = FilesystemTree::default();

    let mut offset = 0;
    while offset + buddyfs_proto::HEADER_SIZE <= bytes.len() {
        let length = u32::from_be_bytes(bytes[offset + 1..offset + 5].try_into().unwrap()) as usize;
        if length < buddyfs_proto::HEADER_SIZE || offset + length > bytes.len() {
            break;
        }
        let record = &bytes[offset..offset + length];
        offset += length;

        let Some(mut reader) = FrameReader::decode(record) else { break };
        let Some(fs_path) = reader.read_ascii(4096) else { continue };
        let Some(mode) = reader.read_u32() else { continue };
        let Some(mtime) = reader.read_u32() else { continue };
        let Some(ctime) = reader.read_u32() else { continue };
        let meta = Meta { mode, mtime, ctime };

        match reader.cmd {
            cmd if cmd == FOLDER_TAG => {
                let mut folder = Folder::new(super::leaf_name(&fs_path));
                folder.meta = meta;
                tree.insert_at(&fs_path, FsNode::Folder(folder));
            }
            cmd if cmd == FILE_TAG => {
                let Some(is_local) = reader.read_bool() else { continue };
                let mut file = if is_local {
                    let Some(version) = reader.read_i32() else { continue };
                    let Some(_local_size) = reader.read_u32() else { continue };
                    let owner = buddyfs_proto::NetAddress::NONE;
                    let probe = File::new_local(super::leaf_name(&fs_path), owner, Vec::new());
                    drm.read_drm(&probe, &mut reader);
                    let body = drm.decrypt(&probe, &mut reader);
                    let mut file = File::new_local(super::leaf_name(&fs_path), owner, body);
                    file.version = version;
                    file
                } else {
                    File::new_remote(super::leaf_name(&fs_path), buddyfs_proto::NetAddress::NONE, 0)
                };
                file.meta = meta;
                tree.insert_at(&fs_path, FsNode::File(file));
            }
            _ => {}
        }
    }

    Ok(tree)
}

