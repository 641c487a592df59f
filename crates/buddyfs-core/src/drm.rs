use buddyfs_proto::{FrameReader, FrameWriter, NetAddress};

use crate::fs::{File, FsNode};

/// External collaborator boundary for access control and at-rest
/// protection (spec.md §6).
///
/// BuddyFS's core never implements rights parsing or ciphers itself — a
/// real deployment supplies its own `Drm` (user/group rules, key
/// derivation, whatever the original's `drm.cpp` did) and plugs it into
/// `FilesystemTree`/`File`. [`PermissiveDrm`] is the trivial implementation
/// used when no such collaborator is configured.
pub trait Drm: Send + Sync {
    fn can_read(&self, obj: &FsNode) -> bool;
    fn can_write(&self, obj: &FsNode) -> bool;
    fn can_append(&self, obj: &FsNode) -> bool;
    fn can_remove(&self, obj: &FsNode) -> bool;
    fn is_site_allowed(&self, obj: &FsNode, addr: NetAddress) -> bool;
    fn read_drm(&self, file: &File, reader: &mut FrameReader);
    fn write_drm(&self, file: &File, writer: &mut FrameWriter);
    /// Writes `body` (at-rest representation) into `writer`. Takes the
    /// plaintext explicitly since `File`'s shadow buffer isn't part of its
    /// public surface.
    fn encrypt(&self, file: &File, body: &[u8], writer: &mut FrameWriter);
    /// Reads and returns the plaintext body for `file` from `reader`.
    fn decrypt(&self, file: &File, reader: &mut FrameReader) -> Vec<u8>;
}

/// Allows everything, stores no rights blob, and treats at-rest protection
/// as an identity transform. Not a real cipher: per Open Question 4, this
/// is a documented no-op rather than an invented key scheme.
#[derive(Default)]
pub struct PermissiveDrm;

impl Drm for PermissiveDrm {
    fn can_read(&self, _obj: &FsNode) -> bool {
        true
    }

    fn can_write(&self, _obj: &FsNode) -> bool {
        true
    }

    fn can_append(&self, _obj: &FsNode) -> bool {
        true
    }

    fn can_remove(&self, _obj: &FsNode) -> bool {
        true
    }

    fn is_site_allowed(&self, _obj: &FsNode, _addr: NetAddress) -> bool {
        true
    }

    fn read_drm(&self, _file: &File, _reader: &mut FrameReader) {}

    fn write_drm(&self, _file: &File, _writer: &mut FrameWriter) {}

    fn encrypt(&self, _file: &File, body: &[u8], writer: &mut FrameWriter) {
        writer.write_bytes(body);
    }

    fn decrypt(&self, _file: &File, reader: &mut FrameReader) -> Vec<u8> {
        reader.read_bytes(reader.remaining()).unwrap_or_default()
    }
}
