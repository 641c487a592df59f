use std::sync::{
    Arc, Mutex, Weak,
    atomic::{AtomicBool, AtomicU32, Ordering},
};

use buddyfs_proto::{Command, Frame, FrameReader, NetAddress};
use buddyfs_timing::Duration;
use tracing::{debug, info, warn};

use super::{CliqueHandle, CliqueRuntime, FileStorageClique, GenericClique, PeerSender};
use crate::{
    error::PosixError,
    fs::{self, FilesystemTree},
    registry::RequestRegistry,
};

/// Promote-on-new-peer threshold (spec.md §4.5).
const PROMOTE_PEER_THRESHOLD: usize = 15;

/// Leader overlay: a small set of "alpha" members that hold the
/// authoritative filesystem metadata. Exactly one node in the whole
/// network starts with `is_alpha = true`, or every seed connect fails and
/// a node promotes itself (spec.md §4.5).
pub struct AlphaClique {
    pub(super) base: GenericClique,
    is_alpha: AtomicBool,
    initing: AtomicBool,
    seeds: Mutex<Vec<NetAddress>>,
    fs: Arc<FilesystemTree>,
    /// Lets `get_object` register a waiter against the same registry the
    /// reactor offers responses into, without needing a second handle
    /// threaded through.
    registry: Arc<RequestRegistry>,
    next_reqid: AtomicU32,
    /// `Weak` so the runtime's own `Arc<AlphaClique>` (held via
    /// `CliqueHandle::Alpha`) and this don't form a reference cycle; set
    /// once by `attach_cliques` right after `BuddyNode::new` registers us.
    cliques: Mutex<Option<Weak<CliqueRuntime>>>,
    drm: Arc<dyn crate::drm::Drm>,
}

impl AlphaClique {
    pub fn new(
        seeds: Vec<NetAddress>,
        fs: Arc<FilesystemTree>,
        registry: Arc<RequestRegistry>,
        drm: Arc<dyn crate::drm::Drm>,
    ) -> Arc<Self> {
        Arc::new(Self {
            base: GenericClique::default(),
            is_alpha: AtomicBool::new(false),
            initing: AtomicBool::new(false),
            seeds: Mutex::new(seeds),
            fs,
            registry,
            next_reqid: AtomicU32::new(1),
            cliques: Mutex::new(None),
            drm,
        })
    }

    /// Resolves `path`, serving a local copy if one is cached and falling
    /// back to an `FS_REQ`/`FS_RESP` round trip against a known alpha
    /// member when this node is non-alpha and has no copy of its own
    /// (spec.md §4.3, §4.7). An alpha node is itself authoritative, so a
    /// local miss there is a true `ENOENT` with nothing to ask.
    ///
    /// `FS_RESP` only carries stat-like metadata (kind, mode, mtime,
    /// ctime), not size or replica addresses, so a file learned this way
    /// is cached with size `0` and the answering member as its sole known
    /// replica until a later `LOCAL_FILES` or `CREATE_REQ` fills those in.
    pub fn get_object(&self, sender: &dyn PeerSender, path: &str) -> Option<Arc<Mutex<fs::FsNode>>> {
        if let Some(node) = self.fs.get_local(path) {
            return Some(node);
        }
        if self.is_alpha() {
            return None;
        }
        let member = self.base.members.lock().unwrap().snapshot().first().copied()?;

        let reqid = self.next_reqid.fetch_add(1, Ordering::Relaxed).max(1);
        self.registry.register(reqid, Command::FsResp, Duration::from_secs(10));
        let mut w = Frame::writer(Command::FsReq, reqid);
        w.write_ascii(path);
        sender.send_to(member, w.finish());

        let frame = self.registry.wait_for_response(reqid).into_iter().next()?;
        let mut reader = frame.reader();
        if !reader.read_bool()? {
            return None;
        }
        let is_folder = reader.read_bool()?;
        let mode = reader.read_u32()?;
        let mtime = reader.read_u32()?;
        let ctime = reader.read_u32()?;

        let record = fs::MetadataRecord {
            path: path.to_string(),
            is_folder,
            meta: fs::Meta { mode, mtime, ctime },
            size: 0,
            replicas: vec![member],
        };
        fs::ingest_record(&self.fs, &record);
        self.fs.get_local(path)
    }

    /// Lets `CREATE_REQ` spin up a `FileStorageClique` for each new file
    /// without this struct owning the runtime outright.
    pub fn attach_cliques(&self, cliques: Weak<CliqueRuntime>) {
        *self.cliques.lock().unwrap() = Some(cliques);
    }

    pub fn is_alpha(&self) -> bool {
        self.is_alpha.load(Ordering::Acquire)
    }

    /// Blocking bootstrap worker body: tries each seed in turn. The first
    /// successful connect sends `HANDSHAKE` and we stay non-alpha,
    /// awaiting `HANDSHAKE_RESP`. Exhausting the list promotes us. Run on
    /// a dedicated thread by `initial_startup`; there is nothing to
    /// cancel mid-flight since it is a bounded sequence of blocking
    /// connects (§9).
    fn bootstrap_worker(self: &Arc<Self>, sender: &dyn PeerSender) {
        let seeds = self.seeds.lock().unwrap().clone();
        for seed in seeds {
            if sender.connect_blocking(seed) {
                info!(%seed, "alpha bootstrap: connected to seed, sending handshake");
                sender.send_to(seed, Frame::new(Command::Handshake, 0));
                self.initing.store(false, Ordering::Release);
                return;
            }
        }
        warn!("alpha bootstrap: every seed unreachable, promoting self to alpha");
        self.is_alpha.store(true, Ordering::Release);
        self.initing.store(false, Ordering::Release);
    }

    /// Spawns the bootstrap worker and joins it (§9: cooperative join, no
    /// cancel signal).
    pub fn initial_startup(self: &Arc<Self>, sender: Arc<dyn PeerSender>) {
        if self.initing.swap(true, Ordering::AcqRel) {
            return;
        }
        let this = self.clone();
        std::thread::Builder::new()
            .name("buddyfs-alpha-bootstrap".into())
            .spawn(move || this.bootstrap_worker(sender.as_ref()))
            .expect("spawn bootstrap worker")
            .join()
            .ok();
    }

    pub(super) fn on_connect(&self, sender: &dyn PeerSender, addr: NetAddress) {
        if self.is_alpha() && sender.connected_peers().len() > PROMOTE_PEER_THRESHOLD {
            let payload = fs::write_full_list(&self.fs);
            let mut frame = Frame::new(Command::MakeAlpha, 0);
            frame.payload = payload;
            sender.send_to(addr, frame);
            self.base.add_member(addr);
        }
    }

    pub(super) fn on_disconnect(self: &Arc<Self>, sender: &dyn PeerSender, addr: NetAddress) {
        if !self.base.remove_member(addr) {
            return;
        }
        if self.is_alpha() {
            let replacement = sender.connected_peers().into_iter().find(|p| !self.base.members.lock().unwrap().contains(*p));
            if let Some(peer) = replacement {
                let payload = fs::write_full_list(&self.fs);
                let mut frame = Frame::new(Command::MakeAlpha, 0);
                frame.payload = payload;
                sender.send_to(peer, frame);
            }
        } else if !self.initing.swap(true, Ordering::AcqRel) {
            debug!("lost an alpha member, restarting bootstrap");
            self.bootstrap_worker(sender);
        }
    }

    pub(super) fn on_receive(&self, sender: &dyn PeerSender, from: NetAddress, frame: &Frame) -> bool {
        match frame.cmd {
            Command::Handshake => self.handle_handshake(sender, from, frame),
            Command::HandshakeResp => self.handle_handshake_resp(sender, from, frame),
            Command::MakeAlpha => self.handle_make_alpha(sender, from, frame),
            Command::LocalFiles => self.handle_local_files(from, frame),
            Command::ListReq => self.handle_list_req(sender, from, frame),
            Command::FsReq => self.handle_fs_req(sender, from, frame),
            Command::CreateReq => self.handle_create_req(sender, from, frame),
            Command::FileUpdate => self.handle_file_update(sender, from, frame),
            Command::RmFile | Command::RmDir => self.handle_remove(sender, from, frame),
            Command::Rename => self.handle_rename(sender, from, frame),
            Command::ForwardReq => self.handle_forward_req(sender, frame),
            _ => return false,
        }
        true
    }

    fn handle_handshake(&self, sender: &dyn PeerSender, from: NetAddress, frame: &Frame) {
        let members = self.base.members.lock().unwrap().snapshot();
        let mut resp = Frame::writer(Command::HandshakeResp, frame.reqid);
        resp.write_u16(members.len() as u16).write_bool(self.is_alpha());
        for m in &members {
            resp.write_addr(*m);
        }
        sender.send_to(from, resp.finish());
    }

    fn handle_handshake_resp(&self, sender: &dyn PeerSender, from: NetAddress, frame: &Frame) {
        let mut reader = frame.clone().reader();
        let Some(count) = reader.read_u16() else { return };
        let Some(remote_is_alpha) = reader.read_bool() else { return };
        for _ in 0..count {
            let Some(addr) = reader.read_addr() else { break };
            self.base.add_member(addr);
        }

        if remote_is_alpha {
            let paths = self.fs.build_local_file_list();
            let mut w = Frame::writer(Command::LocalFiles, 0);
            w.write_u32(paths.len() as u32);
            for p in &paths {
                w.write_ascii(p);
            }
            sender.send_to(from, w.finish());
            self.base.add_member(from);
        } else {
            self.initing.store(false, Ordering::Release);
            self.bootstrap_worker(sender);
        }
    }

    fn handle_make_alpha(&self, sender: &dyn PeerSender, from: NetAddress, frame: &Frame) {
        self.base.add_member(from);
        self.is_alpha.store(true, Ordering::Release);

        for member in self.base.members.lock().unwrap().snapshot() {
            if !sender.has_connection(member) {
                sender.connect_blocking(member);
            }
        }

        for record in fs::parse_metadata_list(frame.payload.clone()) {
            fs::ingest_record(&self.fs, &record);
        }
    }

    fn handle_local_files(&self, from: NetAddress, frame: &Frame) {
        let mut reader = frame.clone().reader();
        let Some(count) = reader.read_u32() else { return };
        for _ in 0..count {
            let Some(path) = reader.read_ascii(4096) else { break };
            if self.fs.get_local(&path).is_none() {
                let record = fs::MetadataRecord {
                    path: path.clone(),
                    is_folder: false,
                    meta: crate::fs::Meta::now(0o644),
                    size: 0,
                    replicas: vec![from],
                };
                fs::ingest_record(&self.fs, &record);
            }
        }
    }

    fn handle_list_req(&self, sender: &dyn PeerSender, from: NetAddress, frame: &Frame) {
        let mut reader = frame.clone().reader();
        let Some(path) = reader.read_ascii(4096) else { return };
        let mut w = Frame::writer(Command::ListResp, frame.reqid);
        match self.fs.get_local(&path) {
            Some(node) => {
                let guard = node.lock().unwrap();
                match &*guard {
                    crate::fs::FsNode::Folder(folder) => {
                        w.write_i16(folder.children.len() as i16);
                        for child in &folder.children {
                            w.write_ascii(child.lock().unwrap().name());
                        }
                    }
                    crate::fs::FsNode::File(_) => {
                        w.write_i16(-(PosixError::Enotdir.errno()));
                    }
                }
            }
            None => {
                w.write_i16(-(PosixError::Enoent.errno()));
            }
        }
        sender.send_to(from, w.finish());
    }

    fn handle_fs_req(&self, sender: &dyn PeerSender, from: NetAddress, frame: &Frame) {
        let mut reader = frame.clone().reader();
        let Some(path) = reader.read_ascii(4096) else { return };
        let mut w = Frame::writer(Command::FsResp, frame.reqid);
        match self.fs.get_local(&path) {
            Some(node) => {
                let guard = node.lock().unwrap();
                let meta = guard.meta();
                let is_folder = matches!(&*guard, crate::fs::FsNode::Folder(_));
                w.write_bool(true)
                    .write_bool(is_folder)
                    .write_u32(meta.mode)
                    .write_u32(meta.mtime)
                    .write_u32(meta.ctime);
            }
            None => {
                w.write_bool(false).write_i32(-i32::from(PosixError::Enoent.errno()));
            }
        }
        sender.send_to(from, w.finish());
    }

    fn handle_create_req(&self, sender: &dyn PeerSender, from: NetAddress, frame: &Frame) {
        let sender_is_alpha = self.base.members.lock().unwrap().contains(from);
        let mut fanout = 0i16;
        if !sender_is_alpha {
            for member in self.base.members.lock().unwrap().snapshot() {
                if member != from {
                    sender.send_to(member, frame.clone());
                    fanout += 1;
                }
            }
        }

        let mut reader = frame.clone().reader();
        let Some(origin) = reader.read_addr() else { return };
        let Some(is_folder) = reader.read_bool() else { return };
        let Some(mode) = reader.read_u32() else { return };
        let Some(path) = reader.read_ascii(4096) else { return };

        let Ok((parent, name)) = split_parent(&path) else { return };
        let node = if is_folder {
            crate::fs::FsNode::Folder({
                let mut f = crate::fs::Folder::new(name);
                f.meta = crate::fs::Meta::now(mode);
                f
            })
        } else {
            crate::fs::FsNode::File(crate::fs::File::new_local(name, origin, Vec::new()))
        };

        let mut w = Frame::writer(Command::CreateResp, frame.reqid);
        match self.fs.add_object(&parent, node) {
            Ok(()) => {
                w.write_i16(fanout).write_i32(0);
                if !is_folder {
                    self.base.add_member(from);
                    self.spawn_file_storage(&path, origin, from);
                }
            }
            Err(err) => {
                w.write_i16(fanout).write_i32(i32::from(err.errno()));
            }
        }
        sender.send_to(from, w.finish());
    }

    /// Registers a fresh `FileStorageClique` for a just-created file, with
    /// its creator as the first (and so far only) replica holder.
    fn spawn_file_storage(&self, path: &str, origin: NetAddress, from: NetAddress) {
        let Some(cliques) = self.cliques.lock().unwrap().as_ref().and_then(Weak::upgrade) else {
            return;
        };
        let storage = FileStorageClique::new(
            path,
            crate::fs::File::new_local(fs::leaf_name(path), origin, Vec::new()),
            self.drm.clone(),
        );
        storage.base.add_member(from);
        cliques.register(CliqueHandle::FileStorage(storage));
    }

    fn handle_file_update(&self, sender: &dyn PeerSender, from: NetAddress, frame: &Frame) {
        let mut reader = frame.clone().reader();
        let Some(path) = reader.read_ascii(4096) else { return };
        let Some(mtime) = reader.read_u32() else { return };
        let Some(size) = reader.read_u32() else { return };
        let Some(forward) = reader.read_bool() else { return };

        let sender_is_alpha = self.base.members.lock().unwrap().contains(from);
        if forward && self.is_alpha() && !sender_is_alpha {
            self.base.broadcast(sender, frame);
        }

        if let Some(node) = self.fs.get_local(&path) {
            let mut guard = node.lock().unwrap();
            if let crate::fs::FsNode::File(file) = &mut *guard {
                file.meta.mtime = mtime;
                file.size = size as u64;
            }
        }
    }

    fn handle_remove(&self, sender: &dyn PeerSender, from: NetAddress, frame: &Frame) {
        let sender_is_alpha = self.base.members.lock().unwrap().contains(from);
        if self.is_alpha() && !sender_is_alpha {
            self.base.broadcast(sender, frame);
        }
        let mut reader = frame.clone().reader();
        let Some(path) = reader.read_ascii(4096) else { return };
        let _ = self.fs.remove_object(&path);
    }

    fn handle_rename(&self, sender: &dyn PeerSender, from: NetAddress, frame: &Frame) {
        let sender_is_alpha = self.base.members.lock().unwrap().contains(from);
        if self.is_alpha() && !sender_is_alpha {
            self.base.broadcast(sender, frame);
        }
        let mut reader = frame.clone().reader();
        let Some(from_path) = reader.read_ascii(4096) else { return };
        let Some(to_path) = reader.read_ascii(4096) else { return };
        let _ = self.fs.move_object(&from_path, &to_path);
    }

    fn handle_forward_req(&self, sender: &dyn PeerSender, frame: &Frame) {
        let mut reader = frame.clone().reader();
        let Some(req_from) = reader.read_addr() else { return };
        let Some(to) = reader.read_addr() else { return };

        if to == sender.local_addr() {
            if !sender.has_connection(req_from) {
                sender.connect_blocking(req_from);
            }
        } else {
            sender.send_to(to, frame.clone());
        }
    }

    /// Delivers `frame` to the alpha set: loopback to ourselves if we are
    /// alpha, else the first reachable alpha member, else self-promote and
    /// retry locally (spec.md §4.5).
    pub fn send_once(self: &Arc<Self>, sender: &dyn PeerSender, frame: Frame) {
        if self.is_alpha() {
            self.on_receive(sender, sender.local_addr(), &frame);
            return;
        }
        if self.base.send_once(sender, frame.clone()) {
            return;
        }
        self.is_alpha.store(true, Ordering::Release);
        self.on_receive(sender, sender.local_addr(), &frame);
    }
}

fn split_parent(path: &str) -> Result<(String, String), PosixError> {
    let trimmed = path.trim_end_matches('/');
    let (parent, name) = trimmed.rsplit_once('/').ok_or(PosixError::Einval)?;
    let parent = if parent.is_empty() { "/".to_string() } else { parent.to_string() };
    Ok((parent, name.to_string()))
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::clique::tests_support::FakeSender;

    fn addr(n: u8) -> NetAddress {
        NetAddress::new(Ipv4Addr::new(10, 0, 0, n), 9000)
    }

    #[test]
    fn handshake_replies_with_member_list_and_alpha_flag() {
        let alpha = AlphaClique::new(vec![], Arc::new(FilesystemTree::default()), Arc::new(RequestRegistry::default()), Arc::new(crate::drm::PermissiveDrm));
        alpha.is_alpha.store(true, Ordering::Release);
        alpha.base.add_member(addr(2));
        let sender = FakeSender::default();

        alpha.on_receive(&sender, addr(1), &Frame::new(Command::Handshake, 5));

        let sent = sender.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, Command::HandshakeResp);
    }

    #[test]
    fn create_req_adds_object_and_replies_create_resp() {
        let fs = Arc::new(FilesystemTree::default());
        let alpha = AlphaClique::new(vec![], fs.clone(), Arc::new(RequestRegistry::default()), Arc::new(crate::drm::PermissiveDrm));
        alpha.is_alpha.store(true, Ordering::Release);
        let sender = FakeSender::default();

        let mut w = Frame::writer(Command::CreateReq, 9);
        w.write_addr(addr(9)).write_bool(true).write_u32(0o755).write_ascii("/docs");
        alpha.on_receive(&sender, addr(1), &w.finish());

        assert!(fs.get_local("/docs").is_some());
        let sent = sender.sent.lock().unwrap();
        assert_eq!(sent.last().unwrap().1, Command::CreateResp);
    }

    #[test]
    fn create_req_for_a_file_registers_a_file_storage_clique() {
        let fs = Arc::new(FilesystemTree::default());
        let alpha = AlphaClique::new(vec![], fs.clone(), Arc::new(RequestRegistry::default()), Arc::new(crate::drm::PermissiveDrm));
        alpha.is_alpha.store(true, Ordering::Release);
        let cliques = Arc::new(CliqueRuntime::default());
        alpha.attach_cliques(Arc::downgrade(&cliques));
        let sender = FakeSender::default();

        let mut w = Frame::writer(Command::CreateReq, 9);
        w.write_addr(addr(9)).write_bool(false).write_u32(0o644).write_ascii("/f");
        alpha.on_receive(&sender, addr(1), &w.finish());

        assert!(fs.get_local("/f").is_some());
        assert!(cliques.on_receive(
            &sender,
            addr(2),
            &{
                let mut open = Frame::writer(Command::OpenReq, 1);
                open.write_ascii("/f").write_u32(0);
                open.finish()
            },
        ));
    }

    #[test]
    fn get_object_resolves_via_fs_req_round_trip_on_alpha_miss() {
        let fs = Arc::new(FilesystemTree::default());
        let registry = Arc::new(RequestRegistry::default());
        let alpha = AlphaClique::new(vec![], fs.clone(), registry.clone(), Arc::new(crate::drm::PermissiveDrm));
        alpha.base.add_member(addr(2));
        let sender = FakeSender::default();

        let responder = registry.clone();
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            let mut w = Frame::writer(Command::FsResp, 1);
            w.write_bool(true).write_bool(false).write_u32(0o644).write_u32(10).write_u32(10);
            responder.offer(w.finish());
        });

        let node = alpha.get_object(&sender, "/remote.txt").expect("resolved via FS_REQ round trip");
        assert_eq!(node.lock().unwrap().name(), "remote.txt");

        let sent = sender.sent.lock().unwrap();
        assert_eq!(sent[0].1, Command::FsReq);
    }

    #[test]
    fn get_object_is_none_on_alpha_when_locally_missing() {
        let fs = Arc::new(FilesystemTree::default());
        let alpha = AlphaClique::new(vec![], fs, Arc::new(RequestRegistry::default()), Arc::new(crate::drm::PermissiveDrm));
        alpha.is_alpha.store(true, Ordering::Release);
        let sender = FakeSender::default();

        assert!(alpha.get_object(&sender, "/nope").is_none());
        assert!(sender.sent.lock().unwrap().is_empty(), "alpha has nobody to ask, must not send FS_REQ");
    }
}
