//! Owns process lifetime: the non-blocking reactor, the filesystem tree,
//! the request registry, and the clique runtime, driven one `slice()` at a
//! time by the daemon's main loop (§9's "explicit lifecycle" redesign —
//! the original keeps all of this behind process-wide statics).

use std::{
    io,
    net::{SocketAddr, UdpSocket},
    path::PathBuf,
    sync::{Arc, Mutex},
};

use buddyfs_net::tcp::{PollEvent, SendBehavior, TcpConnector};
use buddyfs_proto::{Command, Frame, FrameReader, NetAddress};
use buddyfs_timing::{Duration, Instant, Repeater};
use mio::Token;
use tracing::warn;

use crate::{
    clique::{AlphaClique, CliqueHandle, CliqueRuntime, PeerSender},
    drm::Drm,
    fs::{self, FilesystemTree},
    registry::RequestRegistry,
};

/// Frame-level event surfaced after [`PeerTable::tick`] resolves tokens
/// back to `NetAddress`es and absorbs the `IN_PORT` re-key transparently.
pub enum PeerEvent {
    Connected(NetAddress),
    Disconnected(NetAddress),
    AddrChanged { from: NetAddress, to: NetAddress },
    Received { from: NetAddress, frame: Frame },
}

/// Maps `NetAddress` to the `mio::Token` the reactor actually tracks
/// connections by, so clique code never has to know a token exists
/// (spec.md §4.2's `Socket::_Map` keyed by fd alongside `Peers` keyed by
/// address). Implements [`PeerSender`], the only door cliques have into
/// the reactor.
pub struct PeerTable {
    connector: Mutex<TcpConnector>,
    peers: Mutex<Vec<(NetAddress, Token)>>,
    local_addr: NetAddress,
}

impl PeerTable {
    pub fn new(listen_addr: SocketAddr) -> io::Result<Self> {
        let in_port = Frame::writer(Command::InPort, 0).write_u16(listen_addr.port()).finish();
        let mut connector = TcpConnector::default().with_on_connect_msg(in_port);
        connector
            .listen_at(listen_addr)
            .ok_or_else(|| io::Error::other(format!("couldn't bind {listen_addr}")))?;

        let local_ip = local_outbound_ip().unwrap_or(std::net::Ipv4Addr::UNSPECIFIED);
        Ok(Self {
            connector: Mutex::new(connector),
            peers: Mutex::new(Vec::new()),
            local_addr: NetAddress::new(local_ip, listen_addr.port()),
        })
    }

    fn token_for(&self, addr: NetAddress) -> Option<Token> {
        self.peers.lock().unwrap().iter().find(|(a, _)| *a == addr).map(|(_, t)| *t)
    }

    fn addr_for(&self, token: Token) -> Option<NetAddress> {
        self.peers.lock().unwrap().iter().find(|(_, t)| *t == token).map(|(a, _)| *a)
    }

    fn learn(&self, addr: NetAddress, token: Token) {
        let mut peers = self.peers.lock().unwrap();
        if let Some(entry) = peers.iter_mut().find(|(_, t)| *t == token) {
            entry.0 = addr;
        } else {
            peers.push((addr, token));
        }
    }

    fn forget(&self, token: Token) -> Option<NetAddress> {
        let mut peers = self.peers.lock().unwrap();
        let idx = peers.iter().position(|(_, t)| *t == token)?;
        Some(peers.remove(idx).0)
    }

    /// One non-blocking IO pass. Releases the connector lock before
    /// returning, so dispatching the returned events never runs while it's
    /// held — handlers can re-enter `PeerSender` (e.g. `FORWARD_REQ`).
    pub fn tick(&self) -> Vec<PeerEvent> {
        let mut out = Vec::new();
        let mut connector = self.connector.lock().unwrap();
        connector.poll_with(|ev| match ev {
            PollEvent::Accept { stream, peer_addr, .. } => {
                let SocketAddr::V4(v4) = peer_addr else { return };
                let addr = NetAddress::from(v4);
                self.learn(addr, stream);
                out.push(PeerEvent::Connected(addr));
            }
            PollEvent::Disconnect { token } => {
                if let Some(addr) = self.forget(token) {
                    out.push(PeerEvent::Disconnected(addr));
                }
            }
            PollEvent::Message { token, payload } => {
                let Some(frame) = FrameReader::decode(payload).map(|r| r.to_frame()) else {
                    return;
                };
                let Some(old_addr) = self.addr_for(token) else { return };

                // IN_PORT is transport-level: it re-keys this connection's
                // address in place rather than being handed to a clique
                // (spec.md §4.2).
                if frame.cmd == Command::InPort {
                    let mut reader = frame.reader();
                    if let Some(port) = reader.read_u16() {
                        let new_addr = NetAddress::new(old_addr.ip, port);
                        if new_addr != old_addr {
                            self.learn(new_addr, token);
                            out.push(PeerEvent::AddrChanged { from: old_addr, to: new_addr });
                        }
                    }
                    return;
                }

                out.push(PeerEvent::Received { from: old_addr, frame });
            }
        });
        out
    }
}

impl PeerSender for PeerTable {
    fn send_to(&self, addr: NetAddress, frame: Frame) -> bool {
        let Some(token) = self.token_for(addr) else { return false };
        self.connector.lock().unwrap().write_or_enqueue(SendBehavior::Single(token), frame);
        true
    }

    fn has_connection(&self, addr: NetAddress) -> bool {
        self.token_for(addr).is_some()
    }

    /// Kicks off an outbound connect and spins until it lands or a 10s
    /// budget runs out. `TcpConnector::connect` itself is non-blocking, so
    /// this polls the reactor's connector from the caller's thread — used
    /// only by the alpha bootstrap worker and `FileStorageClique::join`'s
    /// synchronous path, never from the reactor thread itself.
    fn connect_blocking(&self, addr: NetAddress) -> bool {
        if self.has_connection(addr) {
            return true;
        }
        let sock = SocketAddr::V4(addr.into());
        let start = Instant::now();
        let budget = Duration::from_secs(10);
        loop {
            let connected = self.connector.lock().unwrap().connect(sock);
            if let Some(token) = connected {
                self.learn(addr, token);
                return true;
            }
            if start.elapsed() >= budget {
                return false;
            }
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
    }

    fn local_addr(&self) -> NetAddress {
        self.local_addr
    }

    fn connected_peers(&self) -> Vec<NetAddress> {
        self.peers.lock().unwrap().iter().map(|(a, _)| *a).collect()
    }
}

/// Best-effort local IPv4 address: "connecting" a UDP socket never sends a
/// packet but makes the kernel pick the outbound interface, whose address
/// `local_addr` then reports. Falls back to `UNSPECIFIED` on a host with no
/// route (e.g. sandboxed tests).
fn local_outbound_ip() -> Option<std::net::Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    match socket.local_addr().ok()?.ip() {
        std::net::IpAddr::V4(ip) => Some(ip),
        std::net::IpAddr::V6(_) => None,
    }
}

/// Owns process lifetime: the reactor, the filesystem tree, the request
/// registry, and the clique runtime.
pub struct BuddyNode {
    pub fs: Arc<FilesystemTree>,
    pub registry: Arc<RequestRegistry>,
    pub cliques: Arc<CliqueRuntime>,
    pub alpha: Arc<AlphaClique>,
    pub peers: Arc<PeerTable>,
    drm: Arc<dyn Drm>,
    snapshot_path: PathBuf,
    registry_reap: Repeater,
    fs_expiry: Repeater,
    snapshot_save: Repeater,
}

impl BuddyNode {
    pub fn new(
        listen_addr: SocketAddr,
        seeds: Vec<NetAddress>,
        snapshot_path: PathBuf,
        drm: Arc<dyn Drm>,
    ) -> io::Result<Self> {
        let fs = Arc::new(fs::load_local(&snapshot_path, drm.as_ref()).unwrap_or_default());
        let registry = Arc::new(RequestRegistry::default());
        let cliques = Arc::new(CliqueRuntime::default());
        let peers = Arc::new(PeerTable::new(listen_addr)?);
        let alpha = AlphaClique::new(seeds, fs.clone(), registry.clone(), drm.clone());
        alpha.attach_cliques(Arc::downgrade(&cliques));
        cliques.register(CliqueHandle::Alpha(alpha.clone()));

        Ok(Self {
            fs,
            registry,
            cliques,
            alpha,
            peers,
            drm,
            snapshot_path,
            registry_reap: Repeater::every(Duration::from_secs(1)),
            fs_expiry: Repeater::every(Duration::from_secs(30)),
            snapshot_save: Repeater::every(Duration::from_secs(30)),
        })
    }

    /// Spawns the bootstrap worker. Call once, before the first `slice`.
    pub fn start(&self) {
        self.alpha.initial_startup(self.peers.clone() as Arc<dyn PeerSender>);
    }

    /// Resolves `path`, issuing an alpha-miss `FS_REQ` round trip on a
    /// local cache miss. Blocks the calling thread, so callers on the
    /// reactor thread itself must not use this (mirrors `FileStorageClique`'s
    /// `join`/`connect_blocking`, which carry the same caveat).
    pub fn get_object(&self, path: &str) -> Option<Arc<Mutex<fs::FsNode>>> {
        self.alpha.get_object(self.peers.as_ref(), path)
    }

    /// One reactor pass (`[SLICE]`): drains IO, lets the request registry
    /// claim correlated responses before cliques see them, dispatches
    /// whatever's left to the clique runtime, then runs each periodic
    /// sub-task off its own `Repeater`. Returns whether any IO was
    /// processed, so the daemon's main loop can back off on an idle pass.
    pub fn slice(&mut self) -> bool {
        let events = self.peers.tick();
        let did_io = !events.is_empty();

        for event in events {
            match event {
                PeerEvent::Connected(addr) => self.cliques.on_connect(self.peers.as_ref(), addr),
                PeerEvent::Disconnected(addr) => {
                    self.cliques.on_disconnect(self.peers.as_ref(), addr);
                }
                PeerEvent::AddrChanged { from, to } => self.cliques.change_addr(from, to),
                PeerEvent::Received { from, frame } => {
                    if !self.registry.offer(frame.clone()) {
                        self.cliques.on_receive(self.peers.as_ref(), from, &frame);
                    }
                }
            }
        }

        self.registry_reap.maybe(|_| self.registry.reap_expired());

        // Only a non-alpha node's cache of other peers' metadata is
        // allowed to expire; the alpha's copy is the authoritative one
        // (spec.md §4.7).
        if !self.alpha.is_alpha() {
            self.fs_expiry.maybe(|_| self.fs.expire_stale(fs::now_u32()));
        }

        self.snapshot_save.maybe(|_| {
            if let Err(err) = fs::save_local(&self.fs, &self.snapshot_path, self.drm.as_ref()) {
                warn!(?err, path = ?self.snapshot_path, "snapshot save failed");
            }
        });

        did_io
    }
}
