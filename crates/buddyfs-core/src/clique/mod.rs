mod alpha;
mod filestore;

use std::sync::{Arc, Mutex};

use buddyfs_proto::{Frame, NetAddress};

pub use alpha::AlphaClique;
pub use filestore::FileStorageClique;

/// Boundary between clique logic and the reactor's peer table. Cliques
/// never touch `mio`/`TcpConnector` directly — they address peers by
/// `NetAddress` and let whoever owns the reactor (`BuddyNode`) figure out
/// the token underneath (spec.md §4.2's `Socket::_Map` keyed by fd
/// alongside `Peers` keyed by `NetAddress`).
pub trait PeerSender: Send + Sync {
    /// Enqueues `frame` for `addr`. Returns `false` if there is no
    /// connection (live or pending) to that address.
    fn send_to(&self, addr: NetAddress, frame: Frame) -> bool;
    fn has_connection(&self, addr: NetAddress) -> bool;
    /// Requests a connection be opened to `addr`, blocking until it
    /// succeeds or the attempt is abandoned. Used by the alpha bootstrap
    /// worker and `FileStorageClique::join`.
    fn connect_blocking(&self, addr: NetAddress) -> bool;
    fn local_addr(&self) -> NetAddress;
    /// Every peer with a live connection, for the promote-on-15-peers
    /// threshold and for picking a replacement alpha (§4.5).
    fn connected_peers(&self) -> Vec<NetAddress>;
}

/// The address set every clique variant is built on (spec.md §4.4).
/// Membership is idempotent: re-adding an address already present is a
/// no-op.
#[derive(Default)]
pub struct MemberSet {
    members: Vec<NetAddress>,
}

impl MemberSet {
    pub fn add(&mut self, addr: NetAddress) -> bool {
        if self.members.contains(&addr) {
            return false;
        }
        self.members.push(addr);
        true
    }

    pub fn remove(&mut self, addr: NetAddress) -> bool {
        let before = self.members.len();
        self.members.retain(|m| *m != addr);
        self.members.len() != before
    }

    pub fn contains(&self, addr: NetAddress) -> bool {
        self.members.contains(&addr)
    }

    /// Snapshot copy, so iteration is never invalidated by a concurrent
    /// member-list mutation (§5 ordering guarantee).
    pub fn snapshot(&self) -> Vec<NetAddress> {
        self.members.clone()
    }

    pub fn rename(&mut self, from: NetAddress, to: NetAddress) {
        for m in &mut self.members {
            if *m == from {
                *m = to;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// The address-set base every clique is built on: idempotent membership,
/// broadcast, and "first reachable member" delivery (grounded on
/// `Clique::Broadcast`/`Clique::SendOnce`).
#[derive(Default)]
pub struct GenericClique {
    pub members: Mutex<MemberSet>,
}

impl GenericClique {
    pub fn add_member(&self, addr: NetAddress) -> bool {
        self.members.lock().unwrap().add(addr)
    }

    pub fn remove_member(&self, addr: NetAddress) -> bool {
        self.members.lock().unwrap().remove(addr)
    }

    pub fn broadcast(&self, sender: &dyn PeerSender, frame: &Frame) {
        for addr in self.members.lock().unwrap().snapshot() {
            sender.send_to(addr, frame.clone());
        }
    }

    /// Delivers to the first member with a live connection.
    pub fn send_once(&self, sender: &dyn PeerSender, frame: Frame) -> bool {
        for addr in self.members.lock().unwrap().snapshot() {
            if sender.has_connection(addr) {
                return sender.send_to(addr, frame);
            }
        }
        false
    }

    pub fn change_addr(&self, from: NetAddress, to: NetAddress) {
        self.members.lock().unwrap().rename(from, to);
    }
}

/// A process-wide clique, tagged by role (§9's dynamic-dispatch-to-
/// tagged-variant redesign: a `Vec<Box<dyn Clique>>` would force every
/// handler through a trait object; a closed enum lets `on_receive`
/// pattern-match instead).
pub enum CliqueHandle {
    Alpha(Arc<AlphaClique>),
    FileStorage(Arc<FileStorageClique>),
    Generic(Arc<GenericClique>),
}

/// Process-wide list of active cliques under a global mutex (spec.md
/// §4.4). Connect/disconnect iterate a snapshot; receive iterates in
/// registration order and stops at the first clique that handles the
/// frame.
#[derive(Default)]
pub struct CliqueRuntime {
    cliques: Mutex<Vec<CliqueHandle>>,
}

impl CliqueRuntime {
    pub fn register(&self, clique: CliqueHandle) {
        self.cliques.lock().unwrap().push(clique);
    }

    pub fn on_connect(&self, sender: &dyn PeerSender, addr: NetAddress) {
        let snapshot = self.snapshot();
        for c in &snapshot {
            c.on_connect(sender, addr);
        }
    }

    pub fn on_disconnect(&self, sender: &dyn PeerSender, addr: NetAddress) {
        let snapshot = self.snapshot();
        for c in &snapshot {
            c.on_disconnect(sender, addr);
        }
    }

    pub fn on_receive(&self, sender: &dyn PeerSender, from: NetAddress, frame: &Frame) -> bool {
        let snapshot = self.snapshot();
        for c in &snapshot {
            if c.on_receive(sender, from, frame) {
                return true;
            }
        }
        false
    }

    /// Rewrites matching members across every clique, driven by the
    /// `IN_PORT` re-key and by learning our own address via `getsockname`.
    pub fn change_addr(&self, from: NetAddress, to: NetAddress) {
        for c in &self.snapshot() {
            c.change_addr(from, to);
        }
    }

    fn snapshot(&self) -> Vec<CliqueHandleRef> {
        self.cliques
            .lock()
            .unwrap()
            .iter()
            .map(|h| match h {
                CliqueHandle::Alpha(c) => CliqueHandleRef::Alpha(c.clone()),
                CliqueHandle::FileStorage(c) => CliqueHandleRef::FileStorage(c.clone()),
                CliqueHandle::Generic(c) => CliqueHandleRef::Generic(c.clone()),
            })
            .collect()
    }
}

/// Owned-`Arc` snapshot entry, so the cliques lock is released before any
/// handler runs (handlers may re-enter the runtime, e.g. `FORWARD_REQ`).
enum CliqueHandleRef {
    Alpha(Arc<AlphaClique>),
    FileStorage(Arc<FileStorageClique>),
    Generic(Arc<GenericClique>),
}

impl CliqueHandleRef {
    fn on_connect(&self, sender: &dyn PeerSender, addr: NetAddress) {
        match self {
            // The alpha set only grows via the promote-on-15-peers rule and
            // MAKE_ALPHA/HANDSHAKE_RESP handlers, never on a bare connect.
            Self::Alpha(c) => c.on_connect(sender, addr),
            Self::FileStorage(c) => {
                c.base.add_member(addr);
            }
            Self::Generic(c) => {
                c.add_member(addr);
            }
        }
    }

    fn on_disconnect(&self, sender: &dyn PeerSender, addr: NetAddress) {
        match self {
            Self::Alpha(c) => c.on_disconnect(sender, addr),
            Self::FileStorage(c) => {
                c.base.remove_member(addr);
            }
            Self::Generic(c) => {
                c.remove_member(addr);
            }
        }
    }

    fn on_receive(&self, sender: &dyn PeerSender, from: NetAddress, frame: &Frame) -> bool {
        match self {
            Self::Alpha(c) => c.on_receive(sender, from, frame),
            Self::FileStorage(c) => c.on_receive(sender, from, frame),
            Self::Generic(_) => false,
        }
    }

    fn change_addr(&self, from: NetAddress, to: NetAddress) {
        match self {
            Self::Alpha(c) => c.base.change_addr(from, to),
            Self::FileStorage(c) => c.base.change_addr(from, to),
            Self::Generic(c) => c.change_addr(from, to),
        }
    }
}

/// Shared `PeerSender` fake for clique unit tests, used by this module's
/// tests and by `alpha`/`filestore`'s.
#[cfg(test)]
pub(crate) mod tests_support {
    use std::sync::Mutex as StdMutex;

    use buddyfs_proto::Command;

    use super::*;

    #[derive(Default)]
    pub(crate) struct FakeSender {
        pub(crate) sent: StdMutex<Vec<(NetAddress, Command)>>,
        pub(crate) connections: StdMutex<Vec<NetAddress>>,
    }

    impl PeerSender for FakeSender {
        fn send_to(&self, addr: NetAddress, frame: Frame) -> bool {
            self.sent.lock().unwrap().push((addr, frame.cmd));
            true
        }

        fn has_connection(&self, addr: NetAddress) -> bool {
            self.connections.lock().unwrap().contains(&addr)
        }

        fn connect_blocking(&self, addr: NetAddress) -> bool {
            self.connections.lock().unwrap().push(addr);
            true
        }

        fn local_addr(&self) -> NetAddress {
            NetAddress::NONE
        }

        fn connected_peers(&self) -> Vec<NetAddress> {
            self.connections.lock().unwrap().clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use buddyfs_proto::Command;

    use super::*;
    use tests_support::FakeSender;

    fn addr(n: u8) -> NetAddress {
        NetAddress::new(std::net::Ipv4Addr::new(10, 0, 0, n), 9000)
    }

    #[test]
    fn member_add_is_idempotent() {
        let mut set = MemberSet::default();
        assert!(set.add(addr(1)));
        assert!(!set.add(addr(1)));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn broadcast_sends_to_every_member() {
        let clique = GenericClique::default();
        clique.add_member(addr(1));
        clique.add_member(addr(2));
        let sender = FakeSender::default();

        clique.broadcast(&sender, &Frame::new(Command::Ping, 1));
        assert_eq!(sender.sent.lock().unwrap().len(), 2);
    }

    #[test]
    fn send_once_picks_first_connected_member() {
        let clique = GenericClique::default();
        clique.add_member(addr(1));
        clique.add_member(addr(2));
        let sender = FakeSender::default();
        sender.connections.lock().unwrap().push(addr(2));

        assert!(clique.send_once(&sender, Frame::new(Command::Ping, 1)));
        assert_eq!(sender.sent.lock().unwrap()[0].0, addr(2));
    }

    #[test]
    fn receive_stops_at_first_handler() {
        let runtime = CliqueRuntime::default();
        runtime.register(CliqueHandle::Generic(Arc::new(GenericClique::default())));
        let sender = FakeSender::default();
        assert!(!runtime.on_receive(&sender, addr(1), &Frame::new(Command::Ping, 1)));
    }
}
