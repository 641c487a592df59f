use std::{
    collections::VecDeque,
    io::{self, IoSlice, Read, Write},
    net::SocketAddr,
};

use buddyfs_proto::{Frame, HEADER_SIZE, MAX_RAW_RECV_LEN, is_valid_length};
use buddyfs_timing::{Duration, Instant};
use mio::{Interest, Registry, Token, event::Event};
use tracing::{debug, warn};

// TODO: might need to tweak this
const RX_BUF_SIZE: usize = 32 * 1024;

/// Egress bytes allowed per connection per wall-clock second (§3, §5).
pub const SOCKET_BW_LIMIT: usize = 1_024_000;

/// Response type for all external calls.
///
/// `Alive` means the connection is still usable.
/// `Disconnected` means the peer is gone and the connection must be rebuilt.
#[derive(Debug, PartialEq, Eq)]
pub enum ConnState {
    Alive,
    Disconnected,
}

enum ReadOutcome<'a> {
    PayloadDone { frame: &'a [u8] },
    WouldBlock,
    Disconnected,
    Invalid,
}

#[derive(Clone, Copy)]
enum RxState {
    /// Waiting for the 9-byte cmd+length+reqid header.
    ReadingHeader { buf: [u8; HEADER_SIZE], have: usize },
    /// Reading the payload of `total_len` bytes, header included.
    ReadingPayload { total_len: usize, offset: usize },
}

/// Single mio-backed TCP connection speaking BuddyFS's frame format.
///
/// Frames are `[cmd:u8][length:u32 BE][reqid:u32 BE][payload]` (§4.1, §6).
///
/// Outbound:
///   - `write_or_enqueue(frame)` serialises `frame` to wire bytes.
///   - Attempts to write (non-blocking) to the socket.
///   - Any unwritten remainder is queued (this path allocates).
///   - Backlogged frames are flushed whenever the socket becomes writable,
///     subject to [`SOCKET_BW_LIMIT`] bytes per wall-clock second.
///
/// Inbound:
///   - Reads the 9-byte header, then exactly `length - HEADER_SIZE` more
///     bytes.
///   - When a full frame is assembled, `poll_with` invokes the caller
///     callback with the raw wire bytes (header included).
///   - Continues reading frames until `WouldBlock`.
///
/// Reconnect handling:
///   - If `ConnState::Disconnected` is returned the caller must treat the
///     connection as dead and rebuild the state.
pub struct PeerStream {
    stream: mio::net::TcpStream,
    token: Token,
    peer_addr: SocketAddr,

    rx_state: RxState,
    rx_buf: Vec<u8>,
    send_backlog: VecDeque<Vec<u8>>,

    /// True if WRITABLE interest is currently registered in `poll`.
    /// Invariant: `writable_armed == !send_backlog.is_empty()`
    writable_armed: bool,

    window_start: Instant,
    bytes_this_window: usize,
}

impl PeerStream {
    #[inline(never)]
    pub(crate) fn from_stream(
        stream: mio::net::TcpStream,
        token: Token,
        peer_addr: SocketAddr,
    ) -> io::Result<Self> {
        stream.set_nodelay(true)?;

        Ok(Self {
            stream,
            token,
            peer_addr,
            rx_state: RxState::ReadingHeader { buf: [0; HEADER_SIZE], have: 0 },
            rx_buf: vec![0; RX_BUF_SIZE],
            send_backlog: VecDeque::with_capacity(64),
            writable_armed: false,
            window_start: Instant::now(),
            bytes_this_window: 0,
        })
    }

    /// Poll socket and calls `on_msg` for every fully assembled frame.
    /// Frame data (header included) is only valid for the duration of the
    /// callback.
    #[inline]
    pub fn poll_with<F>(&mut self, registry: &Registry, ev: &Event, on_msg: &mut F) -> ConnState
    where
        F: for<'a> FnMut(Token, &'a [u8]),
    {
        if ev.is_readable() {
            loop {
                match self.read_frame() {
                    ReadOutcome::PayloadDone { frame } => on_msg(ev.token(), frame),
                    ReadOutcome::WouldBlock => break,
                    ReadOutcome::Disconnected | ReadOutcome::Invalid => {
                        return ConnState::Disconnected;
                    }
                }
            }
        }

        if ev.is_writable() && self.drain_backlog(registry) == ConnState::Disconnected {
            return ConnState::Disconnected;
        }

        ConnState::Alive
    }

    /// Happy path: serialises `frame` and writes it to the stream.
    /// If the write would block or we have already blocked on a previous
    /// write, allocates a new vec and stores the frame in the backlog to be
    /// flushed at the next writable event.
    #[inline]
    pub fn write_or_enqueue(&mut self, registry: &Registry, frame: Frame) -> ConnState {
        let wire =
            Frame::writer(frame.cmd, frame.reqid).write_bytes(&frame.payload).finish_bytes();

        if !self.send_backlog.is_empty() {
            return self.enqueue_back(registry, wire);
        }

        match self.stream.write_vectored(&[IoSlice::new(&wire)]) {
            Ok(0) => {
                warn!("tcp: stream failed to write, disconnecting");
                ConnState::Disconnected
            }
            Ok(n) if n == wire.len() => ConnState::Alive,
            Ok(n) => self.enqueue_front(registry, wire[n..].to_vec()),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.enqueue_back(registry, wire)
            }
            Err(err) => {
                warn!(?err, "tcp: stream write fail");
                ConnState::Disconnected
            }
        }
    }

    /// Flush queued data until kernel blocks, queue empty, or this second's
    /// bandwidth quota is exhausted.
    #[inline]
    fn drain_backlog(&mut self, registry: &Registry) -> ConnState {
        self.roll_window();

        while let Some(front) = self.send_backlog.front_mut() {
            let quota = SOCKET_BW_LIMIT.saturating_sub(self.bytes_this_window);
            if quota == 0 {
                break;
            }
            let n_to_try = front.len().min(quota);

            match self.stream.write(&front[..n_to_try]) {
                Ok(0) => return ConnState::Disconnected,

                Ok(n) => {
                    self.bytes_this_window += n;
                    if n == front.len() {
                        self.send_backlog.pop_front();
                    } else {
                        front.drain(..n);
                    }
                }

                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,

                Err(err) => {
                    debug!(?err, "tcp: write from backlog");
                    return ConnState::Disconnected;
                }
            }
        }

        // Drop WRITABLE interest only when fully drained
        if self.send_backlog.is_empty() && self.writable_armed {
            if let Err(err) = registry.reregister(&mut self.stream, self.token, Interest::READABLE) {
                debug!(?err, "tcp: reregister drop writable");
                return ConnState::Disconnected;
            }
            self.writable_armed = false;
        }

        ConnState::Alive
    }

    fn roll_window(&mut self) {
        if self.window_start.elapsed() >= Duration::from_secs(1) {
            self.window_start = Instant::now();
            self.bytes_this_window = 0;
        }
    }

    /// Read a single complete frame if present.
    /// Loops until a frame is received or we've read everything and the read
    /// would block.
    #[inline]
    fn read_frame(&mut self) -> ReadOutcome<'_> {
        loop {
            match self.rx_state {
                RxState::ReadingHeader { mut buf, mut have } => {
                    while have < HEADER_SIZE {
                        match self.stream.read(&mut buf[have..]) {
                            Ok(0) => return ReadOutcome::Disconnected,

                            Ok(n) => {
                                have += n;
                                if have == HEADER_SIZE {
                                    let total_len =
                                        u32::from_be_bytes(buf[1..5].try_into().unwrap()) as usize;
                                    if total_len > MAX_RAW_RECV_LEN || !is_valid_length(total_len) {
                                        warn!(total_len, "tcp: invalid frame length, dropping peer");
                                        return ReadOutcome::Invalid;
                                    }
                                    if total_len > self.rx_buf.len() {
                                        debug!(
                                            buf_len = self.rx_buf.len(),
                                            need_len = total_len,
                                            "tcp: buffer resized"
                                        );
                                        self.rx_buf.resize(total_len, 0);
                                    }
                                    self.rx_buf[..HEADER_SIZE].copy_from_slice(&buf);
                                    self.rx_state = RxState::ReadingPayload {
                                        total_len,
                                        offset: HEADER_SIZE,
                                    };
                                }
                            }

                            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                                self.rx_state = RxState::ReadingHeader { buf, have };
                                return ReadOutcome::WouldBlock;
                            }

                            Err(err) => {
                                debug!(?err, "tcp: read header");
                                return ReadOutcome::Disconnected;
                            }
                        }
                    }
                }

                RxState::ReadingPayload { total_len, mut offset } => {
                    while offset < total_len {
                        match self.stream.read(&mut self.rx_buf[offset..total_len]) {
                            Ok(0) => return ReadOutcome::Disconnected,

                            Ok(n) => {
                                offset += n;

                                // offset can never be > total_len, we pass a fixed length slice.
                                if offset == total_len {
                                    self.rx_state = RxState::ReadingHeader {
                                        buf: [0; HEADER_SIZE],
                                        have: 0,
                                    };

                                    return ReadOutcome::PayloadDone {
                                        frame: &self.rx_buf[..total_len],
                                    };
                                }
                            }

                            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                                self.rx_state = RxState::ReadingPayload { total_len, offset };
                                return ReadOutcome::WouldBlock;
                            }

                            Err(err) => {
                                debug!(?err, "tcp: read payload");
                                return ReadOutcome::Disconnected;
                            }
                        }
                    }
                }
            }
        }
    }

    #[inline]
    fn enqueue_front(&mut self, registry: &Registry, data: Vec<u8>) -> ConnState {
        self.send_backlog.push_front(data);
        self.arm_writable(registry)
    }

    #[inline]
    fn enqueue_back(&mut self, registry: &Registry, data: Vec<u8>) -> ConnState {
        self.send_backlog.push_back(data);
        self.arm_writable(registry)
    }

    /// Arm WRITABLE notifications when transitioning from empty -> non-empty
    /// queue. `self.poll` will start polling for writable events.
    #[inline]
    fn arm_writable(&mut self, registry: &Registry) -> ConnState {
        if !self.writable_armed {
            if let Err(err) = registry.reregister(
                &mut self.stream,
                self.token,
                Interest::READABLE | Interest::WRITABLE,
            ) {
                debug!(?err, "tcp: poll reregister");
                return ConnState::Disconnected;
            }
            self.writable_armed = true;
        }
        ConnState::Alive
    }

    pub fn close(&mut self, registry: &Registry) -> SocketAddr {
        debug!("terminating connection");
        let _ = registry.deregister(&mut self.stream);
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        self.peer_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

/// Set kernel SO_SNDBUF and SO_RCVBUF on a mio TcpStream.
pub(crate) fn set_socket_buf_size(stream: &mio::net::TcpStream, size: usize) {
    use std::os::fd::AsRawFd;
    let fd = stream.as_raw_fd();
    let size = size as libc::c_int;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &size as *const _ as *const libc::c_void,
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &size as *const _ as *const libc::c_void,
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

#[cfg(test)]
mod tests {
    use buddyfs_proto::Command;
    use mio::Poll;

    use super::*;

    fn connected_peer(poll: &Poll, token: Token) -> PeerStream {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        client.set_nonblocking(true).unwrap();
        server.set_nonblocking(true).unwrap();
        std::mem::forget(server);
        let mut mio_stream = mio::net::TcpStream::from_std(client);
        poll.registry().register(&mut mio_stream, token, Interest::READABLE).unwrap();
        PeerStream::from_stream(mio_stream, token, addr).unwrap()
    }

    #[test]
    fn happy_path_write_has_no_backlog() {
        let poll = Poll::new().unwrap();
        let mut peer = connected_peer(&poll, Token(0));

        let frame = Frame::writer(Command::Ping, 1).write_u8(5).finish();
        assert_eq!(peer.write_or_enqueue(poll.registry(), frame), ConnState::Alive);
        assert!(peer.send_backlog.is_empty());
    }
}
