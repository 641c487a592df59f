use std::{
    net::{Ipv4Addr, SocketAddr},
    thread,
    time::Duration,
};

use buddyfs_net::tcp::{PollEvent, SendBehavior, TcpConnector};
use buddyfs_proto::{Command, Frame, FrameReader, MAX_FRAME_LEN};

const NUM_RECEIVERS: usize = 4;
const BURST_SIZE: usize = 20;
/// Largest `DataBlock` payload the wire format allows (§4.1, §6).
const PAYLOAD_SIZE: usize = MAX_FRAME_LEN - buddyfs_proto::HEADER_SIZE - 4;

/// Spawns a receiver thread that connects to `addr` via TcpConnector and
/// collects frames via poll_with until the sender disconnects.
fn spawn_receiver(addr: SocketAddr) -> thread::JoinHandle<Vec<Vec<u8>>> {
    thread::spawn(move || {
        // 8 KiB socket buf constrains the receiver (smaller than a single
        // 16 KiB DataBlock) while staying well above loopback MSS.
        let mut conn = TcpConnector::default().with_socket_buf_size(8192);
        conn.connect(addr).expect("receiver: failed to connect");

        let mut frames: Vec<Vec<u8>> = Vec::new();
        let mut disconnected = false;
        let deadline = std::time::Instant::now() + Duration::from_secs(30);

        while !disconnected && std::time::Instant::now() < deadline {
            conn.poll_with(|event| match event {
                PollEvent::Message { payload, .. } => {
                    let decoded = FrameReader::decode(payload).expect("valid frame");
                    assert_eq!(decoded.cmd, Command::DataBlock);
                    frames.push(decoded.to_frame().payload);
                }
                PollEvent::Disconnect { .. } => {
                    disconnected = true;
                }
                _ => {}
            });
            thread::sleep(Duration::from_millis(1));
        }

        frames
    })
}

fn pump(conn: &mut TcpConnector, for_how_long: Duration) {
    let deadline = std::time::Instant::now() + for_how_long;
    while std::time::Instant::now() < deadline {
        while conn.poll_with(|_| {}) {}
        thread::sleep(Duration::from_millis(1));
    }
}

/// Broadcast a burst of max-size `DataBlock` frames to multiple receivers.
///
/// Sender listens via TcpConnector, receivers connect via TcpConnector. The
/// sender uses a 1 KiB socket buffer to force backpressure and backlog
/// queueing on the send side. Receivers use an 8 KiB socket buffer — small
/// enough to constrain the pipe but at or above loopback MSS so TCP window
/// updates still fire.
///
/// Verifies that every receiver gets every frame intact and in order.
#[test]
fn broadcast_burst_to_multiple_receivers() {
    let probe =
        std::net::TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).expect("probe");
    let addr = probe.local_addr().unwrap();
    drop(probe);

    // Small send buffer on the sender forces backpressure after the first
    // partial write of each frame.
    let mut sender = TcpConnector::default().with_socket_buf_size(1024);
    sender.listen_at(addr).expect("failed to listen");

    let handles: Vec<_> = (0..NUM_RECEIVERS).map(|_| spawn_receiver(addr)).collect();

    // Accept all inbound connections.
    let mut accepted = 0;
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while accepted < NUM_RECEIVERS && std::time::Instant::now() < deadline {
        sender.poll_with(|event| {
            if let PollEvent::Accept { .. } = event {
                accepted += 1;
            }
        });
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(accepted, NUM_RECEIVERS, "not all receivers connected");

    // Fire a burst of near-max-size DataBlock frames, each tagged with its
    // sequence number so order and completeness can be verified on the
    // receiver side.
    for seq in 0..BURST_SIZE {
        let mut payload = vec![(seq & 0xFF) as u8; PAYLOAD_SIZE];
        payload[..4].copy_from_slice(&(seq as u32).to_be_bytes());
        let frame = Frame::writer(Command::DataBlock, 0).write_bytes(&payload).finish();
        sender.write_or_enqueue(SendBehavior::Broadcast, frame);
        // Pump between writes so mio can flush backlogs.
        while sender.poll_with(|_| {}) {}
    }

    // Pump until all backlogs are drained.
    pump(&mut sender, Duration::from_secs(5));

    // Drop sender so receivers see disconnect.
    drop(sender);

    for (i, handle) in handles.into_iter().enumerate() {
        let frames = handle.join().unwrap_or_else(|_| panic!("receiver {i} panicked"));

        assert_eq!(
            frames.len(),
            BURST_SIZE,
            "receiver {i}: expected {BURST_SIZE} frames, got {}",
            frames.len()
        );

        for (seq, frame) in frames.iter().enumerate() {
            assert_eq!(frame.len(), PAYLOAD_SIZE, "receiver {i} frame {seq}: wrong payload size");

            let got_seq = u32::from_be_bytes(frame[..4].try_into().unwrap()) as usize;
            assert_eq!(got_seq, seq, "receiver {i}: frame out of order");

            let expected_fill = (seq & 0xFF) as u8;
            assert!(
                frame[4..].iter().all(|&b| b == expected_fill),
                "receiver {i} frame {seq}: payload corrupted"
            );
        }
    }
}
