use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    thread,
    time::Duration,
};

use buddyfs_net::tcp::{PollEvent, SendBehavior, TcpConnector};
use buddyfs_proto::{Command, Frame, FrameReader};

#[test]
fn tcp_roundtrip() {
    let bind_addr = SocketAddr::from((IpAddr::V4(Ipv4Addr::LOCALHOST), 24712));

    let mut listener = TcpConnector::default();
    let _listening_token = listener.listen_at(bind_addr).unwrap();

    let server = thread::spawn(move || {
        let mut accepted_stream = None;

        while accepted_stream.is_none() {
            listener.poll_with(|event| match event {
                PollEvent::Accept { stream, .. } => accepted_stream = Some(stream),
                PollEvent::Message { .. } => panic!("shouldn't have gotten here"),
                _ => {}
            });
        }

        let stream_token = accepted_stream.unwrap();

        let mut recv = None;
        loop {
            listener.poll_with(|event| {
                if let PollEvent::Message { token, payload } = event {
                    assert_eq!(token, stream_token);
                    let decoded = FrameReader::decode(payload).expect("valid frame");
                    assert_eq!(decoded.cmd, Command::Ping);
                    recv = Some(decoded.reqid);
                }
            });
            if recv.is_some() {
                break;
            }
            thread::sleep(Duration::from_micros(50));
        }

        let resp = Frame::writer(Command::Pong, recv.unwrap()).write_u32(111).finish();
        listener.write_or_enqueue(SendBehavior::Single(stream_token), resp);
        listener.poll_with(|event| {
            if let PollEvent::Message { .. } = event {
                panic!("shouldn't have gotten here");
            }
        });
    });

    let client = thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(10));
        let mut conn = TcpConnector::default();
        let tok = conn.connect(bind_addr).unwrap();

        let ping = Frame::writer(Command::Ping, 222).write_u32(222).finish();
        conn.write_or_enqueue(SendBehavior::Single(tok), ping);

        let mut recv = None;
        loop {
            conn.poll_with(|event| {
                if let PollEvent::Message { payload, .. } = event {
                    let mut decoded = FrameReader::decode(payload).expect("valid frame");
                    assert_eq!(decoded.cmd, Command::Pong);
                    assert_eq!(decoded.reqid, 222);
                    recv = Some(decoded.read_u32().unwrap());
                }
            });
            if recv.is_some() {
                break;
            }
            thread::sleep(Duration::from_micros(50));
        }
        assert_eq!(recv, Some(111));
    });

    server.join().unwrap();
    client.join().unwrap();
}
