//! End-to-end scenarios driven over an in-memory duplex. The raw side of
//! each test speaks the wire protocol through the crate's own codec.

use http2_core::{
    Bytes, ClientOptions, Connection, ContinuationFlags, DataFlags, ErrorType, Frame, FrameReader,
    FrameWriter, Headers, HeadersFlags, NonZeroStreamId, PingFlags, SettingsFlags,
    SettingsParameter, StreamEvent, TransportError, U31_MAX,
};
use std::time::Duration;
use tokio::io::{split, DuplexStream, ReadHalf, WriteHalf};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn sid(id: u32) -> NonZeroStreamId {
    NonZeroStreamId::new(id).unwrap()
}

fn settings(params: Vec<(SettingsParameter, u32)>) -> Frame {
    Frame::Settings {
        flags: SettingsFlags::empty(),
        params,
    }
}

fn settings_ack() -> Frame {
    Frame::Settings {
        flags: SettingsFlags::ACK,
        params: Vec::new(),
    }
}

fn request_headers() -> Headers {
    vec![
        (":method".to_owned(), "GET".to_owned()),
        (":scheme".to_owned(), "https".to_owned()),
        (":path".to_owned(), "/".to_owned()),
        (":authority".to_owned(), "example.com".to_owned()),
    ]
}

/// A raw HTTP/2 peer speaking through the crate's codec.
struct Peer {
    reader: FrameReader<ReadHalf<DuplexStream>>,
    writer: FrameWriter<WriteHalf<DuplexStream>>,
}

impl Peer {
    fn new(io: DuplexStream) -> Self {
        let (read, write) = split(io);
        Self {
            reader: FrameReader::new(read),
            writer: FrameWriter::new(write),
        }
    }

    async fn read_frame(&mut self) -> Frame {
        self.reader
            .read_frame()
            .await
            .expect("peer read")
            .expect("unexpected eof")
    }

    async fn expect_eof(&mut self) {
        assert!(self.reader.read_frame().await.expect("peer read").is_none());
    }

    async fn write_frame(&mut self, frame: Frame) {
        self.writer.write_frame(&frame).await.expect("peer write");
    }

    /// Plays the server side of the handshake against a client connection.
    async fn server_handshake(&mut self) {
        self.server_handshake_with(Vec::new()).await;
    }

    async fn server_handshake_with(&mut self, params: Vec<(SettingsParameter, u32)>) {
        self.reader.read_preface().await.expect("client preface");
        let first = self.read_frame().await;
        assert!(
            matches!(&first, Frame::Settings { flags, .. } if !flags.contains(SettingsFlags::ACK)),
            "client must lead with SETTINGS, got {first:?}"
        );
        self.write_frame(settings(params)).await;
        let ack = self.read_frame().await;
        assert!(
            matches!(&ack, Frame::Settings { flags, .. } if flags.contains(SettingsFlags::ACK)),
            "expected SETTINGS ack, got {ack:?}"
        );
        self.write_frame(settings_ack()).await;
    }

    /// Plays the client side of the handshake against a server connection.
    async fn client_handshake(&mut self) {
        self.writer.write_preface().await.expect("preface");
        self.write_frame(settings(Vec::new())).await;
        let first = self.read_frame().await;
        assert!(
            matches!(&first, Frame::Settings { flags, .. } if !flags.contains(SettingsFlags::ACK)),
            "server must lead with SETTINGS, got {first:?}"
        );
        let ack = self.read_frame().await;
        assert!(
            matches!(&ack, Frame::Settings { flags, .. } if flags.contains(SettingsFlags::ACK)),
            "expected SETTINGS ack, got {ack:?}"
        );
        self.write_frame(settings_ack()).await;
    }
}

#[tokio::test]
async fn client_handshake_reaches_operational() {
    init_logging();
    let (client_io, peer_io) = tokio::io::duplex(64 * 1024);
    let (conn, _incoming) = Connection::client(client_io, ClientOptions::default());
    let mut peer = Peer::new(peer_io);
    peer.server_handshake().await;

    // operational: a stream opens and its HEADERS hit the wire
    let stream = conn.open_stream(request_headers(), true).await.unwrap();
    assert_eq!(stream.id().get(), 1);
    let frame = peer.read_frame().await;
    let Frame::Headers { stream: id, flags, .. } = frame else {
        panic!("expected HEADERS, got {frame:?}");
    };
    assert_eq!(id.get(), 1);
    assert!(flags.contains(HeadersFlags::END_HEADERS));
    assert!(flags.contains(HeadersFlags::END_STREAM));
}

#[tokio::test]
async fn client_disables_push_by_default() {
    init_logging();
    let (client_io, peer_io) = tokio::io::duplex(64 * 1024);
    let (_conn, _incoming) = Connection::client(client_io, ClientOptions::default());
    let mut peer = Peer::new(peer_io);
    peer.reader.read_preface().await.unwrap();
    let first = peer.read_frame().await;
    let Frame::Settings { flags, params } = first else {
        panic!("expected SETTINGS");
    };
    assert!(!flags.contains(SettingsFlags::ACK));
    assert!(params.contains(&(SettingsParameter::EnablePush, 0)));
}

#[tokio::test]
async fn server_requires_settings_first() {
    init_logging();
    let (server_io, peer_io) = tokio::io::duplex(64 * 1024);
    let (_conn, _incoming) = Connection::server(server_io);
    let mut peer = Peer::new(peer_io);
    peer.writer.write_preface().await.unwrap();
    // first frame is DATA on stream 1 instead of SETTINGS
    peer.write_frame(Frame::Data {
        stream: sid(1),
        flags: DataFlags::empty(),
        data: Bytes::from_static(b"oops"),
        pad: 0,
    })
    .await;

    let first = peer.read_frame().await;
    assert!(matches!(first, Frame::Settings { .. }));
    let goaway = peer.read_frame().await;
    let Frame::GoAway { last_stream, error, .. } = goaway else {
        panic!("expected GOAWAY, got {goaway:?}");
    };
    assert_eq!(last_stream, 0);
    assert_eq!(error, ErrorType::ProtocolError);
    peer.expect_eof().await;
}

#[tokio::test]
async fn bad_preface_terminates() {
    init_logging();
    let (server_io, peer_io) = tokio::io::duplex(64 * 1024);
    let (conn, _incoming) = Connection::server(server_io);
    let mut peer = Peer::new(peer_io);
    // 24 octets that are not the preface
    peer.write_frame(Frame::Ping {
        flags: PingFlags::empty(),
        payload: [0x50; 8],
    })
    .await;
    peer.write_frame(Frame::Ping {
        flags: PingFlags::empty(),
        payload: [0x50; 8],
    })
    .await;
    // the termination code depends on whether the ping command raced the
    // shutdown; either way the future resolves with a termination error
    assert!(matches!(
        conn.ping().await.unwrap_err(),
        TransportError::Terminated(_)
    ));
}

#[tokio::test]
async fn ping_roundtrip() {
    init_logging();
    let (client_io, peer_io) = tokio::io::duplex(64 * 1024);
    let (conn, _incoming) = Connection::client(client_io, ClientOptions::default());
    let mut peer = Peer::new(peer_io);
    peer.server_handshake().await;

    let (result, ()) = tokio::join!(conn.ping(), async {
        let frame = peer.read_frame().await;
        let Frame::Ping { flags, payload } = frame else {
            panic!("expected PING, got {frame:?}");
        };
        assert!(!flags.contains(PingFlags::ACK));
        peer.write_frame(Frame::Ping {
            flags: PingFlags::ACK,
            payload,
        })
        .await;
    });
    result.unwrap();
}

#[tokio::test]
async fn mismatched_ping_ack_is_protocol_error() {
    init_logging();
    let (client_io, peer_io) = tokio::io::duplex(64 * 1024);
    let (conn, _incoming) = Connection::client(client_io, ClientOptions::default());
    let mut peer = Peer::new(peer_io);
    peer.server_handshake().await;

    let (result, ()) = tokio::join!(conn.ping(), async {
        let frame = peer.read_frame().await;
        assert!(matches!(frame, Frame::Ping { .. }));
        peer.write_frame(Frame::Ping {
            flags: PingFlags::ACK,
            payload: [0xff; 8],
        })
        .await;
        let goaway = peer.read_frame().await;
        let Frame::GoAway { error, .. } = goaway else {
            panic!("expected GOAWAY, got {goaway:?}");
        };
        assert_eq!(error, ErrorType::ProtocolError);
    });
    assert_eq!(
        result.unwrap_err(),
        TransportError::Terminated(ErrorType::ProtocolError)
    );
}

#[tokio::test]
async fn data_waits_for_stream_window_credit() {
    init_logging();
    let (client_io, peer_io) = tokio::io::duplex(64 * 1024);
    let (conn, _incoming) = Connection::client(client_io, ClientOptions::default());
    let mut peer = Peer::new(peer_io);
    peer.server_handshake_with(vec![(SettingsParameter::InitialWindowSize, 0)])
        .await;

    let stream = conn.open_stream(request_headers(), false).await.unwrap();
    let id = stream.id();
    let frame = peer.read_frame().await;
    assert!(matches!(frame, Frame::Headers { .. }));

    let sender =
        tokio::spawn(async move { stream.send_data(Bytes::from_static(b"hello"), true).await });

    // nothing flows while the stream window is empty
    let starved = tokio::time::timeout(Duration::from_millis(100), peer.read_frame()).await;
    assert!(starved.is_err(), "DATA leaked past a zero window");

    peer.write_frame(Frame::WindowUpdate {
        stream: id.get(),
        increment: 5,
    })
    .await;
    let frame = peer.read_frame().await;
    assert_eq!(
        frame,
        Frame::Data {
            stream: id,
            flags: DataFlags::END_STREAM,
            data: Bytes::from_static(b"hello"),
            pad: 0,
        }
    );
    sender.await.unwrap().unwrap();
}

#[tokio::test]
async fn data_waits_for_connection_window_credit() {
    init_logging();
    let (client_io, peer_io) = tokio::io::duplex(256 * 1024);
    let (conn, _incoming) = Connection::client(client_io, ClientOptions::default());
    let mut peer = Peer::new(peer_io);
    // generous stream windows so only the 65535-octet connection window gates
    peer.server_handshake_with(vec![(SettingsParameter::InitialWindowSize, 1 << 20)])
        .await;

    let stream = conn.open_stream(request_headers(), false).await.unwrap();
    let frame = peer.read_frame().await;
    assert!(matches!(frame, Frame::Headers { .. }));

    let total = 70_000usize;
    let sender = tokio::spawn(async move {
        stream.send_data(Bytes::from(vec![7u8; total]), true).await
    });

    let mut received = 0usize;
    while received < 65_535 {
        let frame = peer.read_frame().await;
        let Frame::Data { data, flags, .. } = frame else {
            panic!("expected DATA, got {frame:?}");
        };
        assert!(!flags.contains(DataFlags::END_STREAM));
        received += data.len();
    }
    assert_eq!(received, 65_535);

    // connection window exhausted; the rest waits
    let starved = tokio::time::timeout(Duration::from_millis(100), peer.read_frame()).await;
    assert!(starved.is_err(), "DATA leaked past the connection window");

    peer.write_frame(Frame::WindowUpdate {
        stream: 0,
        increment: 10_000,
    })
    .await;
    let frame = peer.read_frame().await;
    let Frame::Data { data, flags, .. } = frame else {
        panic!("expected DATA");
    };
    assert_eq!(data.len(), total - 65_535);
    assert!(flags.contains(DataFlags::END_STREAM));
    sender.await.unwrap().unwrap();
}

#[tokio::test]
async fn continuation_runs_reassemble() {
    init_logging();
    let (server_io, peer_io) = tokio::io::duplex(64 * 1024);
    let (_conn, mut incoming) = Connection::server(server_io);
    let mut peer = Peer::new(peer_io);
    peer.client_handshake().await;

    // one literal header field ("a": "b"), split mid-field across frames
    peer.write_frame(Frame::Headers {
        stream: sid(1),
        flags: HeadersFlags::empty(),
        priority: None,
        fragment: Bytes::from_static(&[0x00, 0x01]),
    })
    .await;
    peer.write_frame(Frame::Continuation {
        stream: sid(1),
        flags: ContinuationFlags::END_HEADERS,
        fragment: Bytes::from_static(&[0x61, 0x01, 0x62]),
    })
    .await;

    let request = incoming.accept().await.unwrap();
    assert_eq!(request.headers, vec![("a".to_owned(), "b".to_owned())]);
    assert!(!request.end_stream);
    assert_eq!(request.stream.id(), sid(1));
}

#[tokio::test]
async fn frame_inside_continuation_run_is_protocol_error() {
    init_logging();
    let (server_io, peer_io) = tokio::io::duplex(64 * 1024);
    let (_conn, _incoming) = Connection::server(server_io);
    let mut peer = Peer::new(peer_io);
    peer.client_handshake().await;

    peer.write_frame(Frame::Headers {
        stream: sid(1),
        flags: HeadersFlags::empty(),
        priority: None,
        fragment: Bytes::from_static(&[0x00, 0x01]),
    })
    .await;
    peer.write_frame(Frame::Ping {
        flags: PingFlags::empty(),
        payload: [1; 8],
    })
    .await;

    let goaway = peer.read_frame().await;
    let Frame::GoAway { error, .. } = goaway else {
        panic!("expected GOAWAY, got {goaway:?}");
    };
    assert_eq!(error, ErrorType::ProtocolError);
}

#[tokio::test]
async fn graceful_finish() {
    init_logging();
    let (client_io, peer_io) = tokio::io::duplex(64 * 1024);
    let (conn, _incoming) = Connection::client(client_io, ClientOptions::default());
    let mut peer = Peer::new(peer_io);
    peer.server_handshake().await;

    let mut stream = conn.open_stream(request_headers(), true).await.unwrap();
    let frame = peer.read_frame().await;
    assert!(matches!(frame, Frame::Headers { .. }));

    conn.finish().await;
    let goaway = peer.read_frame().await;
    assert!(matches!(
        goaway,
        Frame::GoAway {
            last_stream: 0,
            error: ErrorType::NoError,
            ..
        }
    ));

    // no new streams in either direction
    assert_eq!(
        conn.open_stream(request_headers(), true).await.unwrap_err(),
        TransportError::GoingAway
    );

    // the existing stream still runs to completion (0x88 = ":status: 200")
    peer.write_frame(Frame::Headers {
        stream: sid(1),
        flags: HeadersFlags::END_HEADERS | HeadersFlags::END_STREAM,
        priority: None,
        fragment: Bytes::from_static(&[0x88]),
    })
    .await;
    assert_eq!(
        stream.recv().await,
        Some(StreamEvent::Headers {
            headers: vec![(":status".to_owned(), "200".to_owned())],
            end_stream: true,
        })
    );
    assert_eq!(stream.recv().await, None);

    // with the last stream closed, the duplex closes
    peer.expect_eof().await;
}

#[tokio::test]
async fn terminate_always_resolves() {
    init_logging();
    let (client_io, peer_io) = tokio::io::duplex(64 * 1024);
    let (conn, _incoming) = Connection::client(client_io, ClientOptions::default());
    let mut peer = Peer::new(peer_io);
    peer.server_handshake().await;

    conn.terminate().await;
    let goaway = peer.read_frame().await;
    assert!(matches!(
        goaway,
        Frame::GoAway {
            error: ErrorType::NoError,
            ..
        }
    ));
    peer.expect_eof().await;

    // terminating again is still a resolved no-op
    conn.terminate().await;
    assert_eq!(
        conn.ping().await.unwrap_err(),
        TransportError::Terminated(ErrorType::NoError)
    );
}

#[tokio::test]
async fn settings_change_resolves_on_ack() {
    init_logging();
    let (client_io, peer_io) = tokio::io::duplex(64 * 1024);
    let (conn, _incoming) = Connection::client(client_io, ClientOptions::default());
    let mut peer = Peer::new(peer_io);
    peer.server_handshake().await;

    let (result, ()) = tokio::join!(
        conn.change_settings(vec![(SettingsParameter::MaxConcurrentStreams, 10)]),
        async {
            let frame = peer.read_frame().await;
            let Frame::Settings { flags, params } = frame else {
                panic!("expected SETTINGS");
            };
            assert!(!flags.contains(SettingsFlags::ACK));
            assert_eq!(params, vec![(SettingsParameter::MaxConcurrentStreams, 10)]);
            peer.write_frame(settings_ack()).await;
        }
    );
    result.unwrap();
}

#[tokio::test]
async fn illegal_local_setting_fails_fast() {
    init_logging();
    let (client_io, peer_io) = tokio::io::duplex(64 * 1024);
    let (conn, _incoming) = Connection::client(client_io, ClientOptions::default());
    let mut peer = Peer::new(peer_io);
    peer.server_handshake().await;

    assert_eq!(
        conn.change_settings(vec![(SettingsParameter::InitialWindowSize, U31_MAX + 1)])
            .await
            .unwrap_err(),
        TransportError::InvalidSetting
    );
}

#[tokio::test]
async fn initial_window_size_boundaries() {
    init_logging();
    // 2^31-1 is accepted
    let (client_io, peer_io) = tokio::io::duplex(64 * 1024);
    let (conn, _incoming) = Connection::client(client_io, ClientOptions::default());
    let mut peer = Peer::new(peer_io);
    peer.server_handshake_with(vec![(SettingsParameter::InitialWindowSize, U31_MAX)])
        .await;
    let (result, ()) = tokio::join!(conn.ping(), async {
        let Frame::Ping { payload, .. } = peer.read_frame().await else {
            panic!("expected PING");
        };
        peer.write_frame(Frame::Ping {
            flags: PingFlags::ACK,
            payload,
        })
        .await;
    });
    result.unwrap();

    // 2^31 is a flow-control error
    let (client_io, peer_io) = tokio::io::duplex(64 * 1024);
    let (_conn, _incoming) = Connection::client(client_io, ClientOptions::default());
    let mut peer = Peer::new(peer_io);
    peer.reader.read_preface().await.unwrap();
    let frame = peer.read_frame().await;
    assert!(matches!(frame, Frame::Settings { .. }));
    peer.write_frame(settings(vec![(
        SettingsParameter::InitialWindowSize,
        U31_MAX + 1,
    )]))
    .await;
    let goaway = peer.read_frame().await;
    let Frame::GoAway { error, .. } = goaway else {
        panic!("expected GOAWAY, got {goaway:?}");
    };
    assert_eq!(error, ErrorType::FlowControlError);
}

#[tokio::test]
async fn max_frame_size_boundaries_accepted() {
    init_logging();
    for value in [16_384u32, 16_777_215] {
        let (client_io, peer_io) = tokio::io::duplex(64 * 1024);
        let (conn, _incoming) = Connection::client(client_io, ClientOptions::default());
        let mut peer = Peer::new(peer_io);
        peer.server_handshake_with(vec![(SettingsParameter::MaxFrameSize, value)])
            .await;
        let (result, ()) = tokio::join!(conn.ping(), async {
            let Frame::Ping { payload, .. } = peer.read_frame().await else {
                panic!("expected PING");
            };
            peer.write_frame(Frame::Ping {
                flags: PingFlags::ACK,
                payload,
            })
            .await;
        });
        result.unwrap();
    }
}

#[tokio::test]
async fn zero_connection_window_update_rejected() {
    init_logging();
    let (client_io, peer_io) = tokio::io::duplex(64 * 1024);
    let (_conn, _incoming) = Connection::client(client_io, ClientOptions::default());
    let mut peer = Peer::new(peer_io);
    peer.server_handshake().await;

    peer.write_frame(Frame::WindowUpdate {
        stream: 0,
        increment: 0,
    })
    .await;
    let goaway = peer.read_frame().await;
    let Frame::GoAway { error, .. } = goaway else {
        panic!("expected GOAWAY, got {goaway:?}");
    };
    assert_eq!(error, ErrorType::FlowControlError);
}

#[tokio::test]
async fn oversized_frame_rejected() {
    init_logging();
    let (client_io, peer_io) = tokio::io::duplex(128 * 1024);
    let (_conn, _incoming) = Connection::client(client_io, ClientOptions::default());
    let mut peer = Peer::new(peer_io);
    peer.server_handshake().await;

    peer.write_frame(Frame::Data {
        stream: sid(1),
        flags: DataFlags::empty(),
        data: Bytes::from(vec![0u8; 16_385]),
        pad: 0,
    })
    .await;
    let goaway = peer.read_frame().await;
    let Frame::GoAway { error, .. } = goaway else {
        panic!("expected GOAWAY, got {goaway:?}");
    };
    assert_eq!(error, ErrorType::FrameSizeError);
}

#[tokio::test]
async fn reset_goes_out_on_the_wire() {
    init_logging();
    let (client_io, peer_io) = tokio::io::duplex(64 * 1024);
    let (conn, _incoming) = Connection::client(client_io, ClientOptions::default());
    let mut peer = Peer::new(peer_io);
    peer.server_handshake().await;

    let stream = conn.open_stream(request_headers(), false).await.unwrap();
    let id = stream.id();
    let frame = peer.read_frame().await;
    assert!(matches!(frame, Frame::Headers { .. }));

    stream.reset(ErrorType::Cancel).await;
    let frame = peer.read_frame().await;
    assert_eq!(
        frame,
        Frame::ResetStream {
            stream: id,
            error: ErrorType::Cancel,
        }
    );
}

#[tokio::test]
async fn trailers_follow_data() {
    init_logging();
    let (client_io, peer_io) = tokio::io::duplex(64 * 1024);
    let (conn, _incoming) = Connection::client(client_io, ClientOptions::default());
    let mut peer = Peer::new(peer_io);
    peer.server_handshake().await;

    let stream = conn.open_stream(request_headers(), false).await.unwrap();
    let id = stream.id();
    let frame = peer.read_frame().await;
    assert!(matches!(frame, Frame::Headers { .. }));

    stream
        .send_data(Bytes::from_static(b"body"), false)
        .await
        .unwrap();
    stream
        .send_trailers(vec![("x-checksum".to_owned(), "0".to_owned())])
        .await
        .unwrap();

    let frame = peer.read_frame().await;
    assert_eq!(
        frame,
        Frame::Data {
            stream: id,
            flags: DataFlags::empty(),
            data: Bytes::from_static(b"body"),
            pad: 0,
        }
    );
    let frame = peer.read_frame().await;
    let Frame::Headers { stream: s, flags, .. } = frame else {
        panic!("expected trailing HEADERS, got {frame:?}");
    };
    assert_eq!(s, id);
    assert!(flags.contains(HeadersFlags::END_STREAM));
    assert!(flags.contains(HeadersFlags::END_HEADERS));
}

#[tokio::test]
async fn server_push_end_to_end() {
    init_logging();
    // two real endpoints wired back to back
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (client, mut client_incoming) = Connection::client(
        client_io,
        ClientOptions {
            allow_server_push: true,
        },
    );
    let (_server, mut server_incoming) = Connection::server(server_io);

    // a ping roundtrip guarantees both sides finished the handshake
    client.ping().await.unwrap();

    let mut stream = client.open_stream(request_headers(), true).await.unwrap();
    let request = server_incoming.accept().await.unwrap();
    assert_eq!(request.headers, request_headers());
    assert!(request.end_stream);

    // server promises a push on the request stream, then answers both
    let pushed = request
        .stream
        .push(vec![(":path".to_owned(), "/style.css".to_owned())])
        .await
        .unwrap();
    assert_eq!(pushed.id().get(), 2);

    let mut promised = client_incoming.accept().await.unwrap();
    assert_eq!(
        promised.headers,
        vec![(":path".to_owned(), "/style.css".to_owned())]
    );
    assert!(promised.end_stream);

    request
        .stream
        .send_headers(vec![(":status".to_owned(), "200".to_owned())], true)
        .await
        .unwrap();
    pushed
        .send_headers(vec![(":status".to_owned(), "200".to_owned())], false)
        .await
        .unwrap();
    pushed
        .send_data(Bytes::from_static(b"body{}"), true)
        .await
        .unwrap();

    assert_eq!(
        stream.recv().await,
        Some(StreamEvent::Headers {
            headers: vec![(":status".to_owned(), "200".to_owned())],
            end_stream: true,
        })
    );
    assert_eq!(
        promised.stream.recv().await,
        Some(StreamEvent::Headers {
            headers: vec![(":status".to_owned(), "200".to_owned())],
            end_stream: false,
        })
    );
    assert_eq!(
        promised.stream.recv().await,
        Some(StreamEvent::Data {
            data: Bytes::from_static(b"body{}"),
            end_stream: true,
        })
    );
}

#[tokio::test]
async fn push_to_unwilling_client_is_protocol_error() {
    init_logging();
    let (client_io, peer_io) = tokio::io::duplex(64 * 1024);
    let (_conn, _incoming) = Connection::client(client_io, ClientOptions::default());
    let mut peer = Peer::new(peer_io);
    peer.server_handshake().await;

    peer.write_frame(Frame::PushPromise {
        stream: sid(1),
        flags: http2_core::PushPromiseFlags::END_HEADERS,
        promised: sid(2),
        fragment: Bytes::from_static(&[0x88]),
    })
    .await;
    let goaway = peer.read_frame().await;
    let Frame::GoAway { error, .. } = goaway else {
        panic!("expected GOAWAY, got {goaway:?}");
    };
    assert_eq!(error, ErrorType::ProtocolError);
}
