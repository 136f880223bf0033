use std::{
    future::Future,
    io,
    pin::Pin,
    sync::Mutex,
    task::{Context, Poll},
    time::Duration,
};

use msgpack_rpc::{
    client::{Configuration, ConnectionState, Session, StreamConnector},
    params, Error, Message, Value,
};
use msgpack_rpc_codec::{encode, FrameReader, MalformedMessage};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf},
    sync::mpsc,
};

#[derive(Debug)]
struct DuplexConnector(Mutex<Option<DuplexStream>>);

impl DuplexConnector {
    fn new(stream: DuplexStream) -> Self {
        Self(Mutex::new(Some(stream)))
    }

    fn refusing() -> Self {
        Self(Mutex::new(None))
    }
}

impl StreamConnector for DuplexConnector {
    type Stream = DuplexStream;

    fn connect_stream(
        &self,
        _address: &str,
    ) -> impl Future<Output = io::Result<Self::Stream>> + Send {
        let stream = self.0.lock().expect("test mutex").take();
        async move {
            stream.ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "no stream"))
        }
    }
}

/// The server end of a session's stream.
struct Peer {
    stream: DuplexStream,
    frames: FrameReader,
}

impl Peer {
    fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            frames: FrameReader::new(1 << 20),
        }
    }

    async fn try_next_message(&mut self) -> Option<Message> {
        loop {
            if let Some(message) = self
                .frames
                .next_message()
                .expect("client sends well-formed messages")
            {
                return Some(message);
            }
            let read = self
                .stream
                .read_buf(self.frames.receive_buffer())
                .await
                .expect("peer read");
            if read == 0 {
                return None;
            }
        }
    }

    async fn next_request(&mut self) -> (u32, String, Vec<Value>) {
        match self.try_next_message().await {
            Some(Message::Request { id, method, params }) => (id, method, params),
            other => panic!("expected a request, got {other:?}"),
        }
    }

    async fn send(&mut self, message: &Message) {
        self.send_raw(&encode(message)).await;
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("peer write");
        self.stream.flush().await.expect("peer flush");
    }

    async fn read_raw(&mut self, length: usize) -> Vec<u8> {
        let mut bytes = vec![0; length];
        self.stream
            .read_exact(&mut bytes)
            .await
            .expect("peer read_exact");
        bytes
    }

    async fn expect_eof(&mut self) {
        let mut bytes = [0; 16];
        let read = tokio::time::timeout(Duration::from_secs(5), self.stream.read(&mut bytes))
            .await
            .expect("client hangs up")
            .expect("peer read");
        assert_eq!(0, read, "no more bytes from the client");
    }
}

async fn connected(configuration: Configuration) -> (Session, Peer) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (client, server) = tokio::io::duplex(64 * 1024);
    let session = Session::new(configuration);
    session
        .connect_with(&DuplexConnector::new(client), "duplex")
        .await
        .expect("duplex connects");
    assert_eq!(ConnectionState::Connected, session.state());
    (session, Peer::new(server))
}

fn spawn_call(
    session: &Session,
    method: &str,
    params: Vec<Value>,
) -> tokio::task::JoinHandle<msgpack_rpc::Result<Value>> {
    let session = session.clone();
    let method = method.to_string();
    tokio::spawn(async move { session.call(method, params).await })
}

async fn wait_until_closed(session: &Session) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while session.state() != ConnectionState::Closed {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("session closes");
}

async fn wait_for_in_flight(session: &Session, in_flight: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while session.in_flight() != in_flight {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("in flight count settles");
}

fn strings(values: &[&str]) -> Value {
    Value::Array(values.iter().map(|value| Value::from(*value)).collect())
}

#[tokio::test]
async fn list_paths_wire_exchange() {
    let (session, mut peer) = connected(Configuration::default()).await;
    let call = spawn_call(&session, "list_paths", params![]);

    let mut request = vec![0x94, 0x00, 0x00, 0xaa];
    request.extend_from_slice(b"list_paths");
    request.push(0x90);
    assert_eq!(request, peer.read_raw(request.len()).await);

    peer.send_raw(&[0x94, 0x01, 0x00, 0xc0, 0x92, 0xa1, b'a', 0xa1, b'b'])
        .await;
    let result = call.await.expect("call task").expect("call succeeds");
    assert_eq!(strings(&["a", "b"]), result);
    assert_eq!(0, session.in_flight());
}

#[tokio::test]
async fn responses_in_any_order() {
    let (session, mut peer) = connected(Configuration::default()).await;
    let calls: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .map(|method| (method, spawn_call(&session, method, params![])))
        .collect();

    let mut requests = Vec::new();
    for _ in 0..3 {
        let (id, method, _params) = peer.next_request().await;
        requests.push((id, method));
    }
    assert_eq!(3, session.in_flight());
    for (id, method) in requests.into_iter().rev() {
        peer.send(&Message::result(id, method.into())).await;
    }

    for (method, call) in calls {
        let result = call.await.expect("call task").expect("call succeeds");
        assert_eq!(Value::from(method), result);
    }
    assert_eq!(0, session.in_flight());
}

#[tokio::test]
async fn concurrent_callers() {
    let (session, mut peer) = connected(Configuration::default()).await;
    let server = tokio::spawn(async move {
        while let Some(message) = peer.try_next_message().await {
            if let Message::Request { id, mut params, .. } = message {
                peer.send(&Message::result(id, params.remove(0))).await;
            }
        }
    });

    let calls: Vec<_> = (0..64_u32)
        .map(|i| (i, spawn_call(&session, "echo", params![i])))
        .collect();
    for (i, call) in calls {
        let result = call.await.expect("call task").expect("call succeeds");
        assert_eq!(Value::from(i), result);
    }

    session.close().await;
    server.await.expect("server sees the hangup");
}

#[tokio::test]
async fn remote_error_is_not_a_connection_error() {
    let (session, mut peer) = connected(Configuration::default()).await;
    let call = spawn_call(&session, "nope", params![]);
    let (id, _method, _params) = peer.next_request().await;
    let error = Value::Array(vec![0.into(), "Invalid method".into()]);
    peer.send(&Message::error(id, error.clone())).await;

    assert!(matches!(
        call.await.expect("call task"),
        Err(Error::Remote(remote)) if remote == error
    ));
    assert_eq!(ConnectionState::Connected, session.state());

    let call = spawn_call(&session, "yep", params![]);
    let (id, _method, _params) = peer.next_request().await;
    peer.send(&Message::result(id, Value::Nil)).await;
    assert_eq!(Value::Nil, call.await.expect("call task").expect("nil result"));
}

#[tokio::test]
async fn notifications_arrive_in_order() {
    let (notifications, mut received) = mpsc::unbounded_channel();
    let (session, mut peer) = connected(Configuration::default()).await;
    session.on_notification(move |method: String, params: Vec<Value>| {
        let _ = notifications.send((method, params));
    });

    for i in 0..3 {
        peer.send(&Message::notification("redraw", params![i])).await;
    }
    for i in 0..3 {
        assert_eq!(
            Some(("redraw".to_string(), params![i])),
            received.recv().await
        );
    }
    assert_eq!(0, session.in_flight());
    assert_eq!(ConnectionState::Connected, session.state());
}

#[tokio::test]
async fn notification_between_responses() {
    let (notifications, mut received) = mpsc::unbounded_channel();
    let (session, mut peer) = connected(Configuration::default()).await;
    session.on_notification(move |method: String, _params: Vec<Value>| {
        let _ = notifications.send(method);
    });

    let call = spawn_call(&session, "slow", params![]);
    let (id, _method, _params) = peer.next_request().await;
    peer.send(&Message::notification("progress", params![])).await;
    assert_eq!(Some("progress".to_string()), received.recv().await);
    assert_eq!(1, session.in_flight());

    peer.send(&Message::result(id, true.into())).await;
    assert_eq!(
        Value::from(true),
        call.await.expect("call task").expect("call succeeds")
    );
}

#[tokio::test]
async fn notify_wire_bytes() {
    let (session, mut peer) = connected(Configuration::default()).await;
    session
        .notify("event", params![])
        .await
        .expect("notification is written");

    let mut expected = vec![0x93, 0x02, 0xa5];
    expected.extend_from_slice(b"event");
    expected.push(0x90);
    assert_eq!(expected, peer.read_raw(expected.len()).await);
    assert_eq!(0, session.in_flight());
}

#[tokio::test]
async fn byte_at_a_time() {
    let (notifications, mut received) = mpsc::unbounded_channel();
    let (session, mut peer) = connected(Configuration::default()).await;
    session.on_notification(move |method: String, _params: Vec<Value>| {
        let _ = notifications.send(method);
    });
    let call = spawn_call(&session, "list_paths", params![]);
    let (id, _method, _params) = peer.next_request().await;

    let mut bytes = encode(&Message::notification("first", params![]));
    bytes.extend(encode(&Message::result(id, strings(&["a", "b"]))));
    for byte in bytes {
        peer.send_raw(&[byte]).await;
        tokio::task::yield_now().await;
    }

    assert_eq!(Some("first".to_string()), received.recv().await);
    assert_eq!(
        strings(&["a", "b"]),
        call.await.expect("call task").expect("call succeeds")
    );
}

#[tokio::test]
async fn malformed_response_closes_the_session() {
    let (session, mut peer) = connected(Configuration::default()).await;
    let call = spawn_call(&session, "list_paths", params![]);
    let _request = peer.next_request().await;

    // [1, 0]
    peer.send_raw(&[0x92, 0x01, 0x00]).await;
    let wrong_arity = MalformedMessage::WrongArity {
        message_type: 1,
        length: 2,
    };
    assert!(matches!(
        call.await.expect("call task"),
        Err(Error::MalformedMessage(e)) if e == wrong_arity
    ));

    wait_until_closed(&session).await;
    assert!(matches!(
        session.close_reason(),
        Some(Error::MalformedMessage(e)) if e == wrong_arity
    ));
    assert!(matches!(
        session.call("list_paths", params![]).await,
        Err(Error::ConnectionClosed)
    ));
    assert_eq!(0, session.in_flight());
}

#[tokio::test]
async fn unknown_response_id_closes_the_session() {
    let (session, mut peer) = connected(Configuration::default()).await;
    let call = spawn_call(&session, "waiting", params![]);
    let (id, _method, _params) = peer.next_request().await;

    peer.send(&Message::result(id + 7, Value::Nil)).await;
    assert!(matches!(
        call.await.expect("call task"),
        Err(Error::UnknownCorrelationId(unknown)) if unknown == id + 7
    ));
    wait_until_closed(&session).await;
    assert!(matches!(
        session.close_reason(),
        Some(Error::UnknownCorrelationId(unknown)) if unknown == id + 7
    ));
}

#[tokio::test]
async fn server_request_closes_the_session() {
    let (session, mut peer) = connected(Configuration::default()).await;
    peer.send(&Message::request(3, "serve_me", params![])).await;

    wait_until_closed(&session).await;
    assert!(matches!(
        session.close_reason(),
        Some(Error::UnexpectedRequest { id: 3, method }) if method == "serve_me"
    ));
    peer.expect_eof().await;
}

#[tokio::test]
async fn oversized_frame_closes_the_session() {
    let mut configuration = Configuration::default();
    configuration.max_buffer_length(16);
    let (session, mut peer) = connected(configuration).await;

    let bytes = encode(&Message::notification(
        "huge",
        vec![Value::Binary(vec![0; 64])],
    ));
    peer.send_raw(&bytes[..40]).await;

    wait_until_closed(&session).await;
    assert!(matches!(
        session.close_reason(),
        Some(Error::MalformedMessage(MalformedMessage::FrameTooLarge { limit: 16 }))
    ));
}

#[tokio::test]
async fn close_cancels_pending_calls() {
    let (session, mut peer) = connected(Configuration::default()).await;
    let calls: Vec<_> = (0..3)
        .map(|i| spawn_call(&session, "forever", params![i]))
        .collect();
    for _ in 0..3 {
        let _request = peer.next_request().await;
    }
    assert_eq!(3, session.in_flight());

    session.close().await;
    assert_eq!(ConnectionState::Closed, session.state());
    assert_eq!(0, session.in_flight());
    assert!(session.close_reason().is_none(), "closed on purpose");
    for call in calls {
        assert!(matches!(
            call.await.expect("call task"),
            Err(Error::ConnectionClosed)
        ));
    }
    peer.expect_eof().await;

    session.close().await;
    assert_eq!(ConnectionState::Closed, session.state());
    assert!(matches!(
        session.call("again", params![]).await,
        Err(Error::ConnectionClosed)
    ));
    assert!(matches!(
        session
            .connect_with(&DuplexConnector::refusing(), "duplex")
            .await,
        Err(Error::ConnectionClosed)
    ));
}

#[tokio::test]
async fn peer_hangup_cancels_pending_calls() {
    let (session, mut peer) = connected(Configuration::default()).await;
    let call = spawn_call(&session, "forever", params![]);
    let _request = peer.next_request().await;
    drop(peer);

    assert!(matches!(
        call.await.expect("call task"),
        Err(Error::ConnectionClosed)
    ));
    wait_until_closed(&session).await;
    assert!(matches!(
        session.close_reason(),
        Some(Error::ConnectionClosed)
    ));
}

#[tokio::test]
async fn dropping_the_session_hangs_up() {
    let (session, mut peer) = connected(Configuration::default()).await;
    drop(session);
    peer.expect_eof().await;
}

#[tokio::test]
async fn failed_connect_can_be_retried() {
    let _ = env_logger::builder().is_test(true).try_init();
    let session = Session::new(Configuration::default());
    assert!(matches!(
        session.call("early", params![]).await,
        Err(Error::NotConnected)
    ));
    assert!(matches!(
        session.notify("early", params![]).await,
        Err(Error::NotConnected)
    ));

    assert!(matches!(
        session
            .connect_with(&DuplexConnector::refusing(), "duplex")
            .await,
        Err(Error::ConnectFailed(e)) if e.kind() == io::ErrorKind::ConnectionRefused
    ));
    assert_eq!(ConnectionState::Disconnected, session.state());

    let (client, server) = tokio::io::duplex(1024);
    session
        .connect_with(&DuplexConnector::new(client), "duplex")
        .await
        .expect("second attempt connects");
    assert_eq!(ConnectionState::Connected, session.state());
    assert!(matches!(
        session
            .connect_with(&DuplexConnector::refusing(), "duplex")
            .await,
        Err(Error::AlreadyConnected)
    ));

    let mut peer = Peer::new(server);
    let call = spawn_call(&session, "now", params![]);
    let (id, method, _params) = peer.next_request().await;
    assert_eq!("now", method);
    peer.send(&Message::result(id, 1.into())).await;
    assert_eq!(Value::from(1), call.await.expect("call task").expect("call succeeds"));
}

#[tokio::test]
async fn call_timeout_abandons_the_call() {
    let mut configuration = Configuration::default();
    configuration.call_timeout(Some(Duration::from_millis(50)));
    let (session, mut peer) = connected(configuration).await;

    assert!(matches!(
        session.call("slow", params![]).await,
        Err(Error::TimedOut)
    ));
    assert_eq!(1, session.in_flight(), "the response is still owed");

    let (id, _method, _params) = peer.next_request().await;
    peer.send(&Message::result(id, "late".into())).await;
    wait_for_in_flight(&session, 0).await;
    assert_eq!(ConnectionState::Connected, session.state());

    let completion = session
        .send_call("fast", params![])
        .await
        .expect("request is written");
    let (id, _method, _params) = peer.next_request().await;
    assert_eq!(completion.id(), id);
    peer.send(&Message::result(id, "on time".into())).await;
    assert_eq!(Value::from("on time"), completion.await.expect("call succeeds"));
}

#[tokio::test]
async fn typed_results() {
    let (session, mut peer) = connected(Configuration::default()).await;
    let server = tokio::spawn(async move {
        let (id, _method, _params) = peer.next_request().await;
        peer.send(&Message::result(id, strings(&["/usr/share/nvim", "/etc/xdg/nvim"])))
            .await;
        let (id, _method, _params) = peer.next_request().await;
        peer.send(&Message::result(id, "not a list".into())).await;
        peer
    });

    let paths: Vec<String> = session
        .call_typed("vim_list_runtime_paths", params![])
        .await
        .expect("paths deserialize");
    assert_eq!(vec!["/usr/share/nvim", "/etc/xdg/nvim"], paths);

    assert!(matches!(
        session
            .call_typed::<Vec<String>>("vim_list_runtime_paths", params![])
            .await,
        Err(Error::InvalidResult(_))
    ));
    let _peer = server.await.expect("server task");
    assert_eq!(ConnectionState::Connected, session.state());
}

#[derive(Debug)]
struct BrokenWrites;

impl AsyncRead for BrokenWrites {
    fn poll_read(
        self: Pin<&mut Self>,
        _context: &mut Context<'_>,
        _buffer: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Pending
    }
}

impl AsyncWrite for BrokenWrites {
    fn poll_write(
        self: Pin<&mut Self>,
        _context: &mut Context<'_>,
        _buffer: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
    }

    fn poll_flush(self: Pin<&mut Self>, _context: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _context: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[derive(Debug)]
struct BrokenWritesConnector;

impl StreamConnector for BrokenWritesConnector {
    type Stream = BrokenWrites;

    fn connect_stream(
        &self,
        _address: &str,
    ) -> impl Future<Output = io::Result<Self::Stream>> + Send {
        async { Ok(BrokenWrites) }
    }
}

#[tokio::test]
async fn write_failure_fails_only_that_call() {
    let _ = env_logger::builder().is_test(true).try_init();
    let session = Session::new(Configuration::default());
    session
        .connect_with(&BrokenWritesConnector, "broken")
        .await
        .expect("connects");

    assert!(matches!(
        session.call("doomed", params![]).await,
        Err(Error::TransportFailure(e)) if e.kind() == io::ErrorKind::BrokenPipe
    ));
    assert_eq!(0, session.in_flight());
    assert!(matches!(
        session.notify("doomed", params![]).await,
        Err(Error::TransportFailure(_))
    ));
    assert_eq!(ConnectionState::Connected, session.state());
    session.close().await;
}

/// Never reads anything and never finishes shutting down.
#[derive(Debug)]
struct StalledStream {
    accept_writes: bool,
}

impl AsyncRead for StalledStream {
    fn poll_read(
        self: Pin<&mut Self>,
        _context: &mut Context<'_>,
        _buffer: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Pending
    }
}

impl AsyncWrite for StalledStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _context: &mut Context<'_>,
        buffer: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.accept_writes {
            Poll::Ready(Ok(buffer.len()))
        } else {
            Poll::Pending
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _context: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _context: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Pending
    }
}

#[derive(Debug)]
struct StalledConnector {
    accept_writes: bool,
}

impl StreamConnector for StalledConnector {
    type Stream = StalledStream;

    fn connect_stream(
        &self,
        _address: &str,
    ) -> impl Future<Output = io::Result<Self::Stream>> + Send {
        let accept_writes = self.accept_writes;
        async move { Ok(StalledStream { accept_writes }) }
    }
}

async fn stalled(accept_writes: bool) -> Session {
    let _ = env_logger::builder().is_test(true).try_init();
    let session = Session::new(Configuration::default());
    session
        .connect_with(&StalledConnector { accept_writes }, "stalled")
        .await
        .expect("connects");
    session
}

#[tokio::test]
async fn close_does_not_wait_for_a_stuck_shutdown() {
    let session = stalled(true).await;
    let call = spawn_call(&session, "forever", params![]);
    wait_for_in_flight(&session, 1).await;

    tokio::time::timeout(Duration::from_secs(5), session.close())
        .await
        .expect("close returns while the stream is still shutting down");
    assert_eq!(ConnectionState::Closed, session.state());
    assert!(matches!(
        call.await.expect("call task"),
        Err(Error::ConnectionClosed)
    ));
}

#[tokio::test]
async fn dropped_close_still_closes() {
    use futures::FutureExt;

    let session = stalled(true).await;
    let call = spawn_call(&session, "forever", params![]);
    wait_for_in_flight(&session, 1).await;

    let _ = session.close().now_or_never();
    assert_eq!(ConnectionState::Closed, session.state());
    assert_eq!(0, session.in_flight());
    assert!(matches!(
        call.await.expect("call task"),
        Err(Error::ConnectionClosed)
    ));
}

#[tokio::test]
async fn close_during_a_write_is_not_a_transport_failure() {
    let session = stalled(false).await;
    let call = spawn_call(&session, "never_written", params![]);
    wait_for_in_flight(&session, 1).await;
    tokio::task::yield_now().await;

    session.close().await;
    assert!(matches!(
        call.await.expect("call task"),
        Err(Error::ConnectionClosed)
    ));
    assert!(matches!(
        session.notify("after", params![]).await,
        Err(Error::ConnectionClosed)
    ));
}

#[tokio::test]
async fn tcp_round_trip() {
    let _ = env_logger::builder().is_test(true).try_init();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let port = listener.local_addr().expect("local address").port();
    let server = tokio::spawn(async move {
        let (mut stream, _address) = listener.accept().await.expect("accept");
        let mut frames = FrameReader::new(1024);
        let id = loop {
            match frames.next_message().expect("well-formed request") {
                Some(Message::Request { id, .. }) => break id,
                Some(other) => panic!("expected a request, got {other:?}"),
                None => {
                    let read = stream
                        .read_buf(frames.receive_buffer())
                        .await
                        .expect("server read");
                    assert_ne!(0, read, "client hung up early");
                }
            }
        };
        stream
            .write_all(&encode(&Message::result(id, "pong".into())))
            .await
            .expect("server write");
        stream
    });

    let session = Session::new(Configuration::default());
    session.connect("127.0.0.1", port).await.expect("tcp connects");
    assert_eq!(
        Value::from("pong"),
        session.call("ping", params![]).await.expect("call succeeds")
    );
    let _stream = server.await.expect("server task");
    session.close().await;
}
