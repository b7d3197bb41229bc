//! End-to-end exchanges between two endpoints over loopback TCP
// (c) 2025 Ross Younger

use std::collections::VecDeque;
use std::io::{BufRead as _, BufReader, Write as _};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use pretty_assertions::assert_eq;
use sha2::{Digest as _, Sha256};

use mxp::protocol::attachment::spool_path;
use mxp::{
    DataStream, ExchangeChannel, ExchangeError, ExchangeStream, PendingRequestQueue,
    RemoteIdentity, RequestMessage, ResponseMessage,
};

/// A connected pair of sockets: (client end, server end)
fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    (client, server)
}

fn channel_over(socket: TcpStream) -> ExchangeChannel<TcpStream, TcpStream> {
    let writer = socket.try_clone().unwrap();
    ExchangeChannel::new(writer, socket)
}

/// In-memory pending-request queue shared between the serving thread and
/// the test's assertions.
#[derive(Clone, Default)]
struct TestQueue {
    inner: Arc<Mutex<TestQueueInner>>,
}

#[derive(Default)]
struct TestQueueInner {
    pending: VecDeque<RequestMessage>,
    responses: Vec<ResponseMessage>,
}

impl TestQueue {
    fn seeded<I: IntoIterator<Item = RequestMessage>>(requests: I) -> Self {
        let queue = Self::default();
        queue.inner.lock().unwrap().pending.extend(requests);
        queue
    }

    fn responses(&self) -> Vec<ResponseMessage> {
        std::mem::take(&mut self.inner.lock().unwrap().responses)
    }
}

impl PendingRequestQueue for TestQueue {
    fn dequeue(&mut self) -> Option<RequestMessage> {
        self.inner.lock().unwrap().pending.pop_front()
    }

    fn apply_response(&mut self, response: ResponseMessage) {
        self.inner.lock().unwrap().responses.push(response);
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

// =====================================================================================

#[test]
fn client_single_request() {
    let (client_sock, server_sock) = tcp_pair();

    let server = thread::spawn(move || {
        let mut channel = channel_over(server_sock);
        channel.exchange_as_server(
            |req: RequestMessage| {
                Ok(ResponseMessage::ok(
                    req.id,
                    bson::Bson::String("pong".to_string()),
                ))
            },
            |_: &RemoteIdentity| TestQueue::default(),
        )
    });

    let mut channel = channel_over(client_sock);
    let response = channel
        .exchange_as_client(RequestMessage::new("R1", "Echo", "Ping"))
        .unwrap();
    assert_eq!(response.id, "R1");
    assert_eq!(response.result, Some(bson::Bson::String("pong".to_string())));
    assert!(response.error.is_none());

    drop(channel); // hang up; the server loop ends cleanly
    server.join().unwrap().unwrap();
}

#[test]
fn client_reuses_connection_without_reidentifying() {
    let (client_sock, server_sock) = tcp_pair();

    let invocations = Arc::new(AtomicUsize::new(0));
    let counted = invocations.clone();
    let server = thread::spawn(move || {
        let mut channel = channel_over(server_sock);
        channel.exchange_as_server(
            move |req: RequestMessage| {
                let _ = counted.fetch_add(1, Ordering::SeqCst);
                Ok(ResponseMessage::ok(req.id, bson::Bson::Null))
            },
            |_: &RemoteIdentity| TestQueue::default(),
        )
    });

    let mut channel = channel_over(client_sock);
    let first = channel
        .exchange_as_client(RequestMessage::new("R1", "Echo", "Ping"))
        .unwrap();
    assert_eq!(first.id, "R1");
    // The second exchange repeats only HELLO/PROCEED/request/response; were
    // a second identity line sent, the server would refuse it where HELLO
    // belongs and this exchange would fail.
    let second = channel
        .exchange_as_client(RequestMessage::new("R2", "Echo", "Ping"))
        .unwrap();
    assert_eq!(second.id, "R2");

    drop(channel);
    server.join().unwrap().unwrap();
    assert_eq!(invocations.load(Ordering::SeqCst), 2);
}

#[test]
fn subscriber_drains_queue_then_sentinel() {
    let (subscriber_sock, server_sock) = tcp_pair();

    let queue = TestQueue::seeded(
        ["Q1", "Q2", "Q3"]
            .into_iter()
            .map(|id| RequestMessage::new(id, "Deploy", "Run")),
    );
    let server_queue = queue.clone();
    let server = thread::spawn(move || {
        let mut channel = channel_over(server_sock);
        channel.exchange_as_server(
            |_req: RequestMessage| anyhow::bail!("no push clients in this test"),
            move |_: &RemoteIdentity| server_queue,
        )
    });

    let mut channel = channel_over(subscriber_sock);
    let processed = channel
        .exchange_as_subscriber("poll://worker-1", |req: RequestMessage| {
            Ok(ResponseMessage::ok(
                req.id,
                bson::Bson::String("done".to_string()),
            ))
        })
        .unwrap();
    assert_eq!(processed, 3);

    server.join().unwrap().unwrap();
    let responses = queue.responses();
    let ids: Vec<&str> = responses.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, ["Q1", "Q2", "Q3"]);
    assert!(responses.iter().all(|r| r.error.is_none()));
}

#[test]
fn subscriber_with_no_work_processes_nothing() {
    let (subscriber_sock, server_sock) = tcp_pair();

    let server = thread::spawn(move || {
        let mut channel = channel_over(server_sock);
        channel.exchange_as_server(
            |_req: RequestMessage| anyhow::bail!("no push clients in this test"),
            |_: &RemoteIdentity| TestQueue::default(),
        )
    });

    let mut channel = channel_over(subscriber_sock);
    let processed = channel
        .exchange_as_subscriber("poll://worker-2", |_req: RequestMessage| {
            anyhow::bail!("there is no work to hand out")
        })
        .unwrap();
    assert_eq!(processed, 0);
    server.join().unwrap().unwrap();
}

#[test]
fn attachments_roundtrip_and_spools_are_deleted() {
    let (client_sock, server_sock) = tcp_pair();

    let server = thread::spawn(move || {
        let mut channel = channel_over(server_sock);
        channel.exchange_as_server(
            |mut req: RequestMessage| {
                let mut hashes = Vec::new();
                for stream in &mut req.attachments {
                    let id = stream.id();
                    let bytes = stream.read_to_vec()?;
                    anyhow::ensure!(
                        !spool_path(id).exists(),
                        "spool file for {id} should be deleted after the read"
                    );
                    hashes.push(bson::Bson::String(sha256_hex(&bytes)));
                }
                Ok(ResponseMessage::ok(req.id, bson::Bson::Array(hashes)))
            },
            |_: &RemoteIdentity| TestQueue::default(),
        )
    });

    let empty: Vec<u8> = Vec::new();
    let big: Vec<u8> = (0..200_000u32).map(|i| (i % 249) as u8).collect();
    let expected = bson::Bson::Array(vec![
        bson::Bson::String(sha256_hex(&empty)),
        bson::Bson::String(sha256_hex(&big)),
    ]);

    let mut request = RequestMessage::new("R1", "Blob", "Digest");
    request.attachments.push(DataStream::from_bytes(empty));
    request.attachments.push(DataStream::from_bytes(big));

    let mut channel = channel_over(client_sock);
    let response = channel.exchange_as_client(request).unwrap();
    assert_eq!(response.error, None);
    assert_eq!(response.result, Some(expected));

    drop(channel);
    server.join().unwrap().unwrap();
}

#[test]
fn handler_failure_travels_back_as_error_descriptor() {
    let (client_sock, server_sock) = tcp_pair();

    let server = thread::spawn(move || {
        let mut channel = channel_over(server_sock);
        channel.exchange_as_server(
            |_req: RequestMessage| {
                use anyhow::Context as _;
                Err(anyhow::anyhow!("widget not found"))
                    .context("while looking up widget")
                    .context("Inventory.Fetch failed")
            },
            |_: &RemoteIdentity| TestQueue::default(),
        )
    });

    let mut channel = channel_over(client_sock);
    let response = channel
        .exchange_as_client(RequestMessage::new("R1", "Inventory", "Fetch"))
        .unwrap();
    let error = response.error.expect("expected an error descriptor");
    // the innermost cause, not the wrapper chain
    assert_eq!(error.message, "widget not found");

    drop(channel);
    server.join().unwrap().unwrap();
}

#[test]
fn wrong_token_where_hello_expected_poisons_connection() {
    let (client_sock, server_sock) = tcp_pair();

    let server = thread::spawn(move || {
        let mut channel = channel_over(server_sock);
        channel.exchange_as_server(
            |req: RequestMessage| Ok(ResponseMessage::ok(req.id, bson::Bson::Null)),
            |_: &RemoteIdentity| TestQueue::default(),
        )
    });

    // A peer that identifies correctly, then breaks protocol.
    let mut raw = client_sock;
    raw.write_all(b"MX-CLIENT 1.0\n\nGREETINGS\n").unwrap();
    raw.flush().unwrap();

    let e = server.join().unwrap().unwrap_err();
    assert!(
        matches!(e, ExchangeError::UnexpectedToken { .. }),
        "unexpected error: {e}"
    );
    let msg = e.to_string();
    assert!(msg.contains("HELLO"), "{msg}");
    assert!(msg.contains("GREETINGS"), "{msg}");
}

#[test]
fn silent_close_awaiting_proceed_reads_as_rejection() {
    let (client_sock, server_sock) = tcp_pair();

    // A server that completes the identity exchange, then hangs up the
    // moment the client asks to proceed. This is the shape of an upstream
    // TLS trust rejection.
    let server = thread::spawn(move || {
        let mut reader = BufReader::new(server_sock.try_clone().unwrap());
        let mut line = String::new();
        let _ = reader.read_line(&mut line).unwrap(); // MX-CLIENT 1.0
        let _ = reader.read_line(&mut line).unwrap(); // blank
        let mut writer = server_sock;
        writer.write_all(b"MX-SERVER 1.0\n\n").unwrap();
        writer.flush().unwrap();
        let _ = reader.read_line(&mut line).unwrap(); // HELLO
        // ... and hang up without PROCEED
    });

    let mut channel = channel_over(client_sock);
    let e = channel
        .exchange_as_client(RequestMessage::new("R1", "Echo", "Ping"))
        .unwrap_err();
    assert!(
        matches!(e, ExchangeError::ConnectionInit(_)),
        "unexpected error: {e}"
    );
    assert!(
        matches!(e.root(), ExchangeError::Rejected),
        "expected a rejection, got: {e}"
    );

    server.join().unwrap();
}

#[test]
fn transport_failure_mid_poll_is_reported_to_the_queue() {
    let (subscriber_sock, server_sock) = tcp_pair();

    let queue = TestQueue::seeded([RequestMessage::new("Q1", "Deploy", "Run")]);
    let server_queue = queue.clone();
    let server = thread::spawn(move || {
        let mut channel = channel_over(server_sock);
        channel.exchange_as_server(
            |_req: RequestMessage| anyhow::bail!("no push clients in this test"),
            move |_: &RemoteIdentity| server_queue,
        )
    });

    // A subscriber that takes the first request and then vanishes without
    // answering it.
    let writer = subscriber_sock.try_clone().unwrap();
    let mut stream = ExchangeStream::new(writer, subscriber_sock);
    stream.identify_as_subscriber("poll://flaky").unwrap();
    let request = stream.receive_request().unwrap().unwrap();
    assert_eq!(request.id, "Q1");
    drop(stream);

    let e = server.join().unwrap().unwrap_err();
    assert!(matches!(e, ExchangeError::Io(_) | ExchangeError::Decode(_)), "{e}");

    // The in-flight request was resolved with an error response rather than
    // being silently lost.
    let responses = queue.responses();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].id, "Q1");
    let error = responses[0].error.as_ref().expect("expected an error descriptor");
    assert!(error.message.contains("exchange failed"), "{}", error.message);
}
