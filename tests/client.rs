//! Client-level tests over the HTTP/1.1 transport, against a raw TCP
//! server that captures what actually hits the wire.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// One captured request: the raw head and the body bytes.
#[derive(Debug)]
struct Captured {
    head: String,
    body: Vec<u8>,
}

struct TestServer {
    addr: SocketAddr,
    requests: mpsc::UnboundedReceiver<Captured>,
    connections: Arc<AtomicUsize>,
}

/// Serves every request on every connection with the same canned response
/// until the test drops the server.
async fn serve(response: &'static [u8]) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    let connections = Arc::new(AtomicUsize::new(0));
    let conn_count = Arc::clone(&connections);

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            conn_count.fetch_add(1, Ordering::SeqCst);
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut stream = stream;
                while let Some(captured) = read_request(&mut stream).await {
                    let _ = tx.send(captured);
                    if stream.write_all(response).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    TestServer {
        addr,
        requests: rx,
        connections,
    }
}

async fn read_request(stream: &mut TcpStream) -> Option<Captured> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(0) | Err(_) => return None,
            Ok(_) => buf.push(byte[0]),
        }
    }
    let head = String::from_utf8_lossy(&buf).into_owned();

    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())?
        })
        .unwrap_or(0);

    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        stream.read_exact(&mut body).await.ok()?;
    }
    Some(Captured { head, body })
}

#[tokio::test]
async fn get_round_trip() {
    let mut server = serve(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello").await;
    let client = httpc::Client::new();

    let url = format!("http://{}/greeting?lang=en", server.addr);
    let res = client.get(&url).send().await.unwrap();
    assert_eq!(res.status(), httpc::StatusCode::OK);
    assert_eq!(res.version(), httpc::Version::HTTP_11);
    assert_eq!(res.content_length(), Some(5));
    assert_eq!(res.text().await.unwrap(), "hello");

    let captured = server.requests.recv().await.unwrap();
    let request_line = captured.head.lines().next().unwrap();
    assert_eq!(request_line, "GET /greeting?lang=en HTTP/1.1");
    assert!(captured
        .head
        .lines()
        .any(|l| l.eq_ignore_ascii_case(&format!("host: {}", server.addr))));
}

#[tokio::test]
async fn post_sends_content_length_and_body() {
    let mut server = serve(b"HTTP/1.1 204 No Content\r\n\r\n").await;
    let client = httpc::Client::new();

    let url = format!("http://{}/upload", server.addr);
    let res = client.post(&url).body("abc").send().await.unwrap();
    assert_eq!(res.status(), httpc::StatusCode::NO_CONTENT);

    let captured = server.requests.recv().await.unwrap();
    assert!(captured
        .head
        .lines()
        .any(|l| l.eq_ignore_ascii_case("content-length: 3")));
    assert_eq!(captured.body, b"abc");
}

#[tokio::test]
async fn streaming_body_uses_chunked_encoding() {
    let mut server = serve(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
    let client = httpc::Client::new();

    let chunks = futures_util::stream::iter(vec![
        Ok::<_, httpc::BoxError>(bytes::Bytes::from_static(b"ab")),
        Ok(bytes::Bytes::from_static(b"cd")),
    ]);
    let url = format!("http://{}/stream", server.addr);
    let res = client
        .post(&url)
        .body(httpc::Body::wrap_stream(chunks))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), httpc::StatusCode::OK);

    let captured = server.requests.recv().await.unwrap();
    assert!(captured
        .head
        .lines()
        .any(|l| l.eq_ignore_ascii_case("transfer-encoding: chunked")));
    // body was read as 0 bytes by the server helper; the chunk frames
    // follow in the stream but framing is covered by unit tests
}

#[tokio::test]
async fn chunked_response_is_reassembled() {
    let mut server = serve(
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
    )
    .await;
    let client = httpc::Client::new();

    let url = format!("http://{}/chunked", server.addr);
    let res = client.get(&url).send().await.unwrap();
    assert_eq!(res.text().await.unwrap(), "hello world");
    let _ = server.requests.recv().await.unwrap();
}

#[tokio::test]
async fn keep_alive_connections_are_reused() {
    let mut server = serve(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await;
    let client = httpc::Client::new();

    let url = format!("http://{}/", server.addr);
    for _ in 0..3 {
        let res = client.get(&url).send().await.unwrap();
        assert_eq!(res.text().await.unwrap(), "ok");
        let _ = server.requests.recv().await.unwrap();
    }

    assert_eq!(server.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn connection_close_is_not_reused() {
    let mut server =
        serve(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok").await;
    let client = httpc::Client::new();

    let url = format!("http://{}/", server.addr);
    for _ in 0..2 {
        let res = client.get(&url).send().await.unwrap();
        assert_eq!(res.text().await.unwrap(), "ok");
        let _ = server.requests.recv().await.unwrap();
    }

    assert_eq!(server.connections.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn user_host_header_overrides_authority() {
    let mut server = serve(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
    let client = httpc::Client::new();

    let url = format!("http://{}/", server.addr);
    let res = client
        .get(&url)
        .header("host", "virtual.test")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), httpc::StatusCode::OK);

    let captured = server.requests.recv().await.unwrap();
    assert!(captured
        .head
        .lines()
        .any(|l| l.eq_ignore_ascii_case("host: virtual.test")));
}

#[tokio::test]
async fn default_headers_apply_when_unset() {
    let mut server = serve(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
    let client = httpc::Client::builder()
        .user_agent(httpc::HeaderValue::from_static("httpc-test/1"))
        .build()
        .unwrap();

    let url = format!("http://{}/", server.addr);
    client.get(&url).send().await.unwrap();
    let captured = server.requests.recv().await.unwrap();
    assert!(captured
        .head
        .lines()
        .any(|l| l.eq_ignore_ascii_case("user-agent: httpc-test/1")));
}

#[tokio::test]
async fn resolver_static_override_directs_the_dial() {
    let mut server = serve(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;

    let mut resolver = httpc::ResolverConfig::default();
    resolver
        .static_hosts
        .insert("fake.test".to_owned(), server.addr.ip());
    let client = httpc::Client::builder().resolver(resolver).build().unwrap();

    let url = format!("http://fake.test:{}/", server.addr.port());
    let res = client.get(&url).send().await.unwrap();
    assert_eq!(res.status(), httpc::StatusCode::OK);

    let captured = server.requests.recv().await.unwrap();
    assert!(captured
        .head
        .lines()
        .any(|l| l.eq_ignore_ascii_case(&format!("host: fake.test:{}", server.addr.port()))));
}
