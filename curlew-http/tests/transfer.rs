//! Integration tests: HTTP transfers through a live reactor.
//!
//! Each test launches a reactor with the HTTP engine and talks to an
//! in-process HTTP/1.1 server on loopback. Server routes:
//!
//! - `/small`, `/big`: fixed bodies of 10 bytes and 10 MiB
//! - `/echo`: request body echoed back
//! - `/head`: raw request head echoed back
//! - `/set-cookie`, `/show-cookie`: cookie round trip
//! - `/redirect`: 302 to `/small`
//! - `/chunked`: chunked body
//! - `/conn`: number of the server-side connection
//! - `/close`: body delimited by connection close
//! - `/slow`: answers after 300 ms

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use curlew::{Completion, Config, Error, ReactorBuilder, ReactorHandle, Request, Session};
use curlew_http::{HttpConfig, HttpConfigBuilder, HttpEngineFactory, TlsClientConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

// ── Test server ─────────────────────────────────────────────────────

struct Server {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
}

impl Server {
    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }
}

struct Incoming {
    path: String,
    head: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Incoming {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

fn big_body() -> Vec<u8> {
    (0..10 * 1024 * 1024).map(|i| (i % 251) as u8).collect()
}

fn read_request<R: BufRead>(reader: &mut R) -> Option<Incoming> {
    let mut head = String::new();
    if reader.read_line(&mut head).ok()? == 0 {
        return None;
    }
    let path = head.split_whitespace().nth(1)?.to_string();
    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).ok()? == 0 {
            return None;
        }
        head.push_str(&line);
        if line == "\r\n" {
            break;
        }
        let (name, value) = line.split_once(':')?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    let mut request = Incoming {
        path,
        head,
        headers,
        body: Vec::new(),
    };
    let length: usize = request
        .header("content-length")
        .map_or(0, |v| v.parse().unwrap());
    request.body = vec![0; length];
    reader.read_exact(&mut request.body).ok()?;
    Some(request)
}

fn ok(body: &[u8], extra: &str) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n{extra}\r\n",
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(body);
    out
}

/// Response for `request`, and whether to close the connection after it.
fn respond(request: &Incoming, conn_id: usize) -> (Vec<u8>, bool) {
    let response = match request.path.as_str() {
        "/small" => ok(b"0123456789", ""),
        "/big" => ok(&big_body(), ""),
        "/echo" => ok(&request.body, ""),
        "/head" => ok(request.head.as_bytes(), ""),
        "/set-cookie" => ok(b"set", "Set-Cookie: session=abc123; Path=/\r\n"),
        "/show-cookie" => ok(request.header("cookie").unwrap_or("").as_bytes(), ""),
        "/redirect" => b"HTTP/1.1 302 Found\r\nLocation: /small\r\nContent-Length: 0\r\n\r\n".to_vec(),
        "/chunked" => b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n1\r\n \r\n5\r\nworld\r\n0\r\n\r\n".to_vec(),
        "/conn" => ok(conn_id.to_string().as_bytes(), ""),
        "/close" => return (b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\nbye".to_vec(), true),
        "/slow" => {
            thread::sleep(Duration::from_millis(300));
            ok(b"late", "")
        }
        _ => b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n".to_vec(),
    };
    let close = request.header("connection") == Some("close");
    (response, close)
}

fn serve<S: Read + Write>(stream: S, conn_id: usize) {
    let mut reader = BufReader::new(stream);
    while let Some(request) = read_request(&mut reader) {
        let (response, close) = respond(&request, conn_id);
        let out = reader.get_mut();
        if out.write_all(&response).and_then(|()| out.flush()).is_err() || close {
            return;
        }
    }
}

fn start_server() -> Server {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&connections);
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { return };
            let conn_id = counter.fetch_add(1, Ordering::SeqCst);
            thread::spawn(move || serve(stream, conn_id));
        }
    });
    Server { addr, connections }
}

// ── TLS cert generation ─────────────────────────────────────────────

fn generate_self_signed() -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let key = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());
    let cert_der = CertificateDer::from(cert.cert);
    (vec![cert_der], key.into())
}

fn start_tls_server(certs: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> u16 {
    let config = Arc::new(
        rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .unwrap(),
    );
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        for (conn_id, stream) in listener.incoming().enumerate() {
            let Ok(stream) = stream else { return };
            let conn = rustls::ServerConnection::new(Arc::clone(&config)).unwrap();
            thread::spawn(move || serve(rustls::StreamOwned::new(conn, stream), conn_id));
        }
    });
    port
}

fn client_tls_config(certs: &[CertificateDer<'static>]) -> TlsClientConfig {
    let mut roots = rustls::RootCertStore::empty();
    for cert in certs {
        roots.add(cert.clone()).unwrap();
    }
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsClientConfig {
        client_config: Arc::new(config),
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn launch_with(config: HttpConfig) -> (ReactorHandle, thread::JoinHandle<Result<(), Error>>) {
    ReactorBuilder::new(Config::default())
        .launch(HttpEngineFactory::new(config))
        .unwrap()
}

fn launch() -> (ReactorHandle, thread::JoinHandle<Result<(), Error>>) {
    launch_with(HttpConfig::default())
}

fn fetch(handle: &ReactorHandle, session: &Session, request: impl Into<Request>) -> Completion {
    let token = session.submit(request).unwrap();
    let completion = handle
        .completions()
        .recv_timeout(Duration::from_secs(10))
        .expect("timed out waiting for completion");
    assert_eq!(completion.token(), token);
    completion
}

fn shutdown(handle: ReactorHandle, join: thread::JoinHandle<Result<(), Error>>) {
    handle.stop();
    join.join().unwrap().unwrap();
}

// ── Tests ───────────────────────────────────────────────────────────

#[test]
fn small_body_exact() {
    let server = start_server();
    let (handle, join) = launch();
    let session = handle.session();

    let completion = fetch(&handle, &session, Request::get(&server.url("/small")));
    assert!(completion.is_ok(), "{:?}", completion.error());
    let response = completion.response().unwrap();
    assert_eq!(response.response_code(), 200);
    assert_eq!(&response.body_bytes()[..], b"0123456789");
    assert_eq!(response.header("content-length").as_deref(), Some("10"));
    assert_eq!(response.effective_url(), Some(server.url("/small").as_str()));
    assert_eq!(response.sizes().downloaded, 10);
    assert!(response.timings().total > 0.0);
    assert!(response.timings().start_transfer >= response.timings().connect);

    drop(completion);
    shutdown(handle, join);
}

#[test]
fn large_body_exact() {
    let server = start_server();
    let (handle, join) = launch();
    let session = handle.session();

    let completion = fetch(&handle, &session, Request::get(&server.url("/big")));
    let response = completion.response().unwrap();
    assert_eq!(response.body_len(), 10 * 1024 * 1024);
    assert!(response.body_bytes()[..] == big_body()[..]);
    assert_eq!(response.sizes().downloaded, 10 * 1024 * 1024);

    drop(completion);
    shutdown(handle, join);
}

#[test]
fn refused_connection_reports_error() {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let (handle, join) = launch();
    let session = handle.session();

    let completion = fetch(&handle, &session, Request::get(&format!("http://{addr}/")));
    assert!(!completion.is_ok());
    let error = completion.error().unwrap();
    assert!(error.contains("failed to connect"), "{error}");

    drop(completion);
    shutdown(handle, join);
}

#[test]
fn unresolvable_host_reports_error() {
    let (handle, join) = launch();
    let session = handle.session();

    let completion = fetch(&handle, &session, Request::get("http://no-such-host.invalid/"));
    let error = completion.error().unwrap();
    assert!(error.contains("could not resolve host"), "{error}");

    drop(completion);
    shutdown(handle, join);
}

#[test]
fn concurrent_transfers_do_not_interleave() {
    let server = start_server();
    let (handle, join) = launch();
    let session = handle.session();

    let mut expected = HashMap::new();
    for i in 0..32 {
        let body = format!("payload-{i}-").repeat(100 + i);
        let token = session
            .submit(Request::post(&server.url("/echo")).body(body.clone()))
            .unwrap();
        expected.insert(token, body);
    }

    let rx = handle.completions();
    for _ in 0..expected.len() {
        let completion = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        let want = expected.remove(&completion.token()).expect("unknown token");
        assert_eq!(completion.response().unwrap().text(), want);
    }
    assert!(expected.is_empty());

    shutdown(handle, join);
}

#[test]
fn request_head_serialized() {
    let server = start_server();
    let (handle, join) = launch();
    let session = handle.session();

    let request = Request::post(&server.url("/head?x=1"))
        .header("X-Test", "yes")
        .basic_auth("alice", "secret")
        .body("data");
    let completion = fetch(&handle, &session, request);
    let head = completion.response().unwrap().text();
    assert!(head.starts_with("POST /head?x=1 HTTP/1.1\r\n"), "{head}");
    assert!(head.contains(&format!("Host: {}\r\n", server.addr)));
    assert!(head.contains("Accept: */*\r\n"));
    assert!(head.contains("X-Test: yes\r\n"));
    assert!(head.contains("Authorization: Basic YWxpY2U6c2VjcmV0\r\n"));
    assert!(head.contains("Content-Length: 4\r\n"));
    assert_eq!(completion.response().unwrap().sizes().uploaded, 4);

    drop(completion);
    shutdown(handle, join);
}

#[test]
fn cookies_shared_within_a_session() {
    let server = start_server();
    let (handle, join) = launch();
    let session = handle.session();
    let other = handle.session();

    let set = fetch(&handle, &session, Request::get(&server.url("/set-cookie")));
    assert!(
        set.response()
            .unwrap()
            .cookies()
            .iter()
            .any(|line| line.ends_with("\tsession\tabc123")),
        "{:?}",
        set.response().unwrap().cookies()
    );

    let shown = fetch(&handle, &session, Request::get(&server.url("/show-cookie")));
    assert_eq!(shown.response().unwrap().text(), "session=abc123");

    let elsewhere = fetch(&handle, &other, Request::get(&server.url("/show-cookie")));
    assert_eq!(elsewhere.response().unwrap().text(), "");

    drop((set, shown, elsewhere));
    shutdown(handle, join);
}

#[test]
fn request_cookie_lines_sent() {
    let server = start_server();
    let (handle, join) = launch();
    let session = handle.session();

    let request = Request::get(&server.url("/show-cookie"))
        .cookie("a=1")
        .cookie("Set-Cookie: b=2; Path=/");
    let completion = fetch(&handle, &session, request);
    let cookie = completion.response().unwrap().text();
    assert!(cookie.contains("a=1"), "{cookie}");
    assert!(cookie.contains("b=2"), "{cookie}");

    drop(completion);
    shutdown(handle, join);
}

#[test]
fn redirect_reported_not_followed() {
    let server = start_server();
    let (handle, join) = launch();
    let session = handle.session();

    let completion = fetch(&handle, &session, Request::get(&server.url("/redirect")));
    let response = completion.response().unwrap();
    assert_eq!(response.response_code(), 302);
    assert_eq!(response.redirect_url(), Some(server.url("/small").as_str()));
    assert_eq!(response.body_len(), 0);

    drop(completion);
    shutdown(handle, join);
}

#[test]
fn chunked_body_decoded() {
    let server = start_server();
    let (handle, join) = launch();
    let session = handle.session();

    let completion = fetch(&handle, &session, Request::get(&server.url("/chunked")));
    assert_eq!(completion.response().unwrap().text(), "hello world");

    drop(completion);
    shutdown(handle, join);
}

#[test]
fn body_until_close() {
    let server = start_server();
    let (handle, join) = launch();
    let session = handle.session();

    let completion = fetch(&handle, &session, Request::get(&server.url("/close")));
    assert!(completion.is_ok(), "{:?}", completion.error());
    assert_eq!(completion.response().unwrap().text(), "bye");

    drop(completion);
    shutdown(handle, join);
}

#[test]
fn keep_alive_connection_reused() {
    let server = start_server();
    let (handle, join) = launch();
    let session = handle.session();

    let first = fetch(&handle, &session, Request::get(&server.url("/conn")));
    let second = fetch(&handle, &session, Request::get(&server.url("/conn")));
    assert_eq!(
        first.response().unwrap().text(),
        second.response().unwrap().text()
    );
    assert_eq!(server.connections.load(Ordering::SeqCst), 1);

    drop((first, second));
    shutdown(handle, join);
}

#[test]
fn no_reuse_without_idle_slots() {
    let server = start_server();
    let (handle, join) = launch_with(HttpConfigBuilder::new().max_idle_connections(0).build());
    let session = handle.session();

    let first = fetch(&handle, &session, Request::get(&server.url("/conn")));
    let second = fetch(&handle, &session, Request::get(&server.url("/conn")));
    assert_ne!(
        first.response().unwrap().text(),
        second.response().unwrap().text()
    );

    drop((first, second));
    shutdown(handle, join);
}

#[test]
fn total_timeout_enforced() {
    let server = start_server();
    let (handle, join) = launch();
    let session = handle.session();

    let request = Request::get(&server.url("/slow")).timeout(Duration::from_millis(50));
    let completion = fetch(&handle, &session, request);
    let error = completion.error().unwrap();
    assert!(error.contains("timed out"), "{error}");

    drop(completion);
    shutdown(handle, join);
}

#[test]
fn stop_waits_for_in_flight_transfer() {
    let server = start_server();
    let (handle, join) = launch();
    let session = handle.session();

    let token = session.submit(Request::get(&server.url("/slow"))).unwrap();
    handle.stop();
    join.join().unwrap().unwrap();

    let completion = handle.completions().try_recv().expect("completion delivered");
    assert_eq!(completion.token(), token);
    assert_eq!(completion.response().unwrap().text(), "late");
    assert!(matches!(
        session.submit(Request::get(&server.url("/small"))),
        Err(Error::ReactorStopped)
    ));
}

#[test]
fn dummy_request_needs_no_server() {
    let (handle, join) = launch();
    let session = handle.session();

    let completion = fetch(&handle, &session, Request::dummy());
    assert!(completion.is_ok());

    drop(completion);
    shutdown(handle, join);
}

#[test]
fn https_round_trip() {
    let (certs, key) = generate_self_signed();
    let tls = client_tls_config(&certs);
    let port = start_tls_server(certs, key);
    let (handle, join) = launch_with(HttpConfigBuilder::new().tls_client(tls).build());
    let session = handle.session();

    let url = format!("https://localhost:{port}/small");
    let first = fetch(&handle, &session, Request::get(&url));
    assert!(first.is_ok(), "{:?}", first.error());
    let response = first.response().unwrap();
    assert_eq!(&response.body_bytes()[..], b"0123456789");
    assert!(response.timings().app_connect >= response.timings().connect);

    let second = fetch(
        &handle,
        &session,
        Request::post(&format!("https://localhost:{port}/echo")).body("over tls"),
    );
    assert_eq!(second.response().unwrap().text(), "over tls");

    drop((first, second));
    shutdown(handle, join);
}

#[test]
fn untrusted_certificate_rejected() {
    let (certs, key) = generate_self_signed();
    let port = start_tls_server(certs, key);
    let (handle, join) = launch();
    let session = handle.session();

    let completion = fetch(
        &handle,
        &session,
        Request::get(&format!("https://localhost:{port}/small")),
    );
    let error = completion.error().unwrap();
    assert!(error.contains("certificate") || error.contains("tls"), "{error}");

    drop(completion);
    shutdown(handle, join);
}
