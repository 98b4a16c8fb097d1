//! Shared helpers for integration tests
//!
//! `TestServer` is a small threaded HTTP/1.1 server built on the crate's own
//! request parser. Every accepted connection gets a thread; requests on it
//! are answered in order by the handler until the peer or the reply closes.

#![allow(dead_code)]

use courier::http::{ParsedRequest, RequestParser, Status};
use openssl::asn1::Asn1Time;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::ssl::{SslAcceptor, SslMethod};
use openssl::x509::extension::{BasicConstraints, SubjectAlternativeName};
use openssl::x509::{X509NameBuilder, X509};
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// What the server sends back for one request
#[derive(Debug, Clone, Default)]
pub struct Reply {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    raw: Option<Vec<u8>>,
    close: bool,
    delay: Option<Duration>,
    stall: bool,
}

impl Reply {
    pub fn new(status: u16) -> Self {
        Reply {
            status,
            ..Default::default()
        }
    }

    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Reply::new(200).body(body)
    }

    /// Exact bytes to write instead of a generated response
    pub fn raw(bytes: impl Into<Vec<u8>>) -> Self {
        Reply {
            raw: Some(bytes.into()),
            ..Default::default()
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Close the connection after this reply
    pub fn close(mut self) -> Self {
        self.close = true;
        self
    }

    /// Wait before replying
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Send the head and part of the body, then go quiet
    pub fn stall(mut self) -> Self {
        self.stall = true;
        self
    }

    fn to_bytes(&self) -> Vec<u8> {
        if let Some(raw) = &self.raw {
            return raw.clone();
        }
        let reason = Status::new(self.status)
            .map(|s| s.reason_phrase())
            .unwrap_or("Unknown");
        let mut out = format!("HTTP/1.1 {} {}\r\n", self.status, reason).into_bytes();
        let mut has_framing = false;
        for (name, value) in &self.headers {
            has_framing |= name.eq_ignore_ascii_case("content-length")
                || name.eq_ignore_ascii_case("transfer-encoding");
            out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        if !has_framing {
            out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

pub type Handler = Arc<dyn Fn(&ParsedRequest) -> Reply + Send + Sync>;

/// Threaded test server
pub struct TestServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<ParsedRequest>>>,
    connections: Arc<AtomicUsize>,
}

#[derive(Clone)]
struct Shared {
    handler: Handler,
    requests: Arc<Mutex<Vec<ParsedRequest>>>,
}

impl TestServer {
    /// Plain HTTP server answering with `handler`
    pub fn start<F>(handler: F) -> Self
    where
        F: Fn(&ParsedRequest) -> Reply + Send + Sync + 'static,
    {
        Self::spawn(handler, None)
    }

    /// HTTPS server with the given certificate
    pub fn start_tls<F>(handler: F, identity: &TestIdentity) -> Self
    where
        F: Fn(&ParsedRequest) -> Reply + Send + Sync + 'static,
    {
        Self::spawn(handler, Some(identity.acceptor()))
    }

    fn spawn<F>(handler: F, acceptor: Option<SslAcceptor>) -> Self
    where
        F: Fn(&ParsedRequest) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Shared {
            handler: Arc::new(handler),
            requests: Arc::new(Mutex::new(Vec::new())),
        };
        let connections = Arc::new(AtomicUsize::new(0));

        let server = TestServer {
            addr,
            requests: Arc::clone(&shared.requests),
            connections: Arc::clone(&connections),
        };
        let acceptor = acceptor.map(Arc::new);

        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                connections.fetch_add(1, Ordering::SeqCst);
                let shared = shared.clone();
                let acceptor = acceptor.clone();
                thread::spawn(move || match acceptor {
                    Some(acceptor) => {
                        let tcp = stream.try_clone().unwrap();
                        if let Ok(tls) = acceptor.accept(stream) {
                            serve(tls, &shared, &tcp);
                        }
                    }
                    None => {
                        let tcp = stream.try_clone().unwrap();
                        serve(stream, &shared, &tcp);
                    }
                });
            }
        });

        server
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn tls_url(&self, path: &str) -> String {
        format!("https://localhost:{}{}", self.addr.port(), path)
    }

    /// Requests received so far
    pub fn requests(&self) -> Vec<ParsedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Connections accepted so far
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

fn serve<S: Read + Write>(mut stream: S, shared: &Shared, tcp: &TcpStream) {
    let mut parser = RequestParser::new();
    let mut pending: Vec<u8> = Vec::new();
    let mut buf = [0u8; 8192];

    loop {
        let request = match parser.parse(&pending) {
            Ok(Some(request)) => {
                pending = parser.take_remaining();
                parser = RequestParser::new();
                request
            }
            Ok(None) => {
                pending.clear();
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => return,
                    Ok(n) => {
                        pending.extend_from_slice(&buf[..n]);
                        continue;
                    }
                }
            }
            Err(_) => {
                let _ = stream.write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n");
                return;
            }
        };

        shared.requests.lock().unwrap().push(request.clone());
        let reply = (shared.handler)(&request);
        if let Some(delay) = reply.delay {
            thread::sleep(delay);
        }

        let bytes = reply.to_bytes();
        if reply.stall {
            let cut = bytes.len() - reply.body.len() / 2;
            let _ = stream.write_all(&bytes[..cut]);
            let _ = stream.flush();
            thread::sleep(Duration::from_secs(5));
            return;
        }
        if stream.write_all(&bytes).is_err() || stream.flush().is_err() {
            return;
        }
        if reply.close {
            let _ = tcp.shutdown(Shutdown::Both);
            return;
        }
    }
}

/// Self-signed certificate for `localhost` and `127.0.0.1`
pub struct TestIdentity {
    key: PKey<Private>,
    cert: X509,
}

impl TestIdentity {
    pub fn generate() -> Self {
        let rsa = Rsa::generate(2048).unwrap();
        let key = PKey::from_rsa(rsa).unwrap();

        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "localhost").unwrap();
        let name = name.build();

        let mut cert = X509::builder().unwrap();
        cert.set_version(2).unwrap();
        cert.set_subject_name(&name).unwrap();
        cert.set_issuer_name(&name).unwrap();
        cert.set_pubkey(&key).unwrap();
        cert.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
        cert.set_not_after(&Asn1Time::days_from_now(1).unwrap()).unwrap();
        cert.append_extension(BasicConstraints::new().critical().ca().build().unwrap())
            .unwrap();
        let san = SubjectAlternativeName::new()
            .dns("localhost")
            .ip("127.0.0.1")
            .build(&cert.x509v3_context(None, None))
            .unwrap();
        cert.append_extension(san).unwrap();
        cert.sign(&key, MessageDigest::sha256()).unwrap();

        TestIdentity {
            key,
            cert: cert.build(),
        }
    }

    /// Certificate as PEM, for use as a CA file
    pub fn cert_pem(&self) -> Vec<u8> {
        self.cert.to_pem().unwrap()
    }

    fn acceptor(&self) -> SslAcceptor {
        let mut acceptor = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls()).unwrap();
        acceptor.set_private_key(&self.key).unwrap();
        acceptor.set_certificate(&self.cert).unwrap();
        acceptor.build()
    }
}
