//! End-to-end tests of the client against a local server

mod common;

use common::{init_logging, Reply, TestServer};
use courier::http::{
    BoxError, CancelHandle, Error, HttpClient, Method, MultipartPart, Request, RequestOptions,
    RetryPolicy, TimeoutKind,
};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn client() -> HttpClient {
    init_logging();
    HttpClient::builder()
        .retry(RetryPolicy::never())
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

#[test]
fn test_get_sends_default_headers() {
    let server = TestServer::start(|_| Reply::ok("Hello World").header("Content-Type", "text/plain"));
    let response = client()
        .get(&server.url("/test"), RequestOptions::new().param("q", "a b"))
        .unwrap();

    assert_eq!(response.status_code(), 200);
    assert_eq!(response.text().unwrap(), "Hello World");
    assert_eq!(response.url().path(), "/test");

    let request = &server.requests()[0];
    assert_eq!(request.method, Method::Get);
    assert_eq!(request.target, "/test?q=a+b");
    assert_eq!(request.headers.get("Host"), Some(server.addr().to_string().as_str()));
    assert_eq!(request.headers.get("Accept-Encoding"), Some("gzip, deflate"));
    assert!(request.headers.get("User-Agent").unwrap().starts_with("courier/"));
}

#[test]
fn test_gzip_json_response() {
    let body = gzip(br#"{"items":[1,2,3],"ok":true}"#);
    let server = TestServer::start(move |_| {
        Reply::ok(body.clone())
            .header("Content-Type", "application/json")
            .header("Content-Encoding", "gzip")
    });
    let response = client().get(&server.url("/data"), RequestOptions::new()).unwrap();
    let value: serde_json::Value = response.json().unwrap();
    assert_eq!(value, serde_json::json!({"items": [1, 2, 3], "ok": true}));
}

#[test]
fn test_post_json_and_form() {
    let server = TestServer::start(|_| Reply::new(201));
    let client = client();

    let response = client
        .post(&server.url("/users"), RequestOptions::new().json(&serde_json::json!({"name": "ada"})))
        .unwrap();
    assert_eq!(response.status_code(), 201);

    client
        .put(&server.url("/form"), RequestOptions::new().form([("a", "1"), ("b", "x y")]))
        .unwrap();

    let requests = server.requests();
    assert_eq!(requests[0].headers.get("Content-Type"), Some("application/json"));
    assert_eq!(requests[0].body, br#"{"name":"ada"}"#);
    assert_eq!(requests[1].method, Method::Put);
    assert_eq!(requests[1].body, b"a=1&b=x+y");
}

#[test]
fn test_multipart_upload() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.txt");
    std::fs::write(&path, "file contents").unwrap();

    let server = TestServer::start(|_| Reply::ok("stored"));
    client()
        .post_multipart(&server.url("/upload"), &[("title", "notes")], &[("attachment", &path)])
        .unwrap();

    let request = &server.requests()[0];
    let content_type = request.headers.get("Content-Type").unwrap();
    assert!(content_type.starts_with("multipart/form-data; boundary="));
    let boundary = content_type.split("boundary=").nth(1).unwrap();
    let body = String::from_utf8(request.body.clone()).unwrap();
    assert_eq!(body.matches(&format!("--{}\r\n", boundary)).count(), 2);
    assert!(body.contains("Content-Disposition: form-data; name=\"title\"\r\n\r\nnotes\r\n"));
    assert!(body.contains(
        "Content-Disposition: form-data; name=\"attachment\"; filename=\"notes.txt\"\r\nContent-Type: text/plain\r\n\r\nfile contents\r\n"
    ));
}

#[test]
fn test_chunked_response_with_trailers() {
    let server = TestServer::start(|_| {
        Reply::raw(
            "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
             5\r\nHello\r\n6\r\n World\r\n0\r\nX-Checksum: abc\r\n\r\n",
        )
    });
    let response = client().get(&server.url("/"), RequestOptions::new()).unwrap();
    assert_eq!(response.text().unwrap(), "Hello World");
    assert_eq!(response.header("X-Checksum"), Some("abc"));
}

#[test]
fn test_interim_response_skipped() {
    let server = TestServer::start(|_| {
        Reply::raw("HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\ndone")
    });
    let response = client().get(&server.url("/"), RequestOptions::new()).unwrap();
    assert_eq!(response.status_code(), 200);
    assert_eq!(response.text().unwrap(), "done");
}

#[test]
fn test_head_has_no_body() {
    let server = TestServer::start(|_| Reply::raw("HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\n"));
    let client = client();
    let response = client.head(&server.url("/"), RequestOptions::new()).unwrap();
    assert!(response.content().unwrap().is_empty());
    assert_eq!(response.header("Content-Length"), Some("1000"));

    // the connection is still usable
    client.head(&server.url("/"), RequestOptions::new()).unwrap();
    assert_eq!(server.connections(), 1);
}

#[test]
fn test_redirects() {
    let server = TestServer::start(|req| match req.target.as_str() {
        "/old" => Reply::new(301).header("Location", "/middle"),
        "/middle" => Reply::new(302).header("Location", "/new?x=1"),
        "/submit" => Reply::new(303).header("Location", "/result"),
        "/loop" => Reply::new(302).header("Location", "/loop"),
        _ => Reply::ok(format!("{} {}", req.method, req.target)),
    });
    let client = client();

    let response = client.get(&server.url("/old"), RequestOptions::new()).unwrap();
    assert_eq!(response.text().unwrap(), "GET /new?x=1");
    assert_eq!(response.history().len(), 2);
    assert_eq!(response.url().path(), "/new");

    let response = client
        .post(&server.url("/submit"), RequestOptions::new().data("payload"))
        .unwrap();
    assert_eq!(response.text().unwrap(), "GET /result");
    let last = server.requests().pop().unwrap();
    assert!(last.body.is_empty());

    let response = client
        .get(&server.url("/old"), RequestOptions::new().allow_redirects(false))
        .unwrap();
    assert_eq!(response.status_code(), 301);
    assert_eq!(response.header("Location"), Some("/middle"));

    let limited = HttpClient::builder()
        .retry(RetryPolicy::never())
        .max_redirects(3)
        .build()
        .unwrap();
    assert!(matches!(
        limited.get(&server.url("/loop"), RequestOptions::new()),
        Err(Error::TooManyRedirects(3))
    ));
}

#[test]
fn test_redirect_307_repeats_body() {
    let server = TestServer::start(|req| match req.target.as_str() {
        "/a" => Reply::new(307).header("Location", "/b"),
        _ => Reply::ok(req.body.clone()),
    });
    let response = client()
        .post(&server.url("/a"), RequestOptions::new().data("same body"))
        .unwrap();
    assert_eq!(response.text().unwrap(), "same body");
    let requests = server.requests();
    assert_eq!(requests[1].method, Method::Post);
}

#[test]
fn test_retry_on_503_then_success() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let server = TestServer::start(move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
            Reply::new(503)
        } else {
            Reply::ok("finally")
        }
    });
    let client = HttpClient::builder()
        .retry(RetryPolicy::new().max_attempts(3).base_delay(Duration::from_millis(20)))
        .build()
        .unwrap();

    let started = Instant::now();
    let response = client.get(&server.url("/"), RequestOptions::new()).unwrap();
    assert_eq!(response.text().unwrap(), "finally");
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    // 20ms + 40ms of backoff
    assert!(started.elapsed() >= Duration::from_millis(60));
}

#[test]
fn test_retry_exhausted_on_status() {
    let server = TestServer::start(|_| Reply::new(502));
    let client = HttpClient::builder()
        .retry(RetryPolicy::new().max_attempts(2).base_delay(Duration::from_millis(1)))
        .build()
        .unwrap();
    match client.get(&server.url("/"), RequestOptions::new()) {
        Err(Error::RetryExhausted { attempts, last }) => {
            assert_eq!(attempts, 2);
            assert!(matches!(*last, Error::Status { code: 502, .. }));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(server.request_count(), 2);

    // POST is not retried by default
    let response = client.post(&server.url("/"), RequestOptions::new()).unwrap();
    assert_eq!(response.status_code(), 502);
}

#[test]
fn test_connection_refused() {
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let url = format!("http://{}/", addr);

    let err = client().get(&url, RequestOptions::new()).unwrap_err();
    assert!(matches!(err, Error::Connection(courier::net::Error::Refused(_))));

    let retrying = HttpClient::builder()
        .retry(RetryPolicy::new().max_attempts(3).base_delay(Duration::from_millis(1)))
        .build()
        .unwrap();
    match retrying.get(&url, RequestOptions::new()) {
        Err(Error::RetryExhausted { attempts: 3, last }) => assert!(last.is_transient()),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_read_timeout_is_bounded() {
    let server = TestServer::start(|_| Reply::ok("late").delay(Duration::from_secs(3)));
    let started = Instant::now();
    let err = client()
        .get(&server.url("/slow"), RequestOptions::new().timeout(Duration::from_millis(300)))
        .unwrap_err();
    let elapsed = started.elapsed();
    assert!(matches!(err, Error::Timeout(TimeoutKind::Read)), "{:?}", err);
    assert!(elapsed >= Duration::from_millis(300));
    assert!(elapsed < Duration::from_millis(1500), "took {:?}", elapsed);
}

#[test]
fn test_total_timeout() {
    let server = TestServer::start(|_| Reply::ok("late").delay(Duration::from_secs(3)));
    let client = HttpClient::builder()
        .retry(RetryPolicy::never())
        .read_timeout(Some(Duration::from_secs(10)))
        .total_timeout(Some(Duration::from_millis(400)))
        .build()
        .unwrap();
    let started = Instant::now();
    let err = client.get(&server.url("/"), RequestOptions::new()).unwrap_err();
    assert!(matches!(err, Error::Timeout(TimeoutKind::Total)), "{:?}", err);
    assert!(started.elapsed() < Duration::from_millis(1500));
}

#[test]
fn test_streaming_and_downloads() {
    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let served = payload.clone();
    let server = TestServer::start(move |_| Reply::ok(served.clone()));
    let client = client();

    let chunks: Vec<_> = client
        .stream_response(&server.url("/file"), 4096)
        .unwrap()
        .map(|c| c.unwrap())
        .collect();
    assert!(chunks.iter().all(|c| c.len() <= 4096));
    assert_eq!(chunks.concat(), payload);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("download.bin");
    let mut reports = Vec::new();
    let written = client
        .download_stream(&server.url("/file"), &path, 16 * 1024, |n| reports.push(n))
        .unwrap();
    assert_eq!(written, payload.len() as u64);
    assert_eq!(reports.last().copied(), Some(written));
    assert!(reports.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(std::fs::read(&path).unwrap(), payload);

    let path = dir.path().join("whole.bin");
    assert_eq!(client.download(&server.url("/file"), &path).unwrap(), payload.len() as u64);
    assert_eq!(std::fs::read(&path).unwrap(), payload);
}

#[test]
fn test_streaming_body_read_once() {
    let server = TestServer::start(|_| Reply::ok("abcdef"));
    let response = client()
        .get(&server.url("/"), RequestOptions::new().stream(true))
        .unwrap();
    assert!(response.is_streaming());
    let collected: Vec<u8> = response.chunks(2).unwrap().flat_map(|c| c.unwrap().to_vec()).collect();
    assert_eq!(collected, b"abcdef");
    assert!(matches!(response.chunks(2), Err(Error::BodyConsumed)));
    assert!(matches!(response.text(), Err(Error::BodyConsumed)));
}

#[test]
fn test_cancel_unblocks_stalled_body() {
    let server = TestServer::start(|_| Reply::ok(vec![b'x'; 64 * 1024]).stall());
    let cancel = CancelHandle::new();
    let response = client()
        .get(&server.url("/"), RequestOptions::new().stream(true).cancel(cancel.clone()))
        .unwrap();

    let canceler = thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        cancel.cancel();
    });
    let started = Instant::now();
    let result: Result<Vec<_>, Error> = response.chunks(8192).unwrap().collect();
    canceler.join().unwrap();

    assert!(matches!(result, Err(Error::Canceled)), "{:?}", result.map(|c| c.len()));
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[test]
fn test_middleware_hooks() {
    let server = TestServer::start(|_| Reply::ok("ok"));
    let seen = Arc::new(AtomicUsize::new(0));

    struct CountResponses(Arc<AtomicUsize>);
    impl courier::http::Middleware for CountResponses {
        fn on_response(&self, _response: &courier::http::Response) -> Result<(), BoxError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    let client = HttpClient::builder()
        .middleware(|request: Request| -> Result<Request, BoxError> {
            Ok(request.with_header("X-Signed", "yes"))
        })
        .middleware(CountResponses(Arc::clone(&seen)))
        .middleware(courier::http::DebugLog)
        .build()
        .unwrap();
    client.get(&server.url("/"), RequestOptions::new()).unwrap();
    assert_eq!(server.requests()[0].headers.get("X-Signed"), Some("yes"));
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    let failing = HttpClient::builder()
        .middleware(|_: Request| -> Result<Request, BoxError> { Err("no network today".into()) })
        .build()
        .unwrap();
    let err = failing.get(&server.url("/"), RequestOptions::new()).unwrap_err();
    assert!(matches!(err, Error::Middleware(ref m) if m == "no network today"));
    assert_eq!(server.request_count(), 1);
}

#[test]
fn test_basic_auth_from_url_and_options() {
    let server = TestServer::start(|req| {
        Reply::ok(req.headers.get("Authorization").unwrap_or("none").to_string())
    });
    let client = client();

    let url = format!("http://user:pass@{}/private", server.addr());
    let response = client.get(&url, RequestOptions::new()).unwrap();
    assert_eq!(response.text().unwrap(), "Basic dXNlcjpwYXNz");
    assert_eq!(server.requests()[0].target, "/private");

    let response = client
        .get(&server.url("/"), RequestOptions::new().auth("admin", "secret"))
        .unwrap();
    assert_eq!(response.text().unwrap(), "Basic YWRtaW46c2VjcmV0");
}

#[test]
fn test_raise_for_status() {
    let server = TestServer::start(|_| Reply::new(404).body("missing"));
    let response = client().get(&server.url("/nope"), RequestOptions::new()).unwrap();
    assert!(!response.ok());
    assert_eq!(response.text().unwrap(), "missing");
    assert!(matches!(
        response.raise_for_status(),
        Err(Error::Status { code: 404, .. })
    ));
}

#[test]
fn test_malformed_status_line_not_retried() {
    let server = TestServer::start(|_| Reply::raw("HTTP/1.1 abc Broken\r\n\r\n"));
    let client = HttpClient::builder()
        .retry(RetryPolicy::new().base_delay(Duration::from_millis(1)))
        .build()
        .unwrap();
    let err = client.get(&server.url("/"), RequestOptions::new()).unwrap_err();
    assert!(matches!(err, Error::Protocol(_)), "{:?}", err);
    assert_eq!(server.request_count(), 1);
}

#[test]
fn test_failed_stream_is_not_success_on_reread() {
    let server = TestServer::start(|_| {
        Reply::raw("HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\nhello").close()
    });
    let response = client()
        .get(&server.url("/"), RequestOptions::new().stream(true))
        .unwrap();

    assert!(matches!(response.text(), Err(Error::ConnectionClosed)));
    assert!(matches!(response.text(), Err(Error::BodyConsumed)));
    assert!(matches!(response.raw_content(), Err(Error::BodyConsumed)));
    assert!(matches!(response.chunks(16), Err(Error::BodyConsumed)));
}
