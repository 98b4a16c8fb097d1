//! HTTPS against a local server with a generated certificate

mod common;

use common::{init_logging, Reply, TestIdentity, TestServer};
use courier::http::{Error, HttpClient, RequestOptions, RetryPolicy};
use courier::net;

fn tls_server() -> (TestServer, TestIdentity) {
    init_logging();
    let identity = TestIdentity::generate();
    let server = TestServer::start_tls(|req| Reply::ok(format!("secure {}", req.target)), &identity);
    (server, identity)
}

#[test]
fn test_https_with_ca_file() {
    let (server, identity) = tls_server();
    let dir = tempfile::tempdir().unwrap();
    let ca = dir.path().join("ca.pem");
    std::fs::write(&ca, identity.cert_pem()).unwrap();

    let client = HttpClient::builder()
        .ca_file(&ca)
        .retry(RetryPolicy::never())
        .build()
        .unwrap();
    let response = client.get(&server.tls_url("/hello"), RequestOptions::new()).unwrap();
    assert_eq!(response.text().unwrap(), "secure /hello");

    client.get(&server.tls_url("/again"), RequestOptions::new()).unwrap();
    assert_eq!(server.connections(), 1);
}

#[test]
fn test_untrusted_certificate_rejected() {
    let (server, _identity) = tls_server();
    let client = HttpClient::builder().retry(RetryPolicy::never()).build().unwrap();

    let err = client.get(&server.tls_url("/"), RequestOptions::new()).unwrap_err();
    assert!(matches!(err, Error::Connection(net::Error::Tls(_))), "{:?}", err);
    assert_eq!(server.request_count(), 0);
}

#[test]
fn test_verification_can_be_disabled() {
    let (server, _identity) = tls_server();

    let client = HttpClient::builder()
        .verify_ssl(false)
        .retry(RetryPolicy::never())
        .build()
        .unwrap();
    let response = client.get(&server.tls_url("/insecure"), RequestOptions::new()).unwrap();
    assert_eq!(response.text().unwrap(), "secure /insecure");

    // per call override
    let strict = HttpClient::builder().retry(RetryPolicy::never()).build().unwrap();
    let response = strict
        .get(&server.tls_url("/once"), RequestOptions::new().verify_ssl(false))
        .unwrap();
    assert!(response.is_success());
}
