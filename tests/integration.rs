use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use camo::config::Config;
use camo::{CamoProxy, CidrFilter, Metrics, RedirectPolicy, SystemResolver, TargetValidator};
use hmac::{Hmac, Mac};
use pingora::proxy::http_proxy_service;
use pingora::server::Server;
use sha1::Sha1;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn signed_path(key: &[u8], url: &str) -> String {
    let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(key).unwrap();
    mac.update(url.as_bytes());
    format!(
        "/{}/{}",
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()),
        URL_SAFE_NO_PAD.encode(url.as_bytes())
    )
}

fn create_test_config() -> Config {
    Config {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        metrics_addr: "127.0.0.1:0".parse().unwrap(),
        hmac_secret: zeroize::Zeroizing::new("test".to_string()),
        server_name: "bepress/camo".to_string(),
        max_size: 5 * 1024 * 1024,
        max_redirects: 10,
        request_timeout: Duration::from_secs(4),
        flush_interval: Duration::ZERO,
        disable_keepalives_fe: false,
        disable_keepalives_be: false,
        check_unicast: true,
        filtered_networks: camo::FILTERED_NETWORKS
            .iter()
            .map(|s| (*s).to_string())
            .collect(),
        csp_origin: "'none'".to_string(),
        add_response_headers: Vec::new(),
        tls_cert: None,
        tls_key: None,
        log_format: "pretty".to_string(),
    }
}

/// Validator that accepts loopback targets, for tests that proxy to a
/// local mock backend.
fn open_validator() -> TargetValidator {
    TargetValidator::new(
        CidrFilter::new::<&str>(&[]).unwrap(),
        Arc::new(SystemResolver),
        false,
    )
}

/// Backend answering every connection with one canned response.
async fn spawn_backend(response: &'static str) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            if let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 2048];
                    let _ = socket.read(&mut buf).await;
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        }
    });

    port
}

/// Backend answering `/hop` with a 302 and everything else with 200
/// `done`. With `redirect_to_self`, `/hop` points back at itself.
async fn spawn_redirect_backend(redirect_to_self: bool) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            if let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 2048];
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    let request = String::from_utf8_lossy(&buf[..n]).to_string();
                    let response = if request.starts_with("GET /hop") {
                        let target = if redirect_to_self { "/hop" } else { "/done" };
                        format!(
                            "HTTP/1.1 302 Found\r\nLocation: {target}\r\nContent-Length: 0\r\n\r\n"
                        )
                    } else {
                        "HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\ndone".to_string()
                    };
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        }
    });

    port
}

/// Backend that captures the raw request bytes before answering 200.
async fn spawn_capturing_backend() -> (u16, tokio::sync::mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            if let Ok((mut socket, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    let _ = tx.send(String::from_utf8_lossy(&buf[..n]).to_string());
                    let _ = socket
                        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                        .await;
                });
            }
        }
    });

    (port, rx)
}

async fn spawn_proxy(proxy: CamoProxy) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    let addr = format!("127.0.0.1:{port}");

    std::thread::spawn(move || {
        let server_conf = Arc::new(pingora::server::configuration::ServerConf::default());
        let mut service = http_proxy_service(&server_conf, proxy);
        service.add_tcp(&addr);

        let mut server = Server::new(None).unwrap();
        server.bootstrap();
        server.add_service(service);
        server.run_forever();
    });

    tokio::time::sleep(Duration::from_secs(1)).await;
    port
}

fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

#[tokio::test]
async fn test_happy_path() {
    let backend_port =
        spawn_backend("HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nhi")
            .await;
    let proxy = CamoProxy::new(Arc::new(create_test_config()), Metrics::new())
        .unwrap()
        .with_validator(open_validator());
    let proxy_port = spawn_proxy(proxy).await;

    let path = signed_path(b"test", &format!("http://127.0.0.1:{backend_port}"));
    let resp = client()
        .get(format!("http://127.0.0.1:{proxy_port}{path}"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers().get("Via").unwrap(), "bepress/camo");
    assert_eq!(
        resp.headers().get("Content-Security-Policy").unwrap(),
        "default-src 'none'"
    );
    assert_eq!(
        resp.headers().get("Strict-Transport-Security").unwrap(),
        "max-age=63072000; includeSubDomains"
    );
    assert!(resp.headers().contains_key("X-Request-ID"));
    assert_eq!(resp.text().await.unwrap(), "hi");
}

#[tokio::test]
async fn test_head_request() {
    let backend_port =
        spawn_backend("HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi").await;
    let proxy = CamoProxy::new(Arc::new(create_test_config()), Metrics::new())
        .unwrap()
        .with_validator(open_validator());
    let proxy_port = spawn_proxy(proxy).await;

    let path = signed_path(b"test", &format!("http://127.0.0.1:{backend_port}"));
    let resp = client()
        .head(format!("http://127.0.0.1:{proxy_port}{path}"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers().get("Via").unwrap(), "bepress/camo");
    assert_eq!(resp.text().await.unwrap(), "");
}

#[tokio::test]
async fn test_tampered_url() {
    let proxy = CamoProxy::new(Arc::new(create_test_config()), Metrics::new()).unwrap();
    let proxy_port = spawn_proxy(proxy).await;

    let resp = client()
        .get(format!(
            "http://127.0.0.1:{proxy_port}/I2s_jHIbZkwmHHX8wb8hmdxDM1g/aH0cDovL2JlcHJlc3MuY29t"
        ))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 403);
    assert_eq!(resp.text().await.unwrap(), "invalid signature: invalid mac\n");
}

#[tokio::test]
async fn test_truncated_digest() {
    let proxy = CamoProxy::new(Arc::new(create_test_config()), Metrics::new()).unwrap();
    let proxy_port = spawn_proxy(proxy).await;

    let resp = client()
        .get(format!(
            "http://127.0.0.1:{proxy_port}/I2s_jHIbZkwmHHX8wb8hmdxDM1/aHR0cDovL2JlcHJlc3MuY29t"
        ))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 403);
    assert_eq!(
        resp.text().await.unwrap(),
        "invalid signature: mismatched length\n"
    );
}

#[tokio::test]
async fn test_invalid_path_shape() {
    let proxy = CamoProxy::new(Arc::new(create_test_config()), Metrics::new()).unwrap();
    let proxy_port = spawn_proxy(proxy).await;

    let resp = client()
        .get(format!("http://127.0.0.1:{proxy_port}/one"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 400);
    assert_eq!(
        resp.text().await.unwrap(),
        "invalid camo url path: /one, wanted 3 parts got 2\n"
    );
}

#[tokio::test]
async fn test_ssrf_target_filtered() {
    let proxy = CamoProxy::new(Arc::new(create_test_config()), Metrics::new()).unwrap();
    let proxy_port = spawn_proxy(proxy).await;

    let path = signed_path(b"test", "http://10.1.10.1/some/uri");
    let resp = client()
        .get(format!("http://127.0.0.1:{proxy_port}{path}"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 400);
    assert_eq!(
        resp.text().await.unwrap(),
        "invalid host: filtered host address: \"10.1.10.1\"\n"
    );
}

#[tokio::test]
async fn test_redirect_loop_detected() {
    let proxy = CamoProxy::new(Arc::new(create_test_config()), Metrics::new()).unwrap();
    let proxy_port = spawn_proxy(proxy).await;

    let resp = client()
        .get(format!("http://127.0.0.1:{proxy_port}/sig/url"))
        .header("Via", "bepress/camo")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 404);
    assert_eq!(resp.text().await.unwrap(), "Redirect loop detected\n");
}

#[tokio::test]
async fn test_method_not_allowed() {
    let proxy = CamoProxy::new(Arc::new(create_test_config()), Metrics::new()).unwrap();
    let proxy_port = spawn_proxy(proxy).await;

    let resp = client()
        .put(format!("http://127.0.0.1:{proxy_port}/sig/url"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 405);
    assert_eq!(resp.headers().get("Allowed").unwrap(), "GET,HEAD");
    assert_eq!(resp.text().await.unwrap(), "Method not allowed: PUT\n");
}

#[tokio::test]
async fn test_payload_too_large_declared() {
    let backend_port = spawn_backend(
        "HTTP/1.1 200 OK\r\nContent-Length: 20\r\n\r\naaaaaaaaaaaaaaaaaaaa",
    )
    .await;
    let mut config = create_test_config();
    config.max_size = 10;
    let proxy = CamoProxy::new(Arc::new(config), Metrics::new())
        .unwrap()
        .with_validator(open_validator());
    let proxy_port = spawn_proxy(proxy).await;

    let path = signed_path(b"test", &format!("http://127.0.0.1:{backend_port}"));
    let resp = client()
        .get(format!("http://127.0.0.1:{proxy_port}{path}"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 413);
    assert_eq!(resp.text().await.unwrap(), "Payload too large\n");
}

#[tokio::test]
async fn test_payload_at_limit_passes() {
    let backend_port =
        spawn_backend("HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\naaaaaaaaaa").await;
    let mut config = create_test_config();
    config.max_size = 10;
    let proxy = CamoProxy::new(Arc::new(config), Metrics::new())
        .unwrap()
        .with_validator(open_validator());
    let proxy_port = spawn_proxy(proxy).await;

    let path = signed_path(b"test", &format!("http://127.0.0.1:{backend_port}"));
    let resp = client()
        .get(format!("http://127.0.0.1:{proxy_port}{path}"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "aaaaaaaaaa");
}

#[tokio::test]
async fn test_streamed_body_capped() {
    // No Content-Length: the declared-length check cannot fire, so the
    // copy loop has to cut the stream off.
    let backend_port =
        spawn_backend("HTTP/1.1 200 OK\r\nConnection: close\r\n\r\ntoolargebody").await;
    let mut config = create_test_config();
    config.max_size = 4;
    let proxy = CamoProxy::new(Arc::new(config), Metrics::new())
        .unwrap()
        .with_validator(open_validator());
    let proxy_port = spawn_proxy(proxy).await;

    let path = signed_path(b"test", &format!("http://127.0.0.1:{backend_port}"));
    let resp = client()
        .get(format!("http://127.0.0.1:{proxy_port}{path}"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    match resp.bytes().await {
        Ok(body) => assert!(body.len() <= 4, "cap leaked {} bytes", body.len()),
        Err(_) => {} // aborted mid-body is also acceptable
    }
}

#[tokio::test]
async fn test_flush_interval_streaming() {
    let backend_port =
        spawn_backend("HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi").await;
    let mut config = create_test_config();
    config.flush_interval = Duration::from_millis(1);

    let (tx, rx) = std::sync::mpsc::channel::<bool>();
    let proxy = CamoProxy::new(Arc::new(config), Metrics::new())
        .unwrap()
        .with_validator(open_validator())
        .with_flush_hook(Arc::new(move || {
            let _ = tx.send(true);
        }));
    let proxy_port = spawn_proxy(proxy).await;

    let path = signed_path(b"test", &format!("http://127.0.0.1:{backend_port}"));
    let resp = client()
        .get(format!("http://127.0.0.1:{proxy_port}{path}"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "hi");

    rx.recv_timeout(Duration::from_secs(5))
        .expect("flush loop never exited");
}

#[tokio::test]
async fn test_health_sidepath() {
    let proxy = CamoProxy::new(Arc::new(create_test_config()), Metrics::new()).unwrap();
    let proxy_port = spawn_proxy(proxy).await;

    let resp = client()
        .get(format!("http://127.0.0.1:{proxy_port}/health"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "OK\n");
}

#[tokio::test]
async fn test_favicon_sidepath() {
    let proxy = CamoProxy::new(Arc::new(create_test_config()), Metrics::new()).unwrap();
    let proxy_port = spawn_proxy(proxy).await;

    let resp = client()
        .get(format!("http://127.0.0.1:{proxy_port}/favicon.ico"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    assert!(resp.headers().contains_key("Expires"));
    let body = resp.bytes().await.unwrap();
    assert_eq!(&body[..8], &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]);
}

#[tokio::test]
async fn test_redirects_followed() {
    let backend_port = spawn_redirect_backend(false).await;
    let proxy = CamoProxy::new(Arc::new(create_test_config()), Metrics::new())
        .unwrap()
        .with_validator(open_validator());
    let proxy_port = spawn_proxy(proxy).await;

    let path = signed_path(b"test", &format!("http://127.0.0.1:{backend_port}/hop"));
    let resp = client()
        .get(format!("http://127.0.0.1:{proxy_port}{path}"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "done");
}

#[tokio::test]
async fn test_redirect_chain_exhausted() {
    let backend_port = spawn_redirect_backend(true).await;
    let mut config = create_test_config();
    config.max_redirects = 2;
    let proxy = CamoProxy::new(Arc::new(config), Metrics::new())
        .unwrap()
        .with_validator(open_validator());
    let proxy_port = spawn_proxy(proxy).await;

    let path = signed_path(b"test", &format!("http://127.0.0.1:{backend_port}/hop"));
    let resp = client()
        .get(format!("http://127.0.0.1:{proxy_port}{path}"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 500);
    assert_eq!(
        resp.text().await.unwrap(),
        "error processing request: \"stopped after 2 redirects\"\n"
    );
}

#[tokio::test]
async fn test_use_last_response_maps_to_not_found() {
    let backend_port = spawn_redirect_backend(false).await;
    let proxy = CamoProxy::new(Arc::new(create_test_config()), Metrics::new())
        .unwrap()
        .with_validator(open_validator())
        .with_redirect_policy(RedirectPolicy::UseLastResponse);
    let proxy_port = spawn_proxy(proxy).await;

    let path = signed_path(b"test", &format!("http://127.0.0.1:{backend_port}/hop"));
    let resp = client()
        .get(format!("http://127.0.0.1:{proxy_port}{path}"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 404);
    assert_eq!(resp.text().await.unwrap(), "Too many redirects\n");
}

#[tokio::test]
async fn test_upstream_server_error() {
    let backend_port = spawn_backend(
        "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n",
    )
    .await;
    let proxy = CamoProxy::new(Arc::new(create_test_config()), Metrics::new())
        .unwrap()
        .with_validator(open_validator());
    let proxy_port = spawn_proxy(proxy).await;

    let path = signed_path(b"test", &format!("http://127.0.0.1:{backend_port}"));
    let resp = client()
        .get(format!("http://127.0.0.1:{proxy_port}{path}"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 502);
    assert_eq!(
        resp.text().await.unwrap(),
        "Error Fetching Resource: 503 Service Unavailable\n"
    );
}

#[tokio::test]
async fn test_upstream_unsuitable_content() {
    let backend_port =
        spawn_backend("HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n").await;
    let proxy = CamoProxy::new(Arc::new(create_test_config()), Metrics::new())
        .unwrap()
        .with_validator(open_validator());
    let proxy_port = spawn_proxy(proxy).await;

    let path = signed_path(b"test", &format!("http://127.0.0.1:{backend_port}"));
    let resp = client()
        .get(format!("http://127.0.0.1:{proxy_port}{path}"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 404);
    assert_eq!(resp.text().await.unwrap(), "Unable to find suitable content\n");
}

#[tokio::test]
async fn test_upstream_request_hygiene() {
    let (backend_port, mut captured) = spawn_capturing_backend().await;
    let proxy = CamoProxy::new(Arc::new(create_test_config()), Metrics::new())
        .unwrap()
        .with_validator(open_validator());
    let proxy_port = spawn_proxy(proxy).await;

    let path = signed_path(b"test", &format!("http://127.0.0.1:{backend_port}/asset"));
    let resp = client()
        .get(format!("http://127.0.0.1:{proxy_port}{path}"))
        .header("Proxy-Authorization", "Basic secret")
        .header("X-Forwarded-For", "1.2.3.4")
        .header("Accept", "image/png")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let request = captured.recv().await.unwrap().to_lowercase();
    assert!(request.starts_with("get /asset"));
    assert!(!request.contains("proxy-authorization"));
    assert!(request.contains("accept: image/png"));
    assert!(request.contains("x-forwarded-for: 1.2.3.4, 127.0.0.1"));
    assert!(request.contains("x-forwarded-proto: http"));
}

#[tokio::test]
async fn test_request_id_echoed() {
    let proxy = CamoProxy::new(Arc::new(create_test_config()), Metrics::new()).unwrap();
    let proxy_port = spawn_proxy(proxy).await;

    let resp = client()
        .get(format!("http://127.0.0.1:{proxy_port}/health"))
        .header("X-Request-ID", "abc-123")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.headers().get("X-Request-ID").unwrap(), "abc-123");

    let resp = client()
        .get(format!("http://127.0.0.1:{proxy_port}/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.headers().get("X-Request-ID").unwrap().len(), 20);
}
