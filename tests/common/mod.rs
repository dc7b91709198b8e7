//! Shared utilities for integration testing.

use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use downstream_http::config::CircuitBreakerConfig;
use downstream_http::net::{RoundRobinResolver, StaticLookup};
use downstream_http::resilience::CircuitBreakerRegistry;
use downstream_http::DownstreamClient;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// What a mock backend saw for one request.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: String,
    /// Address the client dialed.
    pub local_ip: IpAddr,
}

/// A running mock backend.
pub struct MockBackend {
    pub port: u16,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

#[allow(dead_code)]
impl MockBackend {
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// URL for `path` on this backend under the host name `host`.
    pub fn url(&self, host: &str, path: &str) -> String {
        format!("http://{}:{}{}", host, self.port, path)
    }
}

/// Start a mock backend that always returns `status` with `body`.
#[allow(dead_code)]
pub async fn start_mock_backend(status: u16, body: &'static str) -> MockBackend {
    start_programmable_backend(Ipv4Addr::LOCALHOST.into(), move || async move {
        (status, body.to_string(), Duration::ZERO)
    })
    .await
}

/// Start a backend whose reply (status, body, delay) comes from `f`.
///
/// Binds an ephemeral port on `bind`. Every response closes the connection.
#[allow(dead_code)]
pub async fn start_programmable_backend<F, Fut>(bind: IpAddr, f: F) -> MockBackend
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String, Duration)> + Send + 'static,
{
    start_routing_backend(bind, move |_request: &RecordedRequest| f()).await
}

/// Start a backend that picks its reply (status, body, delay) from the request it received.
pub async fn start_routing_backend<F, Fut>(bind: IpAddr, f: F) -> MockBackend
where
    F: Fn(&RecordedRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String, Duration)> + Send + 'static,
{
    let listener = TcpListener::bind(SocketAddr::new(bind, 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let f = Arc::new(f);

    let recorded = requests.clone();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let f = f.clone();
                    let recorded = recorded.clone();
                    tokio::spawn(async move {
                        let Some(request) = read_request(&mut socket).await else {
                            return;
                        };
                        let reply = f(&request);
                        recorded.lock().unwrap().push(request);

                        let (status, body, delay) = reply.await;
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        let response = format!(
                            "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            status,
                            reason(status),
                            body.len(),
                            body
                        );
                        let _ = socket.write_all(response.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    MockBackend { port, requests }
}

/// Client wired to a fresh breaker registry, resolving `hosts` to loopback addresses.
#[allow(dead_code)]
pub fn test_client(
    hosts: &[(&str, Vec<IpAddr>)],
    breakers: CircuitBreakerConfig,
    request_timeout: Duration,
) -> DownstreamClient {
    let lookup = hosts.iter().fold(StaticLookup::new(), |lookup, (host, addrs)| {
        lookup.with_host(*host, addrs.clone())
    });

    DownstreamClient::builder()
        .worker_threads(2)
        .request_timeout(request_timeout)
        .connect_timeout(Duration::from_secs(2))
        .resolver(RoundRobinResolver::new(lookup))
        .circuit_breaker_registry(Arc::new(CircuitBreakerRegistry::new(breakers)))
        .build()
        .unwrap()
}

async fn read_request(socket: &mut TcpStream) -> Option<RecordedRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();

    let headers: HashMap<String, String> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect();

    let length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    while buf.len() < header_end + length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body_end = buf.len().min(header_end + length);
    let body = String::from_utf8_lossy(&buf[header_end..body_end]).to_string();

    Some(RecordedRequest {
        method,
        path,
        headers,
        body,
        local_ip: socket.local_addr().ok()?.ip(),
    })
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        301 => "Moved Permanently",
        404 => "Not Found",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}
