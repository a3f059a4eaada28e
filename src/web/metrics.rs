//! Per-process counters and gauges, served over a loopback listener.
//!
//! The handler only ever adds to the counter map; the gauges have a
//! single writer, the once-per-second tick task, which derives rates
//! from counter deltas and keeps a one-minute window for the average
//! request duration. The listener speaks just enough HTTP/1.1 to
//! answer a GET with one JSON document.

use papaya::HashMap;
use serde_json::json;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

pub const REQUESTS: &str = "requests";
pub const COMPLETED: &str = "completed";
pub const BYTES_TRANSFERRED: &str = "bytes_transferred";
pub const ERR_400: &str = "400";
pub const ERR_404: &str = "404";
pub const ERR_500: &str = "500";

const COUNTER_KEYS: [&str; 6] = [
    REQUESTS,
    COMPLETED,
    BYTES_TRANSFERRED,
    ERR_400,
    ERR_404,
    ERR_500,
];

/// Seconds of duration history behind `duration_1m_avg`.
const WINDOW_SECS: usize = 60;

struct TickWindow {
    last_completed: u64,
    last_bytes: u64,
    last_duration_sum: u64,
    last_duration_count: u64,
    ring: VecDeque<(u64, u64)>,
}

pub struct Metrics {
    counters: HashMap<&'static str, AtomicU64>,
    duration_sum_nanos: AtomicU64,
    duration_count: AtomicU64,
    requests_second: AtomicU64,
    bytes_second: AtomicU64,
    duration_1m_avg: AtomicU64,
    window: Mutex<TickWindow>,
}

impl Metrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        let counters = HashMap::new();
        {
            let pinned = counters.pin();
            for key in COUNTER_KEYS {
                pinned.insert(key, AtomicU64::new(0));
            }
        }

        Arc::new(Self {
            counters,
            duration_sum_nanos: AtomicU64::new(0),
            duration_count: AtomicU64::new(0),
            requests_second: AtomicU64::new(0),
            bytes_second: AtomicU64::new(0),
            duration_1m_avg: AtomicU64::new(0f64.to_bits()),
            window: Mutex::new(TickWindow {
                last_completed: 0,
                last_bytes: 0,
                last_duration_sum: 0,
                last_duration_count: 0,
                ring: VecDeque::with_capacity(WINDOW_SECS),
            }),
        })
    }

    pub fn incr(&self, key: &'static str) {
        self.add(key, 1);
    }

    pub fn add(&self, key: &'static str, n: u64) {
        let counters = self.counters.pin();
        if let Some(counter) = counters.get(key) {
            counter.fetch_add(n, Ordering::Relaxed);
        } else {
            counters.insert(key, AtomicU64::new(n));
        }
    }

    #[must_use]
    pub fn counter(&self, key: &'static str) -> u64 {
        self.counters
            .pin()
            .get(key)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Records one finished request: completion, response bytes, the
    /// status-class counter, and the duration observation.
    pub fn observe(&self, status: u16, response_bytes: u64, duration: Duration) {
        self.incr(COMPLETED);
        self.add(BYTES_TRANSFERRED, response_bytes);
        match status {
            404 => self.incr(ERR_404),
            400..=499 => self.incr(ERR_400),
            500.. => self.incr(ERR_500),
            _ => {}
        }
        self.duration_sum_nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
        self.duration_count.fetch_add(1, Ordering::Relaxed);
    }

    /// One gauge update. Called once per second by the tick task; the
    /// window mutex makes it the gauges' single writer.
    pub fn tick(&self) {
        let mut window = self.window.lock().unwrap();

        let completed = self.counter(COMPLETED);
        let bytes = self.counter(BYTES_TRANSFERRED);
        let duration_sum = self.duration_sum_nanos.load(Ordering::Relaxed);
        let duration_count = self.duration_count.load(Ordering::Relaxed);

        self.requests_second
            .store(completed - window.last_completed, Ordering::Relaxed);
        self.bytes_second
            .store(bytes - window.last_bytes, Ordering::Relaxed);

        let duration_delta = (
            duration_sum - window.last_duration_sum,
            duration_count - window.last_duration_count,
        );
        window.ring.push_back(duration_delta);
        if window.ring.len() > WINDOW_SECS {
            window.ring.pop_front();
        }
        let (sum, count) = window
            .ring
            .iter()
            .fold((0u64, 0u64), |(s, c), (ds, dc)| (s + ds, c + dc));
        let avg = if count == 0 { 0.0 } else { sum as f64 / count as f64 };
        self.duration_1m_avg.store(avg.to_bits(), Ordering::Relaxed);

        window.last_completed = completed;
        window.last_bytes = bytes;
        window.last_duration_sum = duration_sum;
        window.last_duration_count = duration_count;
    }

    #[must_use]
    pub fn snapshot(&self) -> serde_json::Value {
        let mut proxy_counter = serde_json::Map::new();
        let counters = self.counters.pin();
        for entry in &counters {
            proxy_counter.insert(
                (*entry.0).to_string(),
                json!(entry.1.load(Ordering::Relaxed)),
            );
        }

        json!({
            "proxyCounter": proxy_counter,
            "requests_second": self.requests_second.load(Ordering::Relaxed),
            "bytes_second": self.bytes_second.load(Ordering::Relaxed),
            "duration_1m_avg": f64::from_bits(self.duration_1m_avg.load(Ordering::Relaxed)),
        })
    }
}

/// Drives the gauge tick once per second.
pub async fn run_gauge_ticker(metrics: Arc<Metrics>) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        interval.tick().await;
        metrics.tick();
    }
}

/// Serves the metrics snapshot on a loopback address.
///
/// # Panics
///
/// Panics if the listener fails to bind (fatal startup error).
pub async fn run_metrics_listener(addr: SocketAddr, metrics: Arc<Metrics>) {
    let listener = TcpListener::bind(addr).await.unwrap_or_else(|e| {
        panic!("FATAL: Failed to bind metrics listener to {addr}: {e}")
    });

    info!(metrics_addr = %addr, "Metrics listener started");

    loop {
        match listener.accept().await {
            Ok((mut socket, _)) => {
                let metrics = metrics.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_snapshot(&mut socket, &metrics).await {
                        debug!(error = %e, "metrics connection error");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "Accept error");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn serve_snapshot(socket: &mut TcpStream, metrics: &Metrics) -> std::io::Result<()> {
    let mut buf = [0u8; 4096];
    let mut pos = 0;

    loop {
        let n = socket.read(&mut buf[pos..]).await?;
        if n == 0 {
            return Ok(());
        }
        pos += n;

        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(&buf[..pos]) {
            Ok(httparse::Status::Complete(_)) => {
                let response = if req.method == Some("GET") {
                    let body = metrics.snapshot().to_string();
                    format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    )
                } else {
                    "HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                        .to_string()
                };
                socket.write_all(response.as_bytes()).await?;
                return Ok(());
            }
            Ok(httparse::Status::Partial) => {
                if pos >= buf.len() {
                    return Ok(());
                }
            }
            Err(_) => return Ok(()),
        }
    }
}
