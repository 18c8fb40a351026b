#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use torbridge_core::{BridgeConfig, NativeBackend, NativeError, StreamId, StreamObserver};
use torbridge_daemon::TorBridge;

pub const MOCK_STATUS: &str = "BOOTSTRAPPED 100%";

#[derive(Debug)]
pub struct MockService(pub u64);

#[derive(Debug)]
pub struct MockStream(pub u64);

#[derive(Default)]
struct MockState {
    start_failure: Option<Option<String>>,
    status_fails: bool,
    open_failure: Option<String>,
    send_failure: Option<String>,
    shutdown_delay: Duration,
    shutting_down: bool,
    overlapped_starts: usize,
    next_service: u64,
    next_stream: u64,
    log: Vec<String>,
    destroys: HashMap<u64, usize>,
    sends: Vec<(u64, String)>,
    observers: Vec<(u64, StreamObserver)>,
}

/// Scriptable in-memory daemon.
#[derive(Default)]
pub struct MockBackend {
    state: Mutex<MockState>,
    gate_closed: Mutex<bool>,
    gate: Condvar,
    destroy_panics: AtomicBool,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Block every `start_service` until [`MockBackend::release_start`].
    pub fn hold_start(&self) {
        *self.gate_closed.lock().unwrap() = true;
    }

    pub fn release_start(&self) {
        *self.gate_closed.lock().unwrap() = false;
        self.gate.notify_all();
    }

    /// `Some(None)` fails without a message.
    pub fn fail_start(&self, failure: Option<Option<&str>>) {
        self.state.lock().unwrap().start_failure =
            failure.map(|message| message.map(str::to_string));
    }

    pub fn fail_status(&self, fails: bool) {
        self.state.lock().unwrap().status_fails = fails;
    }

    pub fn fail_open(&self, message: Option<&str>) {
        self.state.lock().unwrap().open_failure = message.map(str::to_string);
    }

    pub fn fail_send(&self, message: Option<&str>) {
        self.state.lock().unwrap().send_failure = message.map(str::to_string);
    }

    /// Make `destroy_stream` panic, as a misbehaving native library might.
    pub fn panic_on_destroy(&self, panics: bool) {
        self.destroy_panics.store(panics, Ordering::SeqCst);
    }

    /// Make every `shutdown_service` take `delay` before it returns.
    pub fn slow_shutdown(&self, delay: Duration) {
        self.state.lock().unwrap().shutdown_delay = delay;
    }

    /// Starts that ran while an earlier daemon was still shutting down.
    pub fn overlapped_starts(&self) -> usize {
        self.state.lock().unwrap().overlapped_starts
    }

    /// Every native call that released something, in order.
    pub fn log(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn shutdowns(&self) -> usize {
        self.log()
            .iter()
            .filter(|entry| entry.starts_with("shutdown:"))
            .count()
    }

    pub fn total_destroys(&self) -> usize {
        self.state.lock().unwrap().destroys.values().sum()
    }

    /// Destroys across every native stream ever opened under `id`.
    pub fn destroy_count(&self, id: &StreamId) -> usize {
        let state = self.state.lock().unwrap();
        state
            .observers
            .iter()
            .filter(|(_, observer)| &observer.token().stream_id == id)
            .map(|(native, _)| state.destroys.get(native).copied().unwrap_or(0))
            .sum()
    }

    pub fn max_destroys_per_stream(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .destroys
            .values()
            .copied()
            .max()
            .unwrap_or(0)
    }

    pub fn sends(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .sends
            .iter()
            .map(|(_, message)| message.clone())
            .collect()
    }

    /// Most recent observer registered for `id`.
    pub fn observer(&self, id: &StreamId) -> StreamObserver {
        self.state
            .lock()
            .unwrap()
            .observers
            .iter()
            .rev()
            .find(|(_, observer)| &observer.token().stream_id == id)
            .map(|(_, observer)| observer.clone())
            .expect("no observer registered for stream")
    }

    /// Fire a data callback from a thread the runtime does not own.
    pub fn fire_data(&self, id: &StreamId, payload: &str) {
        fire(self.observer(id), payload.to_string(), false);
    }

    pub fn fire_error(&self, id: &StreamId, payload: &str) {
        fire(self.observer(id), payload.to_string(), true);
    }
}

pub fn fire(observer: StreamObserver, payload: String, error: bool) {
    std::thread::spawn(move || {
        if error {
            observer.on_error(payload);
        } else {
            observer.on_data(payload);
        }
    })
    .join()
    .expect("callback thread panicked");
}

impl NativeBackend for MockBackend {
    type Service = MockService;
    type Stream = MockStream;

    fn start_service(
        &self,
        work_dir: &Path,
        _socks_port: u16,
        _timeout: Duration,
    ) -> Result<MockService, NativeError> {
        assert!(work_dir.is_dir(), "work dir must exist before start");
        {
            let mut closed = self.gate_closed.lock().unwrap();
            while *closed {
                closed = self.gate.wait(closed).unwrap();
            }
        }
        let mut state = self.state.lock().unwrap();
        if state.shutting_down {
            state.overlapped_starts += 1;
        }
        if let Some(failure) = state.start_failure.clone() {
            return Err(NativeError::from_optional(failure));
        }
        state.next_service += 1;
        Ok(MockService(state.next_service))
    }

    fn service_status(&self, _service: &MockService) -> Result<String, NativeError> {
        if self.state.lock().unwrap().status_fails {
            return Err(NativeError::unknown());
        }
        Ok(MOCK_STATUS.to_string())
    }

    fn shutdown_service(&self, service: MockService) {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.shutting_down = true;
            state.shutdown_delay
        };
        std::thread::sleep(delay);
        let mut state = self.state.lock().unwrap();
        state.shutting_down = false;
        state.log.push(format!("shutdown:{}", service.0));
    }

    fn open_stream(
        &self,
        _target: &str,
        _proxy: SocketAddr,
        _timeout: Duration,
    ) -> Result<MockStream, NativeError> {
        let mut state = self.state.lock().unwrap();
        if let Some(message) = state.open_failure.clone() {
            return Err(NativeError::new(message));
        }
        state.next_stream += 1;
        Ok(MockStream(state.next_stream))
    }

    fn subscribe_stream(&self, stream: &MockStream, observer: StreamObserver) {
        self.state
            .lock()
            .unwrap()
            .observers
            .push((stream.0, observer));
    }

    fn send_stream(
        &self,
        stream: &MockStream,
        message: &str,
        _timeout: Duration,
    ) -> Result<(), NativeError> {
        let mut state = self.state.lock().unwrap();
        if let Some(failure) = state.send_failure.clone() {
            return Err(NativeError::new(failure));
        }
        state.sends.push((stream.0, message.to_string()));
        Ok(())
    }

    fn destroy_stream(&self, stream: MockStream) {
        if self.destroy_panics.load(Ordering::SeqCst) {
            panic!("native destroy of stream {} blew up", stream.0);
        }
        let mut state = self.state.lock().unwrap();
        *state.destroys.entry(stream.0).or_default() += 1;
        state.log.push(format!("destroy:{}", stream.0));
    }
}

pub fn config_in(dir: &TempDir, socks_port: u16) -> BridgeConfig {
    BridgeConfig {
        socks_port,
        work_dir: dir.path().join("work"),
        ..BridgeConfig::default()
    }
}

pub fn bridge(mock: &Arc<MockBackend>) -> (TempDir, TorBridge<MockBackend>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let bridge = TorBridge::new(config_in(&dir, 19032), mock.clone());
    (dir, bridge)
}

pub async fn running_bridge(mock: &Arc<MockBackend>) -> (TempDir, TorBridge<MockBackend>) {
    let (dir, bridge) = bridge(mock);
    bridge
        .start_daemon(Duration::from_secs(5), Duration::from_secs(5))
        .await
        .expect("mock daemon starts");
    (dir, bridge)
}

/// Poll `condition` for up to two seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// One canned HTTP response behind a minimal SOCKS5 front.
pub struct MockHttpProxy {
    pub port: u16,
    pub requests: mpsc::UnboundedReceiver<CapturedRequest>,
}

#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub target_host: String,
    pub target_port: u16,
    pub head: String,
    pub body: Vec<u8>,
}

impl MockHttpProxy {
    pub async fn spawn(status: u16, content_type: &str, body: &[u8]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        let (tx, requests) = mpsc::unbounded_channel();
        let mut response = format!(
            "HTTP/1.1 {status} Mock\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        )
        .into_bytes();
        response.extend_from_slice(body);

        tokio::spawn(async move {
            while let Ok((conn, _)) = listener.accept().await {
                let tx = tx.clone();
                let response = response.clone();
                tokio::spawn(async move {
                    if let Ok(captured) = serve(conn, &response).await {
                        let _ = tx.send(captured);
                    }
                });
            }
        });
        Self { port, requests }
    }
}

async fn serve(mut conn: TcpStream, response: &[u8]) -> std::io::Result<CapturedRequest> {
    let mut greeting = [0u8; 2];
    conn.read_exact(&mut greeting).await?;
    let mut methods = vec![0u8; usize::from(greeting[1])];
    conn.read_exact(&mut methods).await?;
    conn.write_all(&[0x05, 0x00]).await?;

    let mut head = [0u8; 4];
    conn.read_exact(&mut head).await?;
    let target_host = match head[3] {
        0x03 => {
            let mut len = [0u8; 1];
            conn.read_exact(&mut len).await?;
            let mut host = vec![0u8; usize::from(len[0])];
            conn.read_exact(&mut host).await?;
            String::from_utf8_lossy(&host).into_owned()
        }
        0x01 => {
            let mut ip = [0u8; 4];
            conn.read_exact(&mut ip).await?;
            std::net::Ipv4Addr::from(ip).to_string()
        }
        _ => {
            let mut ip = [0u8; 16];
            conn.read_exact(&mut ip).await?;
            std::net::Ipv6Addr::from(ip).to_string()
        }
    };
    let mut port = [0u8; 2];
    conn.read_exact(&mut port).await?;
    conn.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await?;

    let mut raw = Vec::new();
    let mut buf = [0u8; 1024];
    let header_end = loop {
        let n = conn.read(&mut buf).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        raw.extend_from_slice(&buf[..n]);
        if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let head_text = String::from_utf8_lossy(&raw[..header_end]).into_owned();
    let content_length = head_text
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    let mut body = raw[header_end..].to_vec();
    while body.len() < content_length {
        let n = conn.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
    }

    conn.write_all(response).await?;
    conn.shutdown().await?;
    Ok(CapturedRequest {
        target_host,
        target_port: u16::from_be_bytes(port),
        head: head_text,
        body,
    })
}
