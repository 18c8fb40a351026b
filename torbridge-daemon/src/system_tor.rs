//! Native backend that drives a system `tor` binary.
//!
//! The daemon is a child process whose bootstrap progress is read from its
//! notice log on stdout. Streams are plain blocking TCP connections to the
//! SOCKS port with a SOCKS5 CONNECT in front; one reader thread per stream
//! feeds the observer.

use std::io::{self, BufRead, BufReader, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use torbridge_core::{NativeBackend, NativeError, StreamObserver};

use crate::callbacks::{DISCONNECT_MARKER, EOF_SIGNAL};

const READ_CHUNK: usize = 4096;
const MIN_IO_TIMEOUT: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct SystemTorBackend {
    tor_binary: PathBuf,
}

impl SystemTorBackend {
    pub fn new(tor_binary: impl Into<PathBuf>) -> Self {
        Self {
            tor_binary: tor_binary.into(),
        }
    }

    pub fn tor_binary(&self) -> &Path {
        &self.tor_binary
    }
}

impl Default for SystemTorBackend {
    fn default() -> Self {
        Self::new("tor")
    }
}

/// A bootstrapped tor child process.
pub struct TorProcess {
    child: Mutex<Child>,
    progress: Arc<AtomicU8>,
}

/// A SOCKS-tunnelled TCP connection.
pub struct SocksStream {
    stream: TcpStream,
    gate: Arc<CallbackGate>,
}

/// Orders callback dispatch against destroy.
///
/// The reader holds `dispatch` from its `closed` check until the callback
/// returns, and a destroy from any other thread takes it before setting
/// `closed`. A destroy issued from inside a callback already runs on the
/// reader thread, so it only sets the flag.
#[derive(Default)]
struct CallbackGate {
    dispatch: Mutex<()>,
    closed: AtomicBool,
    reader: OnceLock<ThreadId>,
}

impl CallbackGate {
    fn close(&self) {
        if self.reader.get() == Some(&thread::current().id()) {
            self.closed.store(true, Ordering::SeqCst);
            return;
        }
        let _dispatch = self.dispatch.lock().unwrap_or_else(PoisonError::into_inner);
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Run `callback` unless the stream was destroyed. Returns `false` once closed.
    fn deliver(&self, callback: impl FnOnce()) -> bool {
        let _dispatch = self.dispatch.lock().unwrap_or_else(PoisonError::into_inner);
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        callback();
        true
    }
}

impl NativeBackend for SystemTorBackend {
    type Service = TorProcess;
    type Stream = SocksStream;

    fn start_service(
        &self,
        work_dir: &Path,
        socks_port: u16,
        timeout: Duration,
    ) -> Result<TorProcess, NativeError> {
        let data_dir = work_dir.join("tor");
        std::fs::create_dir_all(&data_dir).map_err(|err| {
            NativeError::new(format!("cannot create {}: {err}", data_dir.display()))
        })?;

        let mut child = Command::new(&self.tor_binary)
            .arg("--SocksPort")
            .arg(format!("127.0.0.1:{socks_port}"))
            .arg("--DataDirectory")
            .arg(&data_dir)
            .arg("--Log")
            .arg("notice stdout")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| {
                NativeError::new(format!(
                    "cannot launch {}: {err}",
                    self.tor_binary.display()
                ))
            })?;

        let Some(stdout) = child.stdout.take() else {
            reap(&mut child);
            return Err(NativeError::new("tor stdout was not captured"));
        };
        let progress = Arc::new(AtomicU8::new(0));
        let (tx, rx) = mpsc::channel();
        if let Err(err) = spawn_log_reader(stdout, progress.clone(), tx) {
            reap(&mut child);
            return Err(NativeError::new(format!("cannot start log reader: {err}")));
        }

        let deadline = Instant::now() + timeout;
        let mut last_line = String::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(line) => {
                    if parse_bootstrap(&line) == Some(100) {
                        tracing::debug!(pid = child.id(), "tor bootstrapped");
                        return Ok(TorProcess {
                            child: Mutex::new(child),
                            progress,
                        });
                    }
                    last_line = line;
                }
                Err(RecvTimeoutError::Timeout) => {
                    reap(&mut child);
                    return Err(NativeError::new(format!(
                        "tor did not bootstrap within {}ms (last output: {})",
                        timeout.as_millis(),
                        describe(&last_line)
                    )));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    let exit = child
                        .wait()
                        .map(|status| status.to_string())
                        .unwrap_or_else(|err| err.to_string());
                    return Err(NativeError::new(format!(
                        "tor exited before bootstrapping ({exit}): {}",
                        describe(&last_line)
                    )));
                }
            }
        }
    }

    fn service_status(&self, service: &TorProcess) -> Result<String, NativeError> {
        let mut child = service.child.lock().unwrap_or_else(PoisonError::into_inner);
        match child.try_wait() {
            Ok(Some(status)) => Err(NativeError::new(format!("tor exited: {status}"))),
            Err(err) => Err(NativeError::new(err.to_string())),
            Ok(None) => {
                let percent = service.progress.load(Ordering::SeqCst);
                Ok(if percent >= 100 {
                    "BOOTSTRAPPED 100%".to_string()
                } else {
                    format!("BOOTSTRAPPING {percent}%")
                })
            }
        }
    }

    fn shutdown_service(&self, service: TorProcess) {
        let mut child = service
            .child
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        tracing::debug!(pid = child.id(), "terminating tor");
        reap(&mut child);
    }

    fn open_stream(
        &self,
        target: &str,
        proxy: SocketAddr,
        timeout: Duration,
    ) -> Result<SocksStream, NativeError> {
        let (host, port) = split_target(target)?;
        let timeout = timeout.max(MIN_IO_TIMEOUT);
        let mut stream = TcpStream::connect_timeout(&proxy, timeout).map_err(|err| {
            NativeError::new(format!("cannot reach SOCKS proxy at {proxy}: {err}"))
        })?;
        stream
            .set_read_timeout(Some(timeout))
            .and_then(|_| stream.set_write_timeout(Some(timeout)))
            .map_err(|err| NativeError::new(err.to_string()))?;

        socks5_connect(&mut stream, host, port)?;

        stream
            .set_read_timeout(None)
            .and_then(|_| stream.set_nodelay(true))
            .map_err(|err| NativeError::new(err.to_string()))?;
        Ok(SocksStream {
            stream,
            gate: Arc::default(),
        })
    }

    fn subscribe_stream(&self, stream: &SocksStream, observer: StreamObserver) {
        let reader = match stream.stream.try_clone() {
            Ok(reader) => reader,
            Err(err) => {
                observer.on_error(format!("{DISCONNECT_MARKER}: {err}"));
                return;
            }
        };
        let gate = stream.gate.clone();
        let name = format!("tor-stream-{}", observer.token().stream_id);
        let spawned = thread::Builder::new()
            .name(name)
            .spawn(move || read_loop(reader, gate, observer));
        if let Err(err) = spawned {
            tracing::warn!(error = %err, "cannot spawn stream reader");
        }
    }

    fn send_stream(
        &self,
        stream: &SocksStream,
        message: &str,
        timeout: Duration,
    ) -> Result<(), NativeError> {
        let mut writer = &stream.stream;
        writer
            .set_write_timeout(Some(timeout.max(MIN_IO_TIMEOUT)))
            .and_then(|_| writer.write_all(message.as_bytes()))
            .and_then(|_| writer.flush())
            .map_err(|err| NativeError::new(err.to_string()))
    }

    fn destroy_stream(&self, stream: SocksStream) {
        stream.gate.close();
        if let Err(err) = stream.stream.shutdown(Shutdown::Both) {
            tracing::debug!(error = %err, "stream shutdown");
        }
    }
}

fn read_loop(mut reader: TcpStream, gate: Arc<CallbackGate>, observer: StreamObserver) {
    let _ = gate.reader.set(thread::current().id());
    let mut buf = [0u8; READ_CHUNK];
    loop {
        let result = reader.read(&mut buf);
        let delivered = match result {
            Ok(0) => {
                gate.deliver(|| observer.on_error(EOF_SIGNAL.to_string()));
                return;
            }
            Ok(n) => gate.deliver(|| {
                observer.on_data(String::from_utf8_lossy(&buf[..n]).into_owned())
            }),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                gate.deliver(|| observer.on_error(describe_read_error(&err)));
                return;
            }
        };
        if !delivered {
            return;
        }
    }
}

fn describe_read_error(err: &io::Error) -> String {
    match err.kind() {
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::BrokenPipe => format!("{DISCONNECT_MARKER}: {err}"),
        _ => err.to_string(),
    }
}

fn spawn_log_reader(
    stdout: ChildStdout,
    progress: Arc<AtomicU8>,
    lines: mpsc::Sender<String>,
) -> io::Result<()> {
    thread::Builder::new().name("tor-log".into()).spawn(move || {
        // Keeps draining after start returns so tor never blocks on a full pipe.
        for line in BufReader::new(stdout).lines() {
            let Ok(line) = line else { break };
            if let Some(percent) = parse_bootstrap(&line) {
                progress.store(percent, Ordering::SeqCst);
            }
            tracing::debug!(tor = %line);
            let _ = lines.send(line);
        }
    })?;
    Ok(())
}

fn reap(child: &mut Child) {
    if let Err(err) = child.kill() {
        tracing::debug!(error = %err, "tor kill");
    }
    if let Err(err) = child.wait() {
        tracing::warn!(error = %err, "failed to reap tor");
    }
}

fn describe(line: &str) -> &str {
    if line.trim().is_empty() {
        "<none>"
    } else {
        line.trim()
    }
}

/// `... [notice] Bootstrapped 45% (loading_descriptors): ...` → `45`.
pub(crate) fn parse_bootstrap(line: &str) -> Option<u8> {
    let (_, rest) = line.split_once("Bootstrapped ")?;
    let (digits, _) = rest.split_once('%')?;
    digits.trim().parse::<u8>().ok().filter(|p| *p <= 100)
}

/// `host:port`, with optional brackets around an IPv6 host.
pub(crate) fn split_target(target: &str) -> Result<(&str, u16), NativeError> {
    let invalid = || NativeError::new(format!("invalid target '{target}', expected host:port"));
    let (host, port) = target.rsplit_once(':').ok_or_else(invalid)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(invalid());
    }
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    Ok((host, port))
}

fn socks5_connect(stream: &mut TcpStream, host: &str, port: u16) -> Result<(), NativeError> {
    let io = |stage: &str| {
        let stage = stage.to_string();
        move |err: io::Error| NativeError::new(format!("SOCKS5 {stage} failed: {err}"))
    };

    stream.write_all(&[0x05, 0x01, 0x00]).map_err(io("greeting"))?;
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).map_err(io("greeting"))?;
    if choice != [0x05, 0x00] {
        return Err(NativeError::new("SOCKS5 proxy refused no-auth method"));
    }

    let host_bytes = host.as_bytes();
    let host_len = u8::try_from(host_bytes.len())
        .map_err(|_| NativeError::new(format!("hostname too long: {host}")))?;
    let mut request = Vec::with_capacity(7 + host_bytes.len());
    request.extend_from_slice(&[0x05, 0x01, 0x00, 0x03, host_len]);
    request.extend_from_slice(host_bytes);
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).map_err(io("connect"))?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).map_err(io("connect reply"))?;
    if reply[0] != 0x05 {
        return Err(NativeError::new("invalid SOCKS5 version in reply"));
    }
    if reply[1] != 0x00 {
        return Err(NativeError::new(format!(
            "SOCKS5 connect to {host}:{port} failed: {}",
            reply_message(reply[1])
        )));
    }

    // Bound address is unused but must be consumed.
    let remaining = match reply[3] {
        0x01 => 4 + 2,
        0x04 => 16 + 2,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).map_err(io("connect reply"))?;
            usize::from(len[0]) + 2
        }
        other => {
            return Err(NativeError::new(format!(
                "invalid SOCKS5 address type {other:#04x}"
            )))
        }
    };
    let mut bound = vec![0u8; remaining];
    stream.read_exact(&mut bound).map_err(io("connect reply"))?;
    Ok(())
}

fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown SOCKS5 error",
    }
}
