//! Translate RPC Service
//!
//! TCP server that reads Thrift binary messages from each connection and
//! answers every call before reading the next one.
//!
//! Protocol (unframed, big-endian):
//!   Call:  [header: version|CALL, name, seq_id] [args struct]
//!   Reply: [header: version|REPLY, name, seq_id] [result struct, field 0]
//!   Fault: [header: version|EXCEPTION, name, seq_id] [TApplicationException]

use std::io::{self, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::protocol::{
    self, ApplicationException, MessageHeader, MessageType, ProtocolError, ProtocolReader, RpcReply,
    RpcRequest,
};
use super::{DEFAULT_MAX_MESSAGE_BYTES, DEFAULT_PORT};
use crate::error::{Error, Result};
use crate::translation::{
    EngineWorker, RequestCounter, TranslationAdapter, TranslationRequest, TranslationResponse,
    WorkerHandle,
};

/// How often idle loops re-check the running flag
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    /// 1 handles connections one after another on the accept thread
    pub max_connections: usize,
    pub max_message_bytes: usize,
    pub verbose: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            max_connections: 1,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            verbose: true,
        }
    }
}

/// Service statistics
#[derive(Debug, Default, Clone)]
pub struct ServiceStats {
    pub connections: u64,
    pub requests: u64,
    pub sentences: u64,
    pub faults: u64,
    pub total_time_ms: f64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    connections: AtomicU64,
    requests: AtomicU64,
    sentences: AtomicU64,
    faults: AtomicU64,
    total_time_us: AtomicU64,
}

impl StatsCounters {
    fn snapshot(&self) -> ServiceStats {
        ServiceStats {
            connections: self.connections.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            sentences: self.sentences.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            total_time_ms: self.total_time_us.load(Ordering::Relaxed) as f64 / 1000.0,
        }
    }
}

impl From<RpcRequest> for TranslationRequest {
    fn from(request: RpcRequest) -> Self {
        match request {
            RpcRequest::Translate { source } => TranslationRequest::Single(source),
            RpcRequest::BatchTranslate { sources } => TranslationRequest::Batch(sources),
        }
    }
}

impl From<TranslationResponse> for RpcReply {
    fn from(response: TranslationResponse) -> Self {
        match response {
            TranslationResponse::Single(text) => RpcReply::Translate(text),
            TranslationResponse::Batch(texts) => RpcReply::BatchTranslate(texts),
        }
    }
}

/// Translate RPC service
pub struct RpcService {
    config: ServiceConfig,
    worker: EngineWorker,
    counter: Arc<RequestCounter>,
    stats: Arc<StatsCounters>,
    running: Arc<AtomicBool>,
    listener: Option<TcpListener>,
}

impl RpcService {
    /// Create the service and start its engine worker. Nothing is bound yet.
    pub fn new(config: ServiceConfig, adapter: TranslationAdapter) -> Result<Self> {
        let counter = Arc::new(RequestCounter::new());
        let worker = EngineWorker::spawn(adapter, counter.clone())?;

        Ok(Self {
            config,
            worker,
            counter,
            stats: Arc::new(StatsCounters::default()),
            running: Arc::new(AtomicBool::new(true)),
            listener: None,
        })
    }

    /// Get a handle to stop the service
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn request_counter(&self) -> Arc<RequestCounter> {
        self.counter.clone()
    }

    /// Bind the listening socket and return its address
    pub fn bind(&mut self) -> Result<SocketAddr> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).map_err(|source| Error::Bind { addr, source })?;

        // Non-blocking so the loop can notice shutdown
        listener.set_nonblocking(true)?;

        let local = listener.local_addr()?;
        self.listener = Some(listener);
        Ok(local)
    }

    /// Run the service (blocking) until the stop handle is cleared
    pub fn run(mut self) -> Result<ServiceStats> {
        if self.listener.is_none() {
            self.bind()?;
        }
        let Some(listener) = self.listener.take() else {
            return Err(Error::Io(io::Error::from(io::ErrorKind::NotConnected)));
        };
        let local = listener.local_addr()?;

        if self.config.verbose {
            println!("╔══════════════════════════════════════════════════════════╗");
            println!("║          NMT Translate RPC Service                       ║");
            println!("╠══════════════════════════════════════════════════════════╣");
            println!("║  Address: {:<46} ║", local);
            println!("║  Max connections: {:<38} ║", self.config.max_connections);
            println!("║  Status: READY                                           ║");
            println!("╚══════════════════════════════════════════════════════════╝");
            println!();
        }

        let connection = Connection {
            worker: self.worker.handle(),
            stats: self.stats.clone(),
            running: self.running.clone(),
            max_message_bytes: self.config.max_message_bytes,
        };
        let active = Arc::new(AtomicUsize::new(0));
        let mut handlers: Vec<JoinHandle<()>> = Vec::new();

        while self.running.load(Ordering::SeqCst) {
            if self.config.max_connections > 1 && active.load(Ordering::SeqCst) >= self.config.max_connections {
                thread::sleep(Duration::from_millis(10));
                continue;
            }

            match listener.accept() {
                Ok((stream, peer)) => {
                    self.stats.connections.fetch_add(1, Ordering::Relaxed);
                    log::info!("Connection from {}", peer);

                    if self.config.max_connections <= 1 {
                        if let Err(e) = connection.serve(stream) {
                            log::warn!("Connection {} closed: {}", peer, e);
                        }
                    } else {
                        handlers.push(spawn_handler(connection.clone(), stream, peer, active.clone())?);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // No pending connection, sleep briefly
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    log::error!("Accept error: {}", e);
                    self.stats.faults.fetch_add(1, Ordering::Relaxed);
                }
            }

            handlers.retain(|h| !h.is_finished());
        }

        log::info!("Shutting down, waiting for {} connection(s)", handlers.len());
        for handler in handlers {
            let _ = handler.join();
        }
        drop(connection);
        drop(listener);

        let jobs = self.worker.shutdown();
        let stats = self.stats.snapshot();

        if self.config.verbose {
            println!("\nService stopped. Stats:");
            println!("  Connections: {}", stats.connections);
            println!("  Requests: {} ({} engine jobs)", stats.requests, jobs);
            println!("  Sentences translated: {}", stats.sentences);
            println!("  Faults: {}", stats.faults);
            println!("  Total engine time: {:.2}ms", stats.total_time_ms);
        }

        Ok(stats)
    }
}

fn spawn_handler(
    connection: Connection,
    stream: TcpStream,
    peer: SocketAddr,
    active: Arc<AtomicUsize>,
) -> io::Result<JoinHandle<()>> {
    active.fetch_add(1, Ordering::SeqCst);
    let spawned = thread::Builder::new()
        .name(format!("conn-{}", peer))
        .spawn({
            let active = active.clone();
            move || {
                if let Err(e) = connection.serve(stream) {
                    log::warn!("Connection {} closed: {}", peer, e);
                }
                active.fetch_sub(1, Ordering::SeqCst);
            }
        });
    if spawned.is_err() {
        active.fetch_sub(1, Ordering::SeqCst);
    }
    spawned
}

/// Per-connection state shared with the accept loop
#[derive(Clone)]
struct Connection {
    worker: WorkerHandle,
    stats: Arc<StatsCounters>,
    running: Arc<AtomicBool>,
    max_message_bytes: usize,
}

impl Connection {
    /// Handle calls until the peer disconnects or the service stops
    fn serve(&self, stream: TcpStream) -> std::result::Result<(), ProtocolError> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;

        let mut writer = stream.try_clone()?;
        let mut reader = ProtocolReader::new(BufReader::new(stream), self.max_message_bytes);

        loop {
            let buffered = !reader.get_ref().buffer().is_empty();
            if !buffered && !wait_readable(reader.get_ref().get_ref(), &self.running)? {
                return Ok(());
            }

            let header = reader.read_message_begin()?;
            let (response, result) = match protocol::read_request(&header, &mut reader) {
                Ok(request) => (self.dispatch(&header, request), Ok(())),
                Err(e) => {
                    self.stats.faults.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Bad '{}' message (seq {}): {}", header.name, header.seq_id, e);
                    let data = protocol::encode_exception(&header.name, header.seq_id, &e.to_exception());
                    let result = if e.is_recoverable() { Ok(()) } else { Err(e) };
                    (data, result)
                }
            };

            if header.kind != MessageType::Oneway {
                writer.write_all(&response)?;
                writer.flush()?;
            }
            result?;
        }
    }

    /// Run one call on the engine worker and encode its reply or fault
    fn dispatch(&self, header: &MessageHeader, request: RpcRequest) -> Vec<u8> {
        let sentences = request.sentence_count();
        let start = Instant::now();
        let result = self.worker.submit(request.into());
        let elapsed = start.elapsed();

        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        self.stats.total_time_us.fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);

        match result {
            Ok(response) => {
                self.stats.sentences.fetch_add(sentences as u64, Ordering::Relaxed);
                log::debug!(
                    "{} (seq {}): {} sentence(s) in {:.2}ms",
                    header.name,
                    header.seq_id,
                    sentences,
                    elapsed.as_secs_f64() * 1000.0
                );
                protocol::encode_reply(header.seq_id, &RpcReply::from(response))
            }
            Err(e) => {
                self.stats.faults.fetch_add(1, Ordering::Relaxed);
                log::error!("{} (seq {}) failed: {}", header.name, header.seq_id, e);
                let exc = ApplicationException::internal_error(e.to_string());
                protocol::encode_exception(&header.name, header.seq_id, &exc)
            }
        }
    }
}

/// Block until the peer sends data. Returns false on EOF or shutdown.
fn wait_readable(stream: &TcpStream, running: &AtomicBool) -> io::Result<bool> {
    stream.set_read_timeout(Some(POLL_INTERVAL))?;

    let mut probe = [0u8; 1];
    let ready = loop {
        match stream.peek(&mut probe) {
            Ok(0) => break false,
            Ok(_) => break true,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                if !running.load(Ordering::SeqCst) {
                    break false;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    };

    stream.set_read_timeout(None)?;
    Ok(ready)
}
