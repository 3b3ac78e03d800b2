//! Blocking client for the Translate service
//!
//! `TranslateClient` owns one TCP stream. `ClientPool` opens up to
//! `max_streams` of them and hands idle ones out again; a client that hit
//! an I/O or framing error is closed instead of being returned.

use std::io::{BufReader, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, MutexGuard};

use super::protocol::{self, ProtocolError, ProtocolReader, RpcReply, RpcRequest};
use super::DEFAULT_MAX_MESSAGE_BYTES;

/// Single-connection client
pub struct TranslateClient {
    reader: ProtocolReader<BufReader<TcpStream>>,
    writer: TcpStream,
    next_seq_id: i32,
    broken: bool,
}

impl TranslateClient {
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self, ProtocolError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let writer = stream.try_clone()?;

        Ok(Self {
            reader: ProtocolReader::new(BufReader::new(stream), DEFAULT_MAX_MESSAGE_BYTES),
            writer,
            next_seq_id: 0,
            broken: false,
        })
    }

    pub fn translate(&mut self, source: &str) -> Result<String, ProtocolError> {
        let request = RpcRequest::Translate { source: source.to_string() };
        match self.call(&request)? {
            RpcReply::Translate(text) => Ok(text),
            RpcReply::BatchTranslate(_) => Err(ProtocolError::MissingResult(request.method().to_string())),
        }
    }

    pub fn batch_translate(&mut self, sources: &[String]) -> Result<Vec<String>, ProtocolError> {
        let request = RpcRequest::BatchTranslate { sources: sources.to_vec() };
        match self.call(&request)? {
            RpcReply::BatchTranslate(texts) => Ok(texts),
            RpcReply::Translate(_) => Err(ProtocolError::MissingResult(request.method().to_string())),
        }
    }

    /// Whether the connection can still be used
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    fn call(&mut self, request: &RpcRequest) -> Result<RpcReply, ProtocolError> {
        let seq_id = self.next_seq_id;
        self.next_seq_id = self.next_seq_id.wrapping_add(1);

        let result = self.exchange(seq_id, request);
        if let Err(e) = &result {
            // Remote exceptions leave the stream in sync
            if !matches!(e, ProtocolError::Application(_)) {
                self.broken = true;
            }
        }
        result
    }

    fn exchange(&mut self, seq_id: i32, request: &RpcRequest) -> Result<RpcReply, ProtocolError> {
        let data = protocol::encode_call(seq_id, request);
        self.writer.write_all(&data)?;
        self.writer.flush()?;

        let header = self.reader.read_message_begin()?;
        let reply = protocol::read_reply(&header, &mut self.reader, request.method());
        if header.seq_id != seq_id {
            return Err(ProtocolError::BadSequenceId { expected: seq_id, actual: header.seq_id });
        }
        reply
    }
}

/// Pool of client connections to one server.
///
/// At most `max_streams` connections are open at once; `get` blocks until
/// one is free when the cap is reached.
pub struct ClientPool {
    addr: SocketAddr,
    max_streams: usize,
    state: Mutex<PoolState>,
    available: Condvar,
}

#[derive(Default)]
struct PoolState {
    idle: Vec<TranslateClient>,
    /// Idle plus checked out
    open: usize,
}

impl ClientPool {
    pub fn new(addr: SocketAddr, max_streams: usize) -> Self {
        Self {
            addr,
            max_streams: max_streams.max(1),
            state: Mutex::new(PoolState::default()),
            available: Condvar::new(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Check out a client, reusing an idle connection when one exists
    pub fn get(&self) -> Result<PooledClient<'_>, ProtocolError> {
        let mut state = self.lock_state();
        loop {
            if let Some(client) = state.idle.pop() {
                return Ok(PooledClient::new(self, client));
            }
            if state.open < self.max_streams {
                state.open += 1;
                break;
            }
            state = self.available.wait(state).unwrap_or_else(|e| e.into_inner());
        }
        drop(state);

        log::debug!("Opening connection to {}", self.addr);
        match TranslateClient::connect(self.addr) {
            Ok(client) => Ok(PooledClient::new(self, client)),
            Err(e) => {
                self.close_one();
                Err(e)
            }
        }
    }

    pub fn idle_count(&self) -> usize {
        self.lock_state().idle.len()
    }

    /// Connections currently open, idle or checked out
    pub fn open_count(&self) -> usize {
        self.lock_state().open
    }

    fn close_one(&self) {
        let mut state = self.lock_state();
        state.open = state.open.saturating_sub(1);
        self.available.notify_one();
    }

    fn release(&self, client: TranslateClient) {
        if client.is_broken() {
            log::debug!("Discarding broken connection to {}", self.addr);
            self.close_one();
            return;
        }
        self.lock_state().idle.push(client);
        self.available.notify_one();
    }
}

/// Client checked out of a `ClientPool`; returned on drop
pub struct PooledClient<'a> {
    pool: &'a ClientPool,
    client: ManuallyDrop<TranslateClient>,
}

impl<'a> PooledClient<'a> {
    fn new(pool: &'a ClientPool, client: TranslateClient) -> Self {
        Self { pool, client: ManuallyDrop::new(client) }
    }
}

impl Deref for PooledClient<'_> {
    type Target = TranslateClient;

    fn deref(&self) -> &TranslateClient {
        &self.client
    }
}

impl DerefMut for PooledClient<'_> {
    fn deref_mut(&mut self) -> &mut TranslateClient {
        &mut self.client
    }
}

impl Drop for PooledClient<'_> {
    fn drop(&mut self) {
        // SAFETY: `client` is taken exactly once, here, and never used after
        let client = unsafe { ManuallyDrop::take(&mut self.client) };
        self.pool.release(client);
    }
}
