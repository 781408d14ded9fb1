/*
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! The bus: registration directory, shard routing, and lifecycle.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error};
use openssl::ssl::SslConnector;
use thiserror::Error;

use crate::boxed::{BoxedMsg, Request};
use crate::codec::Codec;
use crate::directory::Table;
use crate::listener::{AddSocketError, Listener, RemoveSocketError};
use crate::net::Transport;
use crate::send;
use crate::tls::{self, TlsStream};
use crate::worker::WorkerPool;

/// Backpressure shift for register/release acknowledgements; control-plane
/// calls are throttled more gently than the send path.
const REGISTER_BACKPRESSURE_SHIFT: u16 = 7;

const RUNNING: u8 = 0;
const SHUTTING_DOWN: u8 = 1;
const HALTED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Plain,
    Tls,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Listener shard count; sockets are routed by fd.
    pub listeners: usize,
    /// Completion worker threads.
    pub workers: usize,
    /// Queued completions per worker.
    pub worker_queue: usize,
    /// Deadline for requests that do not carry their own.
    pub default_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listeners: 1,
            workers: 2,
            worker_queue: 64,
            default_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Error)]
pub enum InitError {
    #[error("invalid configuration: {0}")]
    Config(&'static str),
    #[error("TLS context: {0}")]
    Tls(#[from] openssl::error::ErrorStack),
    #[error("startup: {0}")]
    Io(#[from] std::io::Error),
}

/// Registration failures hand the connection state back to the caller
/// wherever it is still recoverable.
#[derive(Debug, Error)]
pub enum RegisterError<T> {
    #[error("invalid socket handle")]
    InvalidHandle(T),
    #[error("fd already registered")]
    AlreadyRegistered(T),
    #[error("TLS handshake: {1}")]
    Tls(T, std::io::Error),
    #[error("listener rejected the socket")]
    Rejected(T),
    #[error("listener busy, retry registration")]
    Busy(T),
    #[error("bus is shutting down")]
    ShuttingDown(T),
    /// The listener exited while it held the connection state.
    #[error("listener unavailable")]
    Gone,
}

#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error("fd not registered")]
    NotRegistered,
    #[error("listener busy, retry release")]
    Busy,
    #[error("bus is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("invalid socket handle")]
    InvalidHandle,
    #[error("empty payload")]
    EmptyPayload,
    #[error("fd not registered")]
    NotRegistered,
    #[error("sequence id {seq_id} does not exceed {last}")]
    NonMonotonicSeq { seq_id: i64, last: i64 },
    #[error("listener busy, request rejected")]
    Busy,
    #[error("bus is shutting down")]
    ShuttingDown,
}

struct ConnEntry {
    transport: Transport,
    /// Highest sequence id accepted for this connection.
    last_seq: Option<i64>,
}

/// A request/response bus over caller-owned sockets.
///
/// The bus never closes an fd: callers register a connected, nonblocking
/// socket, and close it themselves after [`release`](Bus::release) (or
/// after shutdown).
pub struct Bus<C: Codec> {
    config: Config,
    directory: Mutex<Table<ConnEntry>>,
    listeners: Vec<Listener<C>>,
    workers: Arc<WorkerPool>,
    tls: SslConnector,
    state: AtomicU8,
}

impl<C: Codec> Bus<C> {
    pub fn new(codec: C, config: Config) -> Result<Bus<C>, InitError> {
        if config.listeners == 0 {
            return Err(InitError::Config("listeners must be at least 1"));
        }
        if config.workers == 0 || config.worker_queue == 0 {
            return Err(InitError::Config("worker pool must be nonempty"));
        }

        let tls = tls::build_connector()?;
        let workers = Arc::new(WorkerPool::new(config.workers, config.worker_queue)?);
        let codec = Arc::new(codec);
        let downstream_capacity = config.workers * config.worker_queue;

        let mut listeners = Vec::with_capacity(config.listeners);
        for i in 0..config.listeners {
            // on failure, already-spawned listeners stop via Drop
            listeners.push(Listener::spawn(
                i,
                codec.clone(),
                workers.clone(),
                downstream_capacity,
            )?);
        }

        debug!(
            "bus started: {} listeners, {} workers",
            config.listeners, config.workers
        );
        Ok(Bus {
            config,
            directory: Mutex::new(Table::new()),
            listeners,
            workers,
            tls,
            state: AtomicU8::new(RUNNING),
        })
    }

    fn shard(&self, fd: RawFd) -> &Listener<C> {
        &self.listeners[fd as usize % self.listeners.len()]
    }

    /// Register a connected, nonblocking socket. For `SocketKind::Tls` the
    /// client handshake runs here, blocking the caller. The fd stays owned
    /// by the caller; one registration per fd.
    pub fn register(
        &self,
        kind: SocketKind,
        fd: RawFd,
        conn: C::Conn,
    ) -> Result<(), RegisterError<C::Conn>> {
        if fd < 0 {
            return Err(RegisterError::InvalidHandle(conn));
        }
        if self.state.load(Ordering::SeqCst) != RUNNING {
            return Err(RegisterError::ShuttingDown(conn));
        }
        if self.directory.lock().unwrap().contains(fd) {
            return Err(RegisterError::AlreadyRegistered(conn));
        }

        let transport = match kind {
            SocketKind::Plain => Transport::Plain,
            SocketKind::Tls => match TlsStream::connect(&self.tls, fd) {
                Ok(stream) => Transport::Tls(stream),
                Err(e) => return Err(RegisterError::Tls(conn, e)),
            },
        };

        match self.shard(fd).add_socket(fd, transport.clone(), conn) {
            Ok(backpressure) => {
                self.directory.lock().unwrap().insert(
                    fd,
                    ConnEntry {
                        transport,
                        last_seq: None,
                    },
                );
                send::backpressure_delay(backpressure, REGISTER_BACKPRESSURE_SHIFT);
                Ok(())
            }
            Err(err) => {
                if let Transport::Tls(t) = &transport {
                    t.shutdown();
                }
                match err {
                    AddSocketError::Busy(conn) => Err(RegisterError::Busy(conn)),
                    AddSocketError::Rejected(conn) => Err(RegisterError::Rejected(conn)),
                    AddSocketError::Gone => Err(RegisterError::Gone),
                }
            }
        }
    }

    /// Stop tracking a socket and return its connection state. The caller
    /// must have no requests in flight on it; any that remain will complete
    /// as receive timeouts.
    pub fn release(&self, fd: RawFd) -> Result<C::Conn, ReleaseError> {
        if fd < 0 {
            return Err(ReleaseError::NotRegistered);
        }
        let entry = match self.directory.lock().unwrap().remove(fd) {
            Some(e) => e,
            None => return Err(ReleaseError::NotRegistered),
        };

        match self.shard(fd).remove_socket(fd) {
            Ok(reply) => {
                if let Transport::Tls(t) = &entry.transport {
                    t.shutdown();
                }
                send::backpressure_delay(reply.backpressure, REGISTER_BACKPRESSURE_SHIFT);
                match reply.conn {
                    Some(conn) => Ok(conn),
                    None => {
                        error!("fd {} was in the directory but not tracked", fd);
                        Err(ReleaseError::NotRegistered)
                    }
                }
            }
            Err(RemoveSocketError::Busy) => {
                // put the entry back so the caller can retry
                self.directory.lock().unwrap().insert(fd, entry);
                Err(ReleaseError::Busy)
            }
            Err(RemoveSocketError::Gone) => Err(ReleaseError::ShuttingDown),
        }
    }

    /// Send a request, blocking this thread for the write. `Ok(())` means
    /// the request was accepted and its callback fires exactly once;
    /// `Err` means it was rejected with no side effects.
    pub fn send_request(&self, req: Request<C::Msg>) -> Result<(), SendError> {
        if req.fd < 0 {
            return Err(SendError::InvalidHandle);
        }
        if req.payload.is_empty() {
            return Err(SendError::EmptyPayload);
        }
        if self.state.load(Ordering::SeqCst) != RUNNING {
            return Err(SendError::ShuttingDown);
        }

        let fd = req.fd;
        let seq_id = req.seq_id;
        let (transport, prev_seq) = {
            let mut dir = self.directory.lock().unwrap();
            let entry = dir.get_mut(fd).ok_or(SendError::NotRegistered)?;
            if let Some(last) = entry.last_seq {
                if seq_id <= last {
                    return Err(SendError::NonMonotonicSeq { seq_id, last });
                }
            }
            let prev = entry.last_seq;
            entry.last_seq = Some(seq_id);
            (entry.transport.clone(), prev)
        };

        let msg = BoxedMsg::new(req, transport, self.config.default_timeout);
        if send::blocking_send(self.shard(fd), &self.workers, msg) {
            Ok(())
        } else {
            // rejected with no side effects; allow the same id again
            let mut dir = self.directory.lock().unwrap();
            if let Some(entry) = dir.get_mut(fd) {
                if entry.last_seq == Some(seq_id) {
                    entry.last_seq = prev_seq;
                }
            }
            Err(SendError::Busy)
        }
    }

    /// Tear the bus down: joins listeners, drains the directory, and stops
    /// the workers. Exactly one caller gets `true`; everyone else (and any
    /// repeat call) gets `false`.
    pub fn shutdown(&self) -> bool {
        if self
            .state
            .compare_exchange(RUNNING, SHUTTING_DOWN, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        debug!("bus shutting down");

        for listener in &self.listeners {
            listener.shutdown_and_join();
        }

        let entries = self.directory.lock().unwrap().drain();
        for (fd, entry) in entries {
            debug!("fd {} still registered at shutdown", fd);
            if let Transport::Tls(t) = &entry.transport {
                t.shutdown();
            }
        }

        self.workers.shutdown();
        self.state.store(HALTED, Ordering::SeqCst);
        debug!("bus halted");
        true
    }
}

impl<C: Codec> Drop for Bus<C> {
    fn drop(&mut self) {
        if self.state.load(Ordering::SeqCst) != HALTED {
            self.shutdown();
        }
    }
}
