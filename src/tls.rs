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

//! Client TLS over a registered fd.
//!
//! One TLS session per socket, shared between the caller's send path and
//! the listener thread. Each side holds the session lock only for the
//! duration of a single read or write call; `SslStream` maps WANT_READ and
//! WANT_WRITE to `WouldBlock`, so both sides keep their usual nonblocking
//! retry loops.

use std::io::{self, Read, Write};
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, warn};
use openssl::error::ErrorStack;
use openssl::ssl::{
    ErrorCode, HandshakeError, MidHandshakeSslStream, SslConnector, SslMethod, SslOptions,
    SslStream, SslVerifyMode,
};

use crate::net::{self, Direction, Readiness, StreamFd};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Build the shared connector used for all TLS registrations. Peer
/// verification is off; peers are trusted at a layer above this transport.
/// Compression is disabled.
pub(crate) fn build_connector() -> Result<SslConnector, ErrorStack> {
    let mut builder = SslConnector::builder(SslMethod::tls())?;
    builder.set_verify(SslVerifyMode::NONE);
    builder.set_options(SslOptions::NO_COMPRESSION);
    Ok(builder.build())
}

#[derive(Clone)]
pub struct TlsStream {
    inner: Arc<Mutex<SslStream<StreamFd>>>,
}

impl TlsStream {
    /// Run the client handshake over an already-connected nonblocking fd.
    /// Blocks the calling thread, polling the fd for the direction the
    /// handshake asks for, until done or the handshake deadline passes.
    pub(crate) fn connect(connector: &SslConnector, fd: RawFd) -> io::Result<TlsStream> {
        let mut config = connector.configure().map_err(tls_err)?;
        config.set_use_server_name_indication(false);
        config.set_verify_hostname(false);

        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        let mut mid = match config.connect("", StreamFd(fd)) {
            Ok(stream) => {
                debug!("TLS handshake on fd {} completed without blocking", fd);
                return Ok(TlsStream::wrap(stream));
            }
            Err(HandshakeError::WouldBlock(mid)) => mid,
            Err(e) => return Err(handshake_err(e)),
        };

        loop {
            let dir = match mid.error().code() {
                ErrorCode::WANT_READ => Direction::Read,
                ErrorCode::WANT_WRITE => Direction::Write,
                _ => {
                    return Err(io::Error::new(
                        io::ErrorKind::Other,
                        format!("TLS handshake error on fd {}: {}", fd, mid.error()),
                    ))
                }
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("TLS handshake timed out on fd {}", fd),
                ));
            }
            match net::wait_ready(fd, dir, Some(deadline - now))? {
                Readiness::Ready => {}
                Readiness::TimedOut => {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("TLS handshake timed out on fd {}", fd),
                    ))
                }
                Readiness::Hup | Readiness::Invalid => {
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        format!("socket lost during TLS handshake on fd {}", fd),
                    ))
                }
            }

            match mid.handshake() {
                Ok(stream) => {
                    debug!("TLS handshake on fd {} complete", fd);
                    return Ok(TlsStream::wrap(stream));
                }
                Err(HandshakeError::WouldBlock(m)) => mid = m,
                Err(e) => return Err(handshake_err(e)),
            }
        }
    }

    fn wrap(stream: SslStream<StreamFd>) -> TlsStream {
        TlsStream {
            inner: Arc::new(Mutex::new(stream)),
        }
    }

    pub(crate) fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.lock().unwrap().read(buf)
    }

    pub(crate) fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().unwrap().write(buf)
    }

    /// Best-effort close_notify. The session is being torn down either way;
    /// a blocked or failed shutdown is logged and ignored.
    pub(crate) fn shutdown(&self) {
        if let Err(e) = self.inner.lock().unwrap().shutdown() {
            debug!("TLS shutdown: {}", e);
        }
    }
}

fn tls_err(e: ErrorStack) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

fn handshake_err(e: HandshakeError<StreamFd>) -> io::Error {
    match e {
        HandshakeError::SetupFailure(stack) => tls_err(stack),
        HandshakeError::Failure(mid) => failure_detail(&mid),
        HandshakeError::WouldBlock(mid) => failure_detail(&mid),
    }
}

fn failure_detail(mid: &MidHandshakeSslStream<StreamFd>) -> io::Error {
    warn!("TLS handshake failed: {}", mid.error());
    io::Error::new(
        io::ErrorKind::Other,
        format!("TLS handshake failed: {}", mid.error()),
    )
}
