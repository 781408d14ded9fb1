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

//! Raw-fd plumbing.
//!
//! The bus never owns sockets. Callers register a raw fd and keep
//! responsibility for closing it after release; everything here is a
//! non-owning view. Registered sockets must be in nonblocking mode.

use std::io::{self, Read, Write};
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::tls::TlsStream;

/// Non-owning stream view over a raw socket fd. Nothing here closes the fd.
#[derive(Debug, Clone, Copy)]
pub struct StreamFd(pub RawFd);

impl Read for StreamFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(self.0, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

impl Write for StreamFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe { libc::write(self.0, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// How a socket carries bytes. Cloned freely; the TLS arm shares one
/// session between the send path and the listener.
#[derive(Clone)]
pub(crate) enum Transport {
    Plain,
    Tls(TlsStream),
}

impl Transport {
    pub(crate) fn read(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain => StreamFd(fd).read(buf),
            Transport::Tls(t) => t.read(buf),
        }
    }

    pub(crate) fn write(&self, fd: RawFd, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain => StreamFd(fd).write(buf),
            Transport::Tls(t) => t.write(buf),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Outcome of waiting for fd readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    TimedOut,
    /// Peer hung up or the socket errored.
    Hup,
    /// The fd is not a valid open descriptor.
    Invalid,
}

/// Wait for `fd` to become readable or writable, up to `timeout`
/// (`None` blocks indefinitely). EINTR is retried internally.
pub fn wait_ready(fd: RawFd, dir: Direction, timeout: Option<Duration>) -> io::Result<Readiness> {
    let events = match dir {
        Direction::Read => libc::POLLIN,
        Direction::Write => libc::POLLOUT,
    };
    let ms: libc::c_int = match timeout {
        Some(t) => t.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
        None => -1,
    };

    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    loop {
        let res = unsafe { libc::poll(&mut pfd, 1, ms) };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if res == 0 {
            return Ok(Readiness::TimedOut);
        }
        if pfd.revents & libc::POLLNVAL != 0 {
            return Ok(Readiness::Invalid);
        }
        if pfd.revents & (libc::POLLERR | libc::POLLHUP) != 0 {
            return Ok(Readiness::Hup);
        }
        return Ok(Readiness::Ready);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;

    #[test]
    fn stream_fd_reads_what_peer_wrote() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        client.write_all(b"hello").unwrap();
        client.flush().unwrap();

        assert_eq!(
            wait_ready(server.as_raw_fd(), Direction::Read, Some(Duration::from_secs(5))).unwrap(),
            Readiness::Ready
        );
        let mut buf = [0u8; 8];
        let n = StreamFd(server.as_raw_fd()).read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn wait_ready_times_out_on_idle_read() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        let r = wait_ready(
            server.as_raw_fd(),
            Direction::Read,
            Some(Duration::from_millis(20)),
        )
        .unwrap();
        assert_eq!(r, Readiness::TimedOut);
    }

    #[test]
    fn connected_socket_is_writable() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (_server, _) = listener.accept().unwrap();

        let r = wait_ready(
            client.as_raw_fd(),
            Direction::Write,
            Some(Duration::from_secs(5)),
        )
        .unwrap();
        assert_eq!(r, Readiness::Ready);
    }
}
