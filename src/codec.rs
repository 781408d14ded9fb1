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

//! The protocol seam between the bus and the application.
//!
//! The bus moves bytes and correlates responses; everything
//! protocol-specific happens behind the [`Codec`] trait. A codec keeps
//! per-connection parse state in its `Conn` type, which the bus stores with
//! the tracked socket and hands back on release.

/// Outcome of feeding received bytes to the codec.
pub struct SinkResult {
    /// How many bytes the listener should try to read next. Must be at
    /// least 1; a codec that returns 0 would stall its connection.
    pub next_read: usize,

    /// A completed frame, if the fed bytes finished one. At most one frame
    /// per sink call; a codec expecting pipelined input must account for
    /// that in `next_read`.
    pub frame: Option<Vec<u8>>,
}

/// Outcome of unpacking a completed frame.
pub enum Unpacked<M> {
    /// A parsed message, with the sequence id it answers (if any).
    Msg { seq_id: Option<i64>, msg: M },

    /// The frame did not parse.
    Err(UnpackError),
}

/// A failed unpack. `seq_id` lets the codec attribute the failure to a
/// pending request, which the listener then fails as a bad response;
/// `error_id` is an opaque codec-defined discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnpackError {
    pub seq_id: Option<i64>,
    pub error_id: u64,
}

/// Protocol hooks. `sink` and `unpack` are called only from the listener
/// thread owning the connection, with exclusive access to its `Conn` state.
///
/// A zero-length `sink` call is made when a socket is first tracked, to
/// learn the initial read size; it must not produce a frame.
pub trait Codec: Send + Sync + 'static {
    /// Parsed message type delivered to completion callbacks.
    type Msg: Send + 'static;

    /// Per-connection parse state, supplied at registration and returned
    /// at release.
    type Conn: Send + 'static;

    /// Feed `buf` (bytes just read from the socket) into the parser.
    fn sink(&self, conn: &mut Self::Conn, buf: &[u8]) -> SinkResult;

    /// Parse a completed frame into a message.
    fn unpack(&self, conn: &mut Self::Conn, frame: Vec<u8>) -> Unpacked<Self::Msg>;

    /// A message arrived that matches no pending request: an unsolicited
    /// status, or a response whose request already timed out. The default
    /// logs and drops it.
    fn unexpected(&self, _conn: &mut Self::Conn, seq_id: Option<i64>, msg: Self::Msg) {
        let _ = msg;
        log::warn!("dropping unexpected message, seq_id {:?}", seq_id);
    }

    /// A frame failed to parse. Called in addition to failing any request
    /// the error names. The default logs it.
    fn unpack_error(&self, _conn: &mut Self::Conn, err: UnpackError) {
        log::warn!(
            "unpack error {} (seq_id {:?})",
            err.error_id,
            err.seq_id
        );
    }
}
