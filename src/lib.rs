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

//! Pipelined request/response socket bus.
//!
//! A [`Bus`] multiplexes many caller-supplied nonblocking sockets across a
//! small set of listener threads. Requests are written on the caller's own
//! thread, bounded by a deadline; responses are read by the listener that owns
//! the socket's shard, correlated back to the originating request by sequence
//! id, and completed through a per-request callback running on a worker
//! thread. Framing and parsing are supplied by the caller through the
//! [`Codec`] trait; this layer never interprets payload bytes.

pub mod boxed;
pub mod bus;
pub mod channel;
pub mod codec;
pub mod directory;
pub mod event;
pub mod listener;
pub mod net;
pub mod pool;
pub mod send;
pub mod tls;
pub mod worker;

pub use boxed::{MsgResult, Request, SendStatus};
pub use bus::{Bus, Config, InitError, RegisterError, ReleaseError, SendError, SocketKind};
pub use codec::{Codec, SinkResult, UnpackError, Unpacked};
