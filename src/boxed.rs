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

//! The single-owner request record.
//!
//! A [`BoxedMsg`] is created by the bus when a send is admitted and then
//! moves, by value, through the pipeline: caller thread (write loop) ->
//! listener (EXPECT record) -> worker (completion callback). Ownership
//! transfer is the concurrency discipline; whoever holds the value is the
//! only party allowed to touch it, and completing it consumes it.

use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use crate::net::Transport;
use crate::worker::Task;

/// Terminal status delivered to the completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Response received and correlated.
    Success,
    /// The deadline expired before the request was fully written.
    TxTimeout,
    /// Socket error while writing the request.
    TxFailure,
    /// Request written, but no response arrived before the deadline.
    RxTimeout,
    /// Socket hangup or read error while awaiting the response.
    RxFailure,
    /// A response arrived for this request but failed to parse.
    BadResponse,
    /// The socket handle was not usable when the send path polled it.
    UnregisteredSocket,
}

impl SendStatus {
    pub fn is_success(self) -> bool {
        self == SendStatus::Success
    }
}

/// What the completion callback receives, exactly once per accepted request.
pub struct MsgResult<M> {
    pub status: SendStatus,
    pub seq_id: i64,
    /// The parsed response; present only on `Success`.
    pub msg: Option<M>,
}

/// Completion callback. Runs on a worker thread, never on the listener.
pub type CompletionFn<M> = Box<dyn FnOnce(MsgResult<M>) + Send + 'static>;

/// A request as the caller describes it to [`crate::Bus::send_request`].
pub struct Request<M> {
    /// Registered socket to write to.
    pub fd: RawFd,
    /// Caller-assigned sequence id; must exceed every id previously accepted
    /// on this socket.
    pub seq_id: i64,
    /// Fully framed request bytes, written verbatim.
    pub payload: Vec<u8>,
    /// Overall deadline for write plus response; `None` uses the bus default.
    pub timeout: Option<Duration>,
    /// Invoked exactly once with the terminal result.
    pub done: CompletionFn<M>,
}

/// Internal request record. Moves by value; never shared.
pub(crate) struct BoxedMsg<M> {
    pub fd: RawFd,
    pub transport: Transport,
    pub seq_id: i64,
    pub payload: Vec<u8>,
    /// Bytes of `payload` written so far.
    pub sent: usize,
    pub timeout: Duration,
    pub send_start: Option<Instant>,
    pub send_done: Option<Instant>,
    done: CompletionFn<M>,
}

impl<M: Send + 'static> BoxedMsg<M> {
    pub(crate) fn new(req: Request<M>, transport: Transport, timeout: Duration) -> Self {
        BoxedMsg {
            fd: req.fd,
            transport,
            seq_id: req.seq_id,
            payload: req.payload,
            sent: 0,
            timeout: req.timeout.unwrap_or(timeout),
            send_start: None,
            send_done: None,
            done: req.done,
        }
    }

    /// Countdown ticks for the response wait, at one tick per second.
    /// Sub-second timeouts round up so every request survives at least one
    /// sweep.
    pub(crate) fn timeout_ticks(&self) -> u32 {
        let secs = self.timeout.as_secs();
        let ticks = if self.timeout.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        };
        ticks.max(1).min(u64::from(u32::MAX)) as u32
    }

    /// Consume the record into a deliverable completion task. This is the
    /// only way a record ends, so the callback fires exactly once.
    pub(crate) fn complete(self, status: SendStatus, msg: Option<M>) -> Task {
        let result = MsgResult {
            status,
            seq_id: self.seq_id,
            msg,
        };
        let done = self.done;
        Box::new(move || done(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn dummy(seq_id: i64, timeout: Duration) -> BoxedMsg<u32> {
        BoxedMsg {
            fd: 3,
            transport: Transport::Plain,
            seq_id,
            payload: vec![1, 2, 3],
            sent: 0,
            timeout,
            send_start: None,
            send_done: None,
            done: Box::new(|_| {}),
        }
    }

    #[test]
    fn ticks_round_up_and_never_hit_zero() {
        assert_eq!(dummy(1, Duration::from_secs(5)).timeout_ticks(), 5);
        assert_eq!(dummy(1, Duration::from_millis(1500)).timeout_ticks(), 2);
        assert_eq!(dummy(1, Duration::from_millis(10)).timeout_ticks(), 1);
        assert_eq!(dummy(1, Duration::from_secs(0)).timeout_ticks(), 1);
    }

    #[test]
    fn complete_runs_callback_once_with_result() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let msg = BoxedMsg::<u32> {
            fd: 3,
            transport: Transport::Plain,
            seq_id: 42,
            payload: vec![],
            sent: 0,
            timeout: Duration::from_secs(1),
            send_start: None,
            send_done: None,
            done: Box::new(move |res| {
                assert_eq!(res.status, SendStatus::Success);
                assert_eq!(res.seq_id, 42);
                assert_eq!(res.msg, Some(7));
                calls2.fetch_add(1, Ordering::SeqCst);
            }),
        };
        let task = msg.complete(SendStatus::Success, Some(7));
        task();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
