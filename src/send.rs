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

//! The blocking send path, run on the caller's thread.
//!
//! Order matters: the HOLD is registered with the shard's listener before
//! the first byte is written, so a response racing the tail of the write
//! has somewhere to land. Then the payload is written under the request
//! deadline, polling the single fd for writability. On full write the
//! request record transfers to the listener as an EXPECT; any failure after
//! the HOLD is accepted completes the record locally through the workers.

use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, warn};

use crate::boxed::{BoxedMsg, SendStatus};
use crate::codec::Codec;
use crate::listener::{Listener, HOLD_GRACE_TICKS};
use crate::net::{self, Direction, Readiness};
use crate::worker::WorkerPool;

/// Attempts to queue a listener command before giving up.
pub(crate) const NOTIFY_RETRIES: usize = 10;
pub(crate) const NOTIFY_RETRY_DELAY: Duration = Duration::from_millis(5);

/// Backpressure shift for the EXPECT handoff; larger loads slow senders
/// down first.
pub(crate) const EXPECT_BACKPRESSURE_SHIFT: u16 = 4;

/// Sleep `backpressure >> shift` milliseconds, the caller-side throttle.
pub(crate) fn backpressure_delay(backpressure: u16, shift: u16) {
    let ms = u64::from(backpressure >> shift);
    if ms > 0 {
        thread::sleep(Duration::from_millis(ms));
    }
}

/// Write the request and hand the record to the listener.
///
/// `false` means the send was rejected before any side effect and the
/// completion callback will never fire; the caller surfaces the rejection.
/// `true` means the record was accepted: the callback fires exactly once,
/// whether from a correlated response, a timeout, or a failure completed
/// here.
pub(crate) fn blocking_send<C: Codec>(
    listener: &Listener<C>,
    workers: &WorkerPool,
    mut msg: BoxedMsg<C::Msg>,
) -> bool {
    let start = Instant::now();
    msg.send_start = Some(start);
    let deadline = start + msg.timeout;

    if !register_hold(listener, &msg) {
        return false;
    }

    // From here on the callback must fire, so every exit path either
    // transfers the record or completes it locally.
    loop {
        let now = Instant::now();
        if now >= deadline {
            debug!("fd {} seq {}: write deadline expired", msg.fd, msg.seq_id);
            return fail_locally(workers, msg, SendStatus::TxTimeout);
        }
        match net::wait_ready(msg.fd, Direction::Write, Some(deadline - now)) {
            Ok(Readiness::Ready) => {}
            Ok(Readiness::TimedOut) => {
                return fail_locally(workers, msg, SendStatus::TxTimeout);
            }
            Ok(Readiness::Hup) => {
                warn!("fd {} hung up mid-send", msg.fd);
                return fail_locally(workers, msg, SendStatus::TxFailure);
            }
            Ok(Readiness::Invalid) => {
                warn!("fd {} is not an open socket", msg.fd);
                return fail_locally(workers, msg, SendStatus::UnregisteredSocket);
            }
            Err(e) => {
                error!("poll on fd {}: {}", msg.fd, e);
                return fail_locally(workers, msg, SendStatus::TxFailure);
            }
        }

        let sent = msg.sent;
        match msg.transport.write(msg.fd, &msg.payload[sent..]) {
            Ok(0) => {
                // writable per poll yet nothing accepted; back to the poll
                // rather than busy-looping
                debug!("fd {}: zero-length write", msg.fd);
            }
            Ok(n) => {
                msg.sent += n;
                if msg.sent == msg.payload.len() {
                    break;
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                warn!("write error on fd {}: {}", msg.fd, e);
                return fail_locally(workers, msg, SendStatus::TxFailure);
            }
        }
    }

    msg.send_done = Some(Instant::now());
    debug!(
        "fd {} seq {}: request written, transferring expect",
        msg.fd, msg.seq_id
    );
    transfer_expect(listener, workers, msg)
}

/// Place the HOLD, retrying while the inbox is full. The call returns only
/// once the listener acknowledges the record, so it exists before the first
/// request byte goes out. The HOLD outlives the request timeout by a grace
/// period so the EXPECT upgrade cannot miss it.
fn register_hold<C: Codec>(listener: &Listener<C>, msg: &BoxedMsg<C::Msg>) -> bool {
    let ticks = msg.timeout_ticks().saturating_add(HOLD_GRACE_TICKS);
    for _ in 0..NOTIFY_RETRIES {
        match listener.hold(msg.fd, msg.seq_id, ticks) {
            Ok(_backpressure) => return true,
            Err(_) => thread::sleep(NOTIFY_RETRY_DELAY),
        }
    }
    debug!(
        "fd {} seq {}: listener inbox full, rejecting send",
        msg.fd, msg.seq_id
    );
    false
}

fn transfer_expect<C: Codec>(
    listener: &Listener<C>,
    workers: &WorkerPool,
    msg: BoxedMsg<C::Msg>,
) -> bool {
    let mut msg = msg;
    for _ in 0..NOTIFY_RETRIES {
        match listener.expect(msg) {
            Ok(backpressure) => {
                backpressure_delay(backpressure, EXPECT_BACKPRESSURE_SHIFT);
                return true;
            }
            Err(back) => {
                msg = back;
                thread::sleep(NOTIFY_RETRY_DELAY);
            }
        }
    }
    // the request went out but the listener never took the record; the
    // stale HOLD will expire on its own
    warn!(
        "fd {} seq {}: could not transfer expect, completing as timeout",
        msg.fd, msg.seq_id
    );
    fail_locally(workers, msg, SendStatus::TxTimeout)
}

/// Complete an accepted request on this side of the pipeline. Always
/// returns true: the record was accepted, so the callback must run.
fn fail_locally<M: Send + 'static>(
    workers: &WorkerPool,
    msg: BoxedMsg<M>,
    status: SendStatus,
) -> bool {
    let fd = msg.fd;
    let seq_id = msg.seq_id;
    let task = msg.complete(status, None);
    if let Err(task) = workers.submit_blocking(task) {
        // the pool has already stopped; run the callback on this thread
        // rather than lose it
        warn!(
            "fd {} seq {}: delivering {:?} completion inline",
            fd, seq_id, status
        );
        task();
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backpressure_delay_shifts_to_zero() {
        // below the shift threshold there is no sleep; just verify the
        // arithmetic stays in the no-delay range
        assert_eq!(15u16 >> EXPECT_BACKPRESSURE_SHIFT, 0);
        assert!(16u16 >> EXPECT_BACKPRESSURE_SHIFT > 0);
        let t = Instant::now();
        backpressure_delay(15, EXPECT_BACKPRESSURE_SHIFT);
        assert!(t.elapsed() < Duration::from_millis(50));
    }
}
