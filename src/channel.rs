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

//! Bounded channel whose receive side is pollable.
//!
//! A thin layer over `std::sync::mpsc::sync_channel` that flags readiness
//! on a custom [`event::Registration`] whenever a value is queued, so a
//! listener can wait on channel traffic and socket traffic in one poll.

use std::sync::mpsc;

use mio::Interest;

use crate::event;

pub use std::sync::mpsc::{TryRecvError, TrySendError};

pub struct Sender<T> {
    tx: mpsc::SyncSender<T>,
    read_set_readiness: event::SetReadiness,
}

// manual impl; derive would require T: Clone
impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Sender {
            tx: self.tx.clone(),
            read_set_readiness: self.read_set_readiness.clone(),
        }
    }
}

impl<T> Sender<T> {
    pub fn try_send(&self, t: T) -> Result<(), TrySendError<T>> {
        self.tx.try_send(t)?;
        self.read_set_readiness.set_readiness(Interest::READABLE);
        Ok(())
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        // wake the receiver so it can observe the disconnect
        self.read_set_readiness.set_readiness(Interest::READABLE);
    }
}

pub struct Receiver<T> {
    rx: mpsc::Receiver<T>,
    read_registration: event::Registration,
}

impl<T> Receiver<T> {
    pub fn registration(&self) -> &event::Registration {
        &self.read_registration
    }

    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        self.rx.try_recv()
    }
}

pub fn channel<T>(bound: usize) -> (Sender<T>, Receiver<T>) {
    let (tx, rx) = mpsc::sync_channel(bound);
    let (read_registration, read_set_readiness) = event::registration();
    (
        Sender {
            tx,
            read_set_readiness,
        },
        Receiver {
            rx,
            read_registration,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Poller;
    use mio::Token;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn send_and_recv() {
        let (sender, receiver) = channel::<u32>(2);
        sender.try_send(1).unwrap();
        sender.try_send(2).unwrap();
        assert!(matches!(sender.try_send(3), Err(TrySendError::Full(3))));

        assert_eq!(receiver.try_recv().unwrap(), 1);
        assert_eq!(receiver.try_recv().unwrap(), 2);
        assert!(matches!(receiver.try_recv(), Err(TryRecvError::Empty)));

        drop(sender);
        assert!(matches!(
            receiver.try_recv(),
            Err(TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn send_wakes_polled_receiver() {
        let (sender, receiver) = channel::<u32>(4);
        let mut poller = Poller::new(4).unwrap();
        poller
            .register_custom(receiver.registration(), Token(1), Interest::READABLE)
            .unwrap();

        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            sender.try_send(7).unwrap();
        });

        poller.poll(Some(Duration::from_secs(5))).unwrap();
        let mut events = Vec::new();
        poller.collect_events(&mut events);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].token(), Token(1));
        assert_eq!(receiver.try_recv().unwrap(), 7);
        t.join().unwrap();
    }

    #[test]
    fn cloned_senders_share_the_bound() {
        let (sender, receiver) = channel::<u32>(1);
        let sender2 = sender.clone();
        sender.try_send(1).unwrap();
        assert!(matches!(sender2.try_send(2), Err(TrySendError::Full(2))));
        assert_eq!(receiver.try_recv().unwrap(), 1);
        sender2.try_send(2).unwrap();
        assert_eq!(receiver.try_recv().unwrap(), 2);
    }
}
