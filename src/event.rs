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

//! Readiness polling.
//!
//! [`Poller`] wraps `mio::Poll` and adds user-space "custom" readiness
//! sources, so in-process channels can participate in the same poll as
//! sockets. A custom source is a [`Registration`]/[`SetReadiness`] pair:
//! any thread may flag readiness, which queues the source and wakes the
//! poll via `mio::Waker`.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;

/// Reserved for the internal waker; never returned as an event.
pub const WAKER_TOKEN: Token = Token(0);

const EVENTS_MAX: usize = 1024;

fn merge(cur: Option<Interest>, add: Interest) -> Option<Interest> {
    match cur {
        Some(c) => Some(c | add),
        None => Some(add),
    }
}

fn intersect(readiness: Interest, interests: Interest) -> Option<Interest> {
    let mut out = None;
    if readiness.is_readable() && interests.is_readable() {
        out = merge(out, Interest::READABLE);
    }
    if readiness.is_writable() && interests.is_writable() {
        out = merge(out, Interest::WRITABLE);
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    token: Token,
    readiness: Interest,
}

impl Event {
    pub fn token(&self) -> Token {
        self.token
    }

    pub fn is_readable(&self) -> bool {
        self.readiness.is_readable()
    }

    pub fn is_writable(&self) -> bool {
        self.readiness.is_writable()
    }
}

struct SourceNode {
    token: Token,
    interests: Interest,
    readiness: Option<Interest>,
    queued: bool,
}

struct SourcesRegistry {
    nodes: Slab<SourceNode>,
    ready: VecDeque<usize>,
}

struct SourcesData {
    registry: Mutex<SourcesRegistry>,
    waker: Waker,
    capacity: usize,
}

impl SourcesData {
    fn set_readiness(&self, key: usize, readiness: Interest) {
        let wake = {
            let mut reg = self.registry.lock().unwrap();
            match reg.nodes.get_mut(key) {
                Some(node) => match intersect(readiness, node.interests) {
                    Some(effective) => {
                        node.readiness = merge(node.readiness, effective);
                        if !node.queued {
                            node.queued = true;
                            reg.ready.push_back(key);
                            true
                        } else {
                            false
                        }
                    }
                    None => false,
                },
                None => false,
            }
        };
        if wake {
            // best effort; a failed wake means the poll wakes on its own
            // timeout instead
            let _ = self.waker.wake();
        }
    }
}

struct RegInner {
    entry: Option<(usize, Arc<SourcesData>)>,
    /// Readiness flagged before the source was registered with a poller.
    pending: Option<Interest>,
}

/// Pollable half of a custom source. Register it with
/// [`Poller::register_custom`]; dropping it deregisters.
pub struct Registration {
    inner: Arc<Mutex<RegInner>>,
}

/// Readiness-flagging half of a custom source. Cloneable; usable from any
/// thread.
#[derive(Clone)]
pub struct SetReadiness {
    inner: Arc<Mutex<RegInner>>,
}

/// Create a connected custom-source pair.
pub fn registration() -> (Registration, SetReadiness) {
    let inner = Arc::new(Mutex::new(RegInner {
        entry: None,
        pending: None,
    }));
    (
        Registration {
            inner: inner.clone(),
        },
        SetReadiness { inner },
    )
}

impl SetReadiness {
    pub fn set_readiness(&self, readiness: Interest) {
        let entry = {
            let mut inner = self.inner.lock().unwrap();
            match &inner.entry {
                Some((key, data)) => Some((*key, data.clone())),
                None => {
                    inner.pending = merge(inner.pending, readiness);
                    None
                }
            }
        };
        if let Some((key, data)) = entry {
            data.set_readiness(key, readiness);
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some((key, data)) = inner.entry.take() {
            let mut reg = data.registry.lock().unwrap();
            if reg.nodes.contains(key) {
                reg.nodes.remove(key);
            }
            reg.ready.retain(|&k| k != key);
        }
    }
}

struct CustomSources {
    data: Arc<SourcesData>,
}

impl CustomSources {
    fn new(poll: &Poll, capacity: usize) -> io::Result<CustomSources> {
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        Ok(CustomSources {
            data: Arc::new(SourcesData {
                registry: Mutex::new(SourcesRegistry {
                    nodes: Slab::with_capacity(capacity),
                    ready: VecDeque::with_capacity(capacity),
                }),
                waker,
                capacity,
            }),
        })
    }

    fn register(
        &self,
        registration: &Registration,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        let mut inner = registration.inner.lock().unwrap();
        if inner.entry.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "registration already registered",
            ));
        }

        let key = {
            let mut reg = self.data.registry.lock().unwrap();
            if reg.nodes.len() >= self.data.capacity {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "custom source capacity reached",
                ));
            }
            reg.nodes.insert(SourceNode {
                token,
                interests,
                readiness: None,
                queued: false,
            })
        };
        inner.entry = Some((key, self.data.clone()));

        if let Some(pending) = inner.pending.take() {
            self.data.set_readiness(key, pending);
        }
        Ok(())
    }

    fn deregister(&self, registration: &Registration) -> io::Result<()> {
        let mut inner = registration.inner.lock().unwrap();
        match inner.entry.take() {
            Some((key, data)) => {
                let mut reg = data.registry.lock().unwrap();
                reg.nodes.remove(key);
                reg.ready.retain(|&k| k != key);
                Ok(())
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "registration not registered",
            )),
        }
    }

    fn has_events(&self) -> bool {
        !self.data.registry.lock().unwrap().ready.is_empty()
    }

    fn next_event(&self) -> Option<Event> {
        let mut reg = self.data.registry.lock().unwrap();
        while let Some(key) = reg.ready.pop_front() {
            if let Some(node) = reg.nodes.get_mut(key) {
                node.queued = false;
                if let Some(readiness) = node.readiness.take() {
                    return Some(Event {
                        token: node.token,
                        readiness,
                    });
                }
            }
        }
        None
    }
}

/// A poll over OS sources and custom sources together.
pub struct Poller {
    poll: Poll,
    events: Events,
    custom: CustomSources,
}

impl Poller {
    pub fn new(custom_capacity: usize) -> io::Result<Poller> {
        let poll = Poll::new()?;
        let custom = CustomSources::new(&poll, custom_capacity)?;
        Ok(Poller {
            poll,
            events: Events::with_capacity(EVENTS_MAX),
            custom,
        })
    }

    pub fn register<S: Source + ?Sized>(
        &mut self,
        source: &mut S,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        assert_ne!(token, WAKER_TOKEN);
        self.poll.registry().register(source, token, interests)
    }

    pub fn deregister<S: Source + ?Sized>(&mut self, source: &mut S) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    pub fn register_custom(
        &self,
        registration: &Registration,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        assert_ne!(token, WAKER_TOKEN);
        self.custom.register(registration, token, interests)
    }

    pub fn deregister_custom(&self, registration: &Registration) -> io::Result<()> {
        self.custom.deregister(registration)
    }

    /// Wait for readiness, or return immediately if custom events are
    /// already pending.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        let timeout = if self.custom.has_events() {
            Some(Duration::from_millis(0))
        } else {
            timeout
        };
        self.poll.poll(&mut self.events, timeout)
    }

    /// Collect the events from the last `poll` call into `out`. OS events
    /// come first, then queued custom events, capped so a source flagging
    /// itself repeatedly cannot starve the loop.
    pub fn collect_events(&self, out: &mut Vec<Event>) {
        out.clear();
        for event in self.events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            let mut readiness = None;
            if event.is_readable() || event.is_read_closed() {
                readiness = merge(readiness, Interest::READABLE);
            }
            if event.is_writable() || event.is_write_closed() {
                readiness = merge(readiness, Interest::WRITABLE);
            }
            // error-only events still need the socket serviced
            let readiness = readiness.unwrap_or(Interest::READABLE);
            out.push(Event {
                token: event.token(),
                readiness,
            });
        }
        while out.len() < EVENTS_MAX {
            match self.custom.next_event() {
                Some(event) => out.push(event),
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_source_wakes_poll() {
        let mut poller = Poller::new(4).unwrap();
        let (reg, sr) = registration();
        poller
            .register_custom(&reg, Token(1), Interest::READABLE)
            .unwrap();

        sr.set_readiness(Interest::READABLE);
        poller.poll(Some(Duration::from_secs(5))).unwrap();

        let mut events = Vec::new();
        poller.collect_events(&mut events);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].token(), Token(1));
        assert!(events[0].is_readable());

        // readiness was consumed; nothing further pending
        poller.poll(Some(Duration::from_millis(10))).unwrap();
        poller.collect_events(&mut events);
        assert!(events.is_empty());
    }

    #[test]
    fn readiness_before_registration_is_kept() {
        let mut poller = Poller::new(4).unwrap();
        let (reg, sr) = registration();

        sr.set_readiness(Interest::READABLE);
        poller
            .register_custom(&reg, Token(2), Interest::READABLE)
            .unwrap();

        poller.poll(Some(Duration::from_secs(5))).unwrap();
        let mut events = Vec::new();
        poller.collect_events(&mut events);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].token(), Token(2));
    }

    #[test]
    fn readiness_outside_interest_is_filtered() {
        let mut poller = Poller::new(4).unwrap();
        let (reg, sr) = registration();
        poller
            .register_custom(&reg, Token(3), Interest::READABLE)
            .unwrap();

        sr.set_readiness(Interest::WRITABLE);
        poller.poll(Some(Duration::from_millis(10))).unwrap();
        let mut events = Vec::new();
        poller.collect_events(&mut events);
        assert!(events.is_empty());
    }

    #[test]
    fn deregistered_source_stops_delivering() {
        let mut poller = Poller::new(4).unwrap();
        let (reg, sr) = registration();
        poller
            .register_custom(&reg, Token(4), Interest::READABLE)
            .unwrap();
        sr.set_readiness(Interest::READABLE);
        poller.deregister_custom(&reg).unwrap();

        poller.poll(Some(Duration::from_millis(10))).unwrap();
        let mut events = Vec::new();
        poller.collect_events(&mut events);
        assert!(events.is_empty());
    }

    #[test]
    fn capacity_is_enforced() {
        let poller = Poller::new(1).unwrap();
        let (reg_a, _sr_a) = registration();
        let (reg_b, _sr_b) = registration();
        poller
            .register_custom(&reg_a, Token(5), Interest::READABLE)
            .unwrap();
        assert!(poller
            .register_custom(&reg_b, Token(6), Interest::READABLE)
            .is_err());
    }
}
