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

//! The per-shard listener: one thread owning the read side of every socket
//! in its shard.
//!
//! The thread multiplexes a command inbox and the shard's sockets in a
//! single poll. Commands arrive as indices into a lock-free slot pool, so
//! the cross-thread handoff never allocates or locks. Response correlation
//! runs through a two-phase record per request: a HOLD is placed before the
//! request's first byte is written (so an early response always has
//! somewhere to land), then upgraded to an EXPECT carrying the request
//! record once the write completes. A once-a-second sweep expires
//! countdowns, fails records on dead sockets, and retries completions the
//! worker queues bounced.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, warn};
use mio::unix::SourceFd;
use mio::{Interest, Token};
use slab::Slab;

use crate::boxed::{BoxedMsg, SendStatus};
use crate::channel::{self, TryRecvError};
use crate::codec::{Codec, Unpacked};
use crate::event::Poller;
use crate::net::Transport;
use crate::pool::Pool;
use crate::worker::{Task, WorkerPool};

/// Capacity of the command slot pool and inbox.
pub(crate) const CMD_POOL_SIZE: usize = 32;

/// Capacity of the correlation table (pending requests per shard).
pub(crate) const RX_TABLE_SIZE: usize = 1024;

/// Tracked sockets per shard.
pub(crate) const MAX_SOCKS: usize = 1024;

/// Extra ticks a HOLD outlives its request timeout, so the HOLD is still
/// there when a slow write path gets around to the EXPECT upgrade.
pub(crate) const HOLD_GRACE_TICKS: u32 = 5;

const TICK_INTERVAL: Duration = Duration::from_secs(1);
const ACTIVE_POLL_MS: u64 = 100;

const INBOX_TOKEN: Token = Token(1);
const SOCK_TOKEN_BASE: usize = 16;

/// Occupancy tier for one resource: free below a quarter, then linear,
/// then steeper, then superlinear above three quarters. Monotone
/// non-decreasing in `used`.
pub(crate) fn tiered(used: usize, capacity: usize) -> u16 {
    let quarters = used * 4;
    let v = if quarters < capacity {
        0
    } else if quarters < capacity * 2 {
        used / 2
    } else if quarters < capacity * 3 {
        used * 2
    } else {
        (used * used) / (capacity / 8).max(1)
    };
    v.min(u16::MAX as usize) as u16
}

/// Combined backpressure from command-slot, correlation-table, and
/// worker-queue occupancy. Callers turn this into a millisecond delay.
pub(crate) fn backpressure(
    cmds: usize,
    rx: usize,
    downstream: usize,
    downstream_capacity: usize,
) -> u16 {
    tiered(cmds, CMD_POOL_SIZE)
        .saturating_add(tiered(rx, RX_TABLE_SIZE))
        .saturating_add(tiered(downstream, downstream_capacity))
}

/// Counters the listener thread exports for caller-side backpressure.
#[derive(Default)]
pub(crate) struct Load {
    pub rx_in_use: AtomicUsize,
}

pub(crate) struct Ack {
    pub backpressure: u16,
}

pub(crate) struct AddReply<T> {
    pub backpressure: u16,
    /// `Some` means the socket was not tracked; the connection state comes
    /// back to the caller.
    pub rejected: Option<T>,
}

pub(crate) struct RemoveReply<T> {
    pub backpressure: u16,
    /// The connection state, if the fd was tracked.
    pub conn: Option<T>,
}

/// The command inbox was full; retry after a delay.
#[derive(Debug)]
pub(crate) struct CommandBusy;

#[derive(Debug)]
pub(crate) enum AddSocketError<T> {
    Busy(T),
    Rejected(T),
    Gone,
}

#[derive(Debug)]
pub(crate) enum RemoveSocketError {
    Busy,
    Gone,
}

pub(crate) enum Command<C: Codec> {
    AddSocket {
        fd: RawFd,
        transport: Transport,
        conn: C::Conn,
        reply: SyncSender<AddReply<C::Conn>>,
    },
    RemoveSocket {
        fd: RawFd,
        reply: SyncSender<RemoveReply<C::Conn>>,
    },
    Hold {
        fd: RawFd,
        seq_id: i64,
        ticks: u32,
        reply: SyncSender<Ack>,
    },
    Expect {
        msg: BoxedMsg<C::Msg>,
    },
    Shutdown {
        reply: SyncSender<Ack>,
    },
}

/// Handle to a shard's listener thread. Command methods may be called from
/// any thread.
pub(crate) struct Listener<C: Codec> {
    pool: Arc<Pool<Command<C>>>,
    tx: channel::Sender<u32>,
    load: Arc<Load>,
    workers: Arc<WorkerPool>,
    downstream_capacity: usize,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl<C: Codec> Listener<C> {
    pub fn spawn(
        index: usize,
        codec: Arc<C>,
        workers: Arc<WorkerPool>,
        downstream_capacity: usize,
    ) -> io::Result<Listener<C>> {
        let pool = Arc::new(Pool::new(CMD_POOL_SIZE));
        let (tx, inbox) = channel::channel::<u32>(CMD_POOL_SIZE);
        let load = Arc::new(Load::default());

        let poller = Poller::new(4)?;
        poller.register_custom(inbox.registration(), INBOX_TOKEN, Interest::READABLE)?;

        let thread = {
            let pool = pool.clone();
            let load = load.clone();
            let workers = workers.clone();
            thread::Builder::new()
                .name(format!("wirebus-listener-{}", index))
                .spawn(move || {
                    ListenerThread {
                        index,
                        codec,
                        poller,
                        inbox,
                        pool,
                        workers,
                        load,
                        downstream_capacity,
                        socks: Slab::with_capacity(MAX_SOCKS),
                        rx: Slab::with_capacity(RX_TABLE_SIZE),
                        read_buf: vec![0; 1024],
                        idle: false,
                        last_tick: Instant::now(),
                        stop: None,
                    }
                    .run()
                })?
        };

        Ok(Listener {
            pool,
            tx,
            load,
            workers,
            downstream_capacity,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Current backpressure as seen from the caller side.
    pub fn backpressure(&self) -> u16 {
        backpressure(
            self.pool.in_use(),
            self.load.rx_in_use.load(Ordering::Relaxed),
            self.workers.depth(),
            self.downstream_capacity,
        )
    }

    /// Reserve a slot, fill it, and queue its index. On failure the command
    /// comes back so the caller keeps ownership of whatever it carries.
    fn push(&self, cmd: Command<C>) -> Result<(), Command<C>> {
        let mut slot = match self.pool.reserve() {
            Some(s) => s,
            None => return Err(cmd),
        };
        slot.set(cmd);
        let index = slot.index();
        match self.tx.try_send(index) {
            Ok(()) => {
                slot.commit();
                Ok(())
            }
            Err(_) => {
                let cmd = slot.take().unwrap();
                Err(cmd)
            }
        }
    }

    /// Track a socket. Blocks for the listener's acknowledgement.
    pub fn add_socket(
        &self,
        fd: RawFd,
        transport: Transport,
        conn: C::Conn,
    ) -> Result<u16, AddSocketError<C::Conn>> {
        let (reply, reply_rx) = mpsc::sync_channel(1);
        match self.push(Command::AddSocket {
            fd,
            transport,
            conn,
            reply,
        }) {
            Ok(()) => {}
            Err(Command::AddSocket { conn, .. }) => return Err(AddSocketError::Busy(conn)),
            Err(_) => unreachable!(),
        }
        match reply_rx.recv() {
            Ok(AddReply {
                backpressure,
                rejected: None,
            }) => Ok(backpressure),
            Ok(AddReply {
                rejected: Some(conn),
                ..
            }) => Err(AddSocketError::Rejected(conn)),
            Err(_) => Err(AddSocketError::Gone),
        }
    }

    /// Stop tracking a socket, returning its connection state. Blocks for
    /// the listener's acknowledgement.
    pub fn remove_socket(&self, fd: RawFd) -> Result<RemoveReply<C::Conn>, RemoveSocketError> {
        let (reply, reply_rx) = mpsc::sync_channel(1);
        if self.push(Command::RemoveSocket { fd, reply }).is_err() {
            return Err(RemoveSocketError::Busy);
        }
        reply_rx.recv().map_err(|_| RemoveSocketError::Gone)
    }

    /// Place a HOLD so a response arriving mid-write has somewhere to land.
    /// Blocks until the listener has placed the record; once this returns,
    /// a response read on any later wakeup will find it.
    pub fn hold(&self, fd: RawFd, seq_id: i64, ticks: u32) -> Result<u16, CommandBusy> {
        let (reply, reply_rx) = mpsc::sync_channel(1);
        if self
            .push(Command::Hold {
                fd,
                seq_id,
                ticks,
                reply,
            })
            .is_err()
        {
            return Err(CommandBusy);
        }
        match reply_rx.recv() {
            Ok(ack) => Ok(ack.backpressure),
            Err(_) => Err(CommandBusy),
        }
    }

    /// Upgrade the HOLD for this request to an EXPECT, transferring record
    /// ownership to the listener. On failure the record comes back.
    pub fn expect(&self, msg: BoxedMsg<C::Msg>) -> Result<u16, BoxedMsg<C::Msg>> {
        match self.push(Command::Expect { msg }) {
            Ok(()) => Ok(self.backpressure()),
            Err(Command::Expect { msg }) => Err(msg),
            Err(_) => unreachable!(),
        }
    }

    /// Ask the thread to stop, wait for its acknowledgement, and join it.
    /// Returns false if it was already joined.
    pub fn shutdown_and_join(&self) -> bool {
        let mut thread = self.thread.lock().unwrap();
        let handle = match thread.take() {
            Some(h) => h,
            None => return false,
        };

        let (reply, reply_rx) = mpsc::sync_channel(1);
        let mut cmd = Some(Command::Shutdown { reply });
        for _ in 0..1000 {
            match self.push(cmd.take().unwrap()) {
                Ok(()) => break,
                Err(c) => {
                    cmd = Some(c);
                    thread::sleep(Duration::from_millis(5));
                }
            }
        }
        let queued = cmd.is_none();
        // dropping an unqueued command drops its reply sender, so the recv
        // below cannot hang
        drop(cmd);

        if !queued {
            warn!("listener shutdown command could not be queued");
        } else {
            match reply_rx.recv() {
                Ok(ack) => debug!("listener drained, backpressure {}", ack.backpressure),
                Err(_) => warn!("listener exited without shutdown ack"),
            }
        }
        if handle.join().is_err() {
            error!("listener thread panicked");
        }
        true
    }
}

impl<C: Codec> Drop for Listener<C> {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxFailKind {
    Hup,
    ReadError,
    BadResponse,
}

impl RxFailKind {
    fn status(self) -> SendStatus {
        match self {
            RxFailKind::Hup | RxFailKind::ReadError => SendStatus::RxFailure,
            RxFailKind::BadResponse => SendStatus::BadResponse,
        }
    }
}

struct TrackedSock<C: Codec> {
    fd: RawFd,
    transport: Transport,
    conn: C::Conn,
    /// Read size the codec last asked for.
    to_read: usize,
    failed: Option<RxFailKind>,
    registered: bool,
}

enum ExpectState<M> {
    /// Request record parked, awaiting the response.
    Waiting(BoxedMsg<M>),
    /// Completion built but the worker queues were full; retried on tick.
    Deliver(Task),
}

enum RxEntry<M> {
    Hold {
        fd: RawFd,
        seq_id: i64,
        ticks: u32,
        result: Option<(i64, M)>,
        failed: Option<RxFailKind>,
    },
    Expect {
        fd: RawFd,
        seq_id: i64,
        ticks: u32,
        failed: Option<RxFailKind>,
        /// `None` only transiently while the entry is being completed.
        state: Option<ExpectState<M>>,
    },
}

struct ListenerThread<C: Codec> {
    index: usize,
    codec: Arc<C>,
    poller: Poller,
    inbox: channel::Receiver<u32>,
    pool: Arc<Pool<Command<C>>>,
    workers: Arc<WorkerPool>,
    load: Arc<Load>,
    downstream_capacity: usize,
    socks: Slab<TrackedSock<C>>,
    rx: Slab<RxEntry<C::Msg>>,
    read_buf: Vec<u8>,
    /// No countdowns outstanding; poll may block indefinitely.
    idle: bool,
    last_tick: Instant,
    stop: Option<SyncSender<Ack>>,
}

enum MsgAction<M> {
    Stored,
    CompleteSuccess(usize, M),
    Unexpected(M),
}

impl<C: Codec> ListenerThread<C> {
    fn run(mut self) {
        debug!("listener {} started", self.index);
        let mut events = Vec::new();
        let reply = loop {
            if self.last_tick.elapsed() >= TICK_INTERVAL {
                self.tick();
                self.last_tick = Instant::now();
            }

            let timeout = if self.idle {
                None
            } else {
                Some(Duration::from_millis(ACTIVE_POLL_MS))
            };
            if let Err(e) = self.poller.poll(timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("listener {} poll: {}", self.index, e);
                thread::sleep(Duration::from_millis(ACTIVE_POLL_MS));
                continue;
            }

            self.poller.collect_events(&mut events);
            // commands before socket reads so a busy socket cannot starve
            // the inbox
            self.drain_inbox();
            for event in &events {
                match event.token() {
                    INBOX_TOKEN => {}
                    Token(t) if t >= SOCK_TOKEN_BASE => self.sock_readable(t - SOCK_TOKEN_BASE),
                    token => warn!("listener {}: stray event token {:?}", self.index, token),
                }
            }

            if let Some(reply) = self.stop.take() {
                break reply;
            }
        };

        self.flush_pending();
        let backpressure = self.backpressure_now();
        let _ = reply.send(Ack { backpressure });
        debug!("listener {} stopped", self.index);
    }

    fn backpressure_now(&self) -> u16 {
        backpressure(
            self.pool.in_use(),
            self.rx.len(),
            self.workers.depth(),
            self.downstream_capacity,
        )
    }

    fn sync_rx_load(&self) {
        self.load.rx_in_use.store(self.rx.len(), Ordering::Relaxed);
    }

    fn find_sock(&self, fd: RawFd) -> Option<usize> {
        self.socks
            .iter()
            .find_map(|(k, s)| if s.fd == fd { Some(k) } else { None })
    }

    fn find_rx(&self, fd: RawFd, seq_id: i64) -> Option<usize> {
        self.rx.iter().find_map(|(k, entry)| match entry {
            RxEntry::Hold {
                fd: f, seq_id: s, ..
            } if *f == fd && *s == seq_id => Some(k),
            RxEntry::Expect {
                fd: f,
                seq_id: s,
                state: Some(ExpectState::Waiting(_)),
                ..
            } if *f == fd && *s == seq_id => Some(k),
            _ => None,
        })
    }

    fn drain_inbox(&mut self) {
        loop {
            match self.inbox.try_recv() {
                Ok(index) => {
                    let cmd = self.pool.take(index);
                    self.pool.release(index);
                    self.idle = false;
                    self.handle_command(cmd);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return,
            }
        }
    }

    fn handle_command(&mut self, cmd: Command<C>) {
        match cmd {
            Command::AddSocket {
                fd,
                transport,
                conn,
                reply,
            } => {
                let r = self.add_socket(fd, transport, conn);
                let _ = reply.send(r);
            }
            Command::RemoveSocket { fd, reply } => {
                let r = self.remove_socket(fd);
                let _ = reply.send(r);
            }
            Command::Hold {
                fd,
                seq_id,
                ticks,
                reply,
            } => {
                self.hold(fd, seq_id, ticks);
                let _ = reply.send(Ack {
                    backpressure: self.backpressure_now(),
                });
            }
            Command::Expect { msg } => self.expect(msg),
            Command::Shutdown { reply } => {
                debug!("listener {} shutdown requested", self.index);
                self.stop = Some(reply);
            }
        }
    }

    fn add_socket(&mut self, fd: RawFd, transport: Transport, conn: C::Conn) -> AddReply<C::Conn> {
        if self.find_sock(fd).is_some() {
            // already tracked; acknowledge without a second registration
            debug!("listener {}: fd {} already tracked", self.index, fd);
            return AddReply {
                backpressure: self.backpressure_now(),
                rejected: None,
            };
        }
        if self.socks.len() >= MAX_SOCKS {
            warn!("listener {}: socket capacity reached", self.index);
            return AddReply {
                backpressure: self.backpressure_now(),
                rejected: Some(conn),
            };
        }

        let key = self.socks.insert(TrackedSock {
            fd,
            transport,
            conn,
            to_read: 1,
            failed: None,
            registered: false,
        });
        let token = Token(SOCK_TOKEN_BASE + key);
        if let Err(e) = self
            .poller
            .register(&mut SourceFd(&fd), token, Interest::READABLE)
        {
            error!("listener {}: register fd {}: {}", self.index, fd, e);
            let sock = self.socks.remove(key);
            return AddReply {
                backpressure: self.backpressure_now(),
                rejected: Some(sock.conn),
            };
        }

        // prime the codec to learn the first read size
        let sock = &mut self.socks[key];
        sock.registered = true;
        let first = self.codec.sink(&mut sock.conn, &[]);
        debug_assert!(first.frame.is_none(), "priming sink produced a frame");
        sock.to_read = first.next_read.max(1);

        debug!("listener {} tracking fd {}", self.index, fd);
        AddReply {
            backpressure: self.backpressure_now(),
            rejected: None,
        }
    }

    fn remove_socket(&mut self, fd: RawFd) -> RemoveReply<C::Conn> {
        let conn = match self.find_sock(fd) {
            Some(key) => {
                self.drop_rx_for(fd);
                let sock = self.socks.remove(key);
                if sock.registered {
                    let _ = self.poller.deregister(&mut SourceFd(&sock.fd));
                }
                debug!("listener {} released fd {}", self.index, fd);
                Some(sock.conn)
            }
            None => None,
        };
        RemoveReply {
            backpressure: self.backpressure_now(),
            conn,
        }
    }

    /// Retire the records pending on a socket being released. Holds go
    /// through the usual release path (surfacing any unclaimed result), so
    /// a later EXPECT upgrade finds nothing and completes as a timeout;
    /// waiting records time out now. A record for the fd must never outlive
    /// the socket, or a later registration reusing the fd would collide
    /// with it.
    fn drop_rx_for(&mut self, fd: RawFd) {
        let keys: Vec<usize> = self
            .rx
            .iter()
            .filter_map(|(k, entry)| match entry {
                RxEntry::Hold { fd: f, .. } if *f == fd => Some(k),
                RxEntry::Expect {
                    fd: f,
                    state: Some(ExpectState::Waiting(_)),
                    ..
                } if *f == fd => Some(k),
                _ => None,
            })
            .collect();
        for key in keys {
            if matches!(self.rx[key], RxEntry::Hold { .. }) {
                self.release_hold(key);
            } else {
                self.complete_expect(key, SendStatus::RxTimeout, None);
            }
        }
        self.sync_rx_load();
    }

    fn hold(&mut self, fd: RawFd, seq_id: i64, ticks: u32) {
        if self.rx.len() >= RX_TABLE_SIZE {
            // the EXPECT upgrade will find no record and fail as a timeout
            warn!(
                "listener {}: correlation table full, dropping hold for fd {} seq {}",
                self.index, fd, seq_id
            );
            return;
        }
        let failed = self
            .find_sock(fd)
            .and_then(|key| self.socks[key].failed);
        self.rx.insert(RxEntry::Hold {
            fd,
            seq_id,
            ticks: ticks.max(1),
            result: None,
            failed,
        });
        self.sync_rx_load();
    }

    fn expect(&mut self, msg: BoxedMsg<C::Msg>) {
        let fd = msg.fd;
        let seq_id = msg.seq_id;
        let ticks = msg.timeout_ticks();

        match self.find_rx(fd, seq_id) {
            Some(key) => {
                let hold = match &mut self.rx[key] {
                    RxEntry::Hold { result, failed, .. } => Some((result.take(), *failed)),
                    RxEntry::Expect { .. } => None,
                };
                let (result, failed) = match hold {
                    Some(h) => h,
                    None => {
                        // a record for this pair survived from an earlier
                        // registration of the fd; any response would be
                        // ambiguous, so the new request expires now
                        warn!(
                            "listener {}: stale record for fd {} seq {}, expiring request",
                            self.index, fd, seq_id
                        );
                        let task = msg.complete(SendStatus::RxTimeout, None);
                        self.deliver_new(fd, seq_id, task);
                        return;
                    }
                };
                self.rx[key] = RxEntry::Expect {
                    fd,
                    seq_id,
                    ticks,
                    failed,
                    state: Some(ExpectState::Waiting(msg)),
                };
                if let Some((sid, m)) = result {
                    // response arrived while the request was still being
                    // written
                    debug_assert_eq!(sid, seq_id);
                    self.complete_expect(key, SendStatus::Success, Some(m));
                } else if let Some(kind) = failed {
                    self.complete_expect(key, kind.status(), None);
                }
            }
            None => {
                // the hold already expired and was swept
                debug!(
                    "listener {}: expect with no hold for fd {} seq {}",
                    self.index, fd, seq_id
                );
                let task = msg.complete(SendStatus::RxTimeout, None);
                self.deliver_new(fd, seq_id, task);
            }
        }
    }

    /// Hand a completion for a record that has no slot yet to the workers,
    /// parking it in a fresh slot if they are busy.
    fn deliver_new(&mut self, fd: RawFd, seq_id: i64, task: Task) {
        if let Err(task) = self.workers.submit(task) {
            if self.rx.len() < RX_TABLE_SIZE {
                self.rx.insert(RxEntry::Expect {
                    fd,
                    seq_id,
                    ticks: 1,
                    failed: None,
                    state: Some(ExpectState::Deliver(task)),
                });
                self.sync_rx_load();
            } else if let Err(task) = self.workers.submit_blocking(task) {
                // no room to park and the pool is gone; run the callback
                // here rather than lose it
                warn!(
                    "listener {}: delivering completion for fd {} seq {} inline",
                    self.index, fd, seq_id
                );
                task();
            }
        }
    }

    /// Complete a waiting EXPECT. No-op if it was already completed and is
    /// parked for delivery retry.
    fn complete_expect(&mut self, key: usize, status: SendStatus, msg: Option<C::Msg>) {
        let task = {
            let state = match &mut self.rx[key] {
                RxEntry::Expect { state, .. } => state,
                RxEntry::Hold { .. } => unreachable!("completing a hold"),
            };
            match state.take() {
                Some(ExpectState::Waiting(boxed)) => boxed.complete(status, msg),
                Some(parked) => {
                    *state = Some(parked);
                    return;
                }
                None => unreachable!(),
            }
        };
        self.hand_off(key, task);
    }

    /// Submit a completion; the record slot is freed only once the workers
    /// accept it, so a bounced completion is never lost.
    fn hand_off(&mut self, key: usize, task: Task) {
        match self.workers.submit(task) {
            Ok(()) => {
                self.rx.remove(key);
                self.sync_rx_load();
            }
            Err(task) => match &mut self.rx[key] {
                RxEntry::Expect { state, .. } => *state = Some(ExpectState::Deliver(task)),
                RxEntry::Hold { .. } => unreachable!(),
            },
        }
    }

    fn sock_readable(&mut self, key: usize) {
        loop {
            let (fd, want) = match self.socks.get(key) {
                Some(s) if s.failed.is_none() => (s.fd, s.to_read.max(1)),
                _ => return,
            };
            if self.read_buf.len() < want {
                self.read_buf.resize(want, 0);
            }

            let res = {
                let sock = &self.socks[key];
                sock.transport.read(fd, &mut self.read_buf[..want])
            };
            match res {
                Ok(0) => {
                    debug!("listener {}: fd {} hung up", self.index, fd);
                    self.fail_socket(key, RxFailKind::Hup);
                    return;
                }
                Ok(n) => {
                    self.sink_bytes(key, n);
                    if self.socks.get(key).map_or(true, |s| s.failed.is_some()) {
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("listener {}: read error on fd {}: {}", self.index, fd, e);
                    self.fail_socket(key, RxFailKind::ReadError);
                    return;
                }
            }
        }
    }

    fn sink_bytes(&mut self, key: usize, n: usize) {
        let unpacked = {
            let sock = &mut self.socks[key];
            let res = self.codec.sink(&mut sock.conn, &self.read_buf[..n]);
            sock.to_read = res.next_read.max(1);
            match res.frame {
                Some(frame) => Some(self.codec.unpack(&mut sock.conn, frame)),
                None => None,
            }
        };
        if let Some(un) = unpacked {
            self.process_unpacked(key, un);
        }
    }

    fn process_unpacked(&mut self, key: usize, un: Unpacked<C::Msg>) {
        let fd = self.socks[key].fd;
        match un {
            Unpacked::Msg { seq_id, msg } => {
                let action = match seq_id.and_then(|sid| self.find_rx(fd, sid)) {
                    Some(rk) => match &mut self.rx[rk] {
                        RxEntry::Hold { result, .. } => {
                            if result.is_none() {
                                *result = Some((seq_id.unwrap(), msg));
                                MsgAction::Stored
                            } else {
                                warn!(
                                    "listener {}: duplicate response for fd {} seq {:?}",
                                    self.index, fd, seq_id
                                );
                                MsgAction::Unexpected(msg)
                            }
                        }
                        RxEntry::Expect { .. } => MsgAction::CompleteSuccess(rk, msg),
                    },
                    None => MsgAction::Unexpected(msg),
                };
                match action {
                    MsgAction::Stored => {}
                    MsgAction::CompleteSuccess(rk, msg) => {
                        self.complete_expect(rk, SendStatus::Success, Some(msg));
                    }
                    MsgAction::Unexpected(msg) => {
                        let sock = &mut self.socks[key];
                        self.codec.unexpected(&mut sock.conn, seq_id, msg);
                    }
                }
            }
            Unpacked::Err(err) => {
                if let Some(rk) = err.seq_id.and_then(|sid| self.find_rx(fd, sid)) {
                    let fail_now = match &mut self.rx[rk] {
                        RxEntry::Hold { failed, .. } => {
                            if failed.is_none() {
                                *failed = Some(RxFailKind::BadResponse);
                            }
                            false
                        }
                        RxEntry::Expect { .. } => true,
                    };
                    if fail_now {
                        self.complete_expect(rk, SendStatus::BadResponse, None);
                    }
                }
                let sock = &mut self.socks[key];
                self.codec.unpack_error(&mut sock.conn, err);
            }
        }
    }

    /// Mark a dead socket. Its poll registration is dropped and its pending
    /// records are flagged so the next sweep fails them.
    fn fail_socket(&mut self, key: usize, kind: RxFailKind) {
        let fd = {
            let sock = &mut self.socks[key];
            if sock.failed.is_some() {
                return;
            }
            sock.failed = Some(kind);
            sock.fd
        };
        {
            let sock = &self.socks[key];
            if sock.registered {
                let _ = self.poller.deregister(&mut SourceFd(&sock.fd));
            }
        }
        self.socks[key].registered = false;

        for (_, entry) in self.rx.iter_mut() {
            match entry {
                RxEntry::Hold {
                    fd: f, failed, ..
                } if *f == fd => {
                    if failed.is_none() {
                        *failed = Some(kind);
                    }
                }
                RxEntry::Expect {
                    fd: f,
                    failed,
                    state: Some(ExpectState::Waiting(_)),
                    ..
                } if *f == fd => {
                    if failed.is_none() {
                        *failed = Some(kind);
                    }
                }
                _ => {}
            }
        }
        self.idle = false;
    }

    /// The once-a-second sweep: countdowns, failed-socket records, and
    /// delivery retries.
    fn tick(&mut self) {
        enum Action {
            Keep,
            ReleaseHold,
            Complete(SendStatus),
            RetryDelivery,
        }

        let keys: Vec<usize> = self.rx.iter().map(|(k, _)| k).collect();
        for key in keys {
            if !self.rx.contains(key) {
                continue;
            }
            let action = match &mut self.rx[key] {
                RxEntry::Hold { ticks, .. } => {
                    if *ticks <= 1 {
                        Action::ReleaseHold
                    } else {
                        *ticks -= 1;
                        Action::Keep
                    }
                }
                RxEntry::Expect {
                    ticks,
                    failed,
                    state,
                    ..
                } => match state {
                    Some(ExpectState::Deliver(_)) => Action::RetryDelivery,
                    Some(ExpectState::Waiting(_)) => {
                        if let Some(kind) = failed {
                            Action::Complete(kind.status())
                        } else if *ticks <= 1 {
                            Action::Complete(SendStatus::RxTimeout)
                        } else {
                            *ticks -= 1;
                            Action::Keep
                        }
                    }
                    None => unreachable!(),
                },
            };
            match action {
                Action::Keep => {}
                Action::ReleaseHold => self.release_hold(key),
                Action::Complete(status) => self.complete_expect(key, status, None),
                Action::RetryDelivery => self.retry_delivery(key),
            }
        }
        self.sync_rx_load();
        self.idle = self.rx.is_empty();
    }

    fn retry_delivery(&mut self, key: usize) {
        let task = match &mut self.rx[key] {
            RxEntry::Expect { state, .. } => match state.take() {
                Some(ExpectState::Deliver(task)) => task,
                other => {
                    *state = other;
                    return;
                }
            },
            RxEntry::Hold { .. } => return,
        };
        self.hand_off(key, task);
    }

    /// Expire a HOLD. A result that arrived but was never claimed goes out
    /// through the unexpected-message hook.
    fn release_hold(&mut self, key: usize) {
        let entry = self.rx.remove(key);
        self.sync_rx_load();
        if let RxEntry::Hold {
            fd,
            seq_id,
            result: Some((sid, msg)),
            ..
        } = entry
        {
            debug!(
                "listener {}: hold for fd {} seq {} expired with unclaimed result",
                self.index, fd, seq_id
            );
            match self.find_sock(fd) {
                Some(sk) => {
                    let sock = &mut self.socks[sk];
                    self.codec.unexpected(&mut sock.conn, Some(sid), msg);
                }
                None => {
                    warn!(
                        "listener {}: dropping unclaimed result for released fd {} seq {}",
                        self.index, fd, sid
                    );
                }
            }
        }
    }

    /// On shutdown, every record still pending completes as a receive
    /// failure; parked deliveries get one last chance at the workers.
    fn flush_pending(&mut self) {
        let keys: Vec<usize> = self.rx.iter().map(|(k, _)| k).collect();
        for key in keys {
            let entry = self.rx.remove(key);
            let task = match entry {
                RxEntry::Expect {
                    state: Some(ExpectState::Waiting(msg)),
                    ..
                } => msg.complete(SendStatus::RxFailure, None),
                RxEntry::Expect {
                    state: Some(ExpectState::Deliver(task)),
                    ..
                } => task,
                _ => continue,
            };
            if let Err(task) = self.workers.submit_blocking(task) {
                // the pool is already gone; run the callback here rather
                // than lose it
                warn!(
                    "listener {}: delivering shutdown completion inline",
                    self.index
                );
                task();
            }
        }
        self.sync_rx_load();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boxed::Request;
    use crate::codec::SinkResult;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn tiered_is_zero_below_a_quarter() {
        for cap in [32usize, 1024] {
            for used in 0..cap / 4 {
                assert_eq!(tiered(used, cap), 0, "used={} cap={}", used, cap);
            }
        }
    }

    #[test]
    fn tiered_is_monotone() {
        for cap in [32usize, 64, 1024] {
            let mut prev = 0;
            for used in 0..=cap {
                let v = tiered(used, cap);
                assert!(v >= prev, "used={} cap={}: {} < {}", used, cap, v, prev);
                prev = v;
            }
        }
    }

    #[test]
    fn tiered_is_superlinear_near_capacity() {
        for cap in [32usize, 1024] {
            let used = cap - 1;
            assert!(u32::from(tiered(used, cap)) > 2 * used as u32);
        }
    }

    #[test]
    fn backpressure_sums_resources() {
        assert_eq!(backpressure(0, 0, 0, 64), 0);
        let cmds_only = backpressure(CMD_POOL_SIZE - 1, 0, 0, 64);
        let both = backpressure(CMD_POOL_SIZE - 1, RX_TABLE_SIZE - 1, 0, 64);
        assert!(both > cmds_only);
        assert!(cmds_only > 0);
    }

    struct FixedCodec;

    struct FixedConn {
        buf: Vec<u8>,
    }

    // four-byte frames; the first byte is the sequence id
    impl Codec for FixedCodec {
        type Msg = Vec<u8>;
        type Conn = FixedConn;

        fn sink(&self, conn: &mut FixedConn, buf: &[u8]) -> SinkResult {
            conn.buf.extend_from_slice(buf);
            if conn.buf.len() >= 4 {
                let frame: Vec<u8> = conn.buf.drain(..4).collect();
                SinkResult {
                    next_read: 4,
                    frame: Some(frame),
                }
            } else {
                SinkResult {
                    next_read: 4 - conn.buf.len(),
                    frame: None,
                }
            }
        }

        fn unpack(&self, _conn: &mut FixedConn, frame: Vec<u8>) -> Unpacked<Vec<u8>> {
            Unpacked::Msg {
                seq_id: Some(i64::from(frame[0])),
                msg: frame,
            }
        }
    }

    #[test]
    fn response_arriving_during_hold_is_delivered_on_expect() {
        let (local, mut peer) = UnixStream::pair().unwrap();
        local.set_nonblocking(true).unwrap();
        let workers = Arc::new(WorkerPool::new(1, 8).unwrap());
        let listener = Listener::spawn(0, Arc::new(FixedCodec), workers, 8).unwrap();

        let fd = local.as_raw_fd();
        assert!(listener
            .add_socket(fd, Transport::Plain, FixedConn { buf: Vec::new() })
            .is_ok());

        // the record exists once hold() returns, so the response may land
        // before the request record is transferred
        listener.hold(fd, 7, 10).unwrap();
        peer.write_all(&[7, b'y', b'e', b's']).unwrap();
        thread::sleep(Duration::from_millis(200));

        let (tx, rx) = mpsc::channel();
        let msg = BoxedMsg::new(
            Request {
                fd,
                seq_id: 7,
                payload: vec![0],
                timeout: Some(Duration::from_secs(5)),
                done: Box::new(move |res| {
                    let _ = tx.send(res);
                }),
            },
            Transport::Plain,
            Duration::from_secs(5),
        );
        assert!(listener.expect(msg).is_ok());

        let res = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(res.status, SendStatus::Success);
        assert_eq!(res.seq_id, 7);
        assert_eq!(res.msg.unwrap(), vec![7, b'y', b'e', b's']);

        assert!(listener.remove_socket(fd).is_ok());
        assert!(listener.shutdown_and_join());
    }
}
