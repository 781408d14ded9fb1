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

//! Completion workers.
//!
//! Callbacks never run on a listener thread; a slow callback there would
//! stall every socket in the shard. Instead the listener hands completion
//! tasks to this small fixed pool. Submission is non-blocking so the
//! listener can park a task and retry on its next tick; the queue depth
//! feeds downstream backpressure.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread;

use log::{debug, error};

pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct WorkerPool {
    /// One bounded queue per worker; `None` after shutdown.
    queues: Mutex<Option<Vec<mpsc::SyncSender<Task>>>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    next: AtomicUsize,
    depth: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub fn new(workers: usize, queue_depth: usize) -> std::io::Result<WorkerPool> {
        assert!(workers > 0 && queue_depth > 0);
        let depth = Arc::new(AtomicUsize::new(0));
        let mut queues = Vec::with_capacity(workers);
        let mut threads = Vec::with_capacity(workers);
        for i in 0..workers {
            let (tx, rx) = mpsc::sync_channel::<Task>(queue_depth);
            let depth = depth.clone();
            let handle = thread::Builder::new()
                .name(format!("wirebus-worker-{}", i))
                .spawn(move || {
                    while let Ok(task) = rx.recv() {
                        task();
                        depth.fetch_sub(1, Ordering::Relaxed);
                    }
                    debug!("worker stopping");
                })?;
            queues.push(tx);
            threads.push(handle);
        }
        Ok(WorkerPool {
            queues: Mutex::new(Some(queues)),
            threads: Mutex::new(threads),
            next: AtomicUsize::new(0),
            depth,
        })
    }

    /// Outstanding tasks across all queues.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Hand a task to some worker without blocking. Every queue full, or
    /// the pool shut down, returns the task to the caller.
    pub fn submit(&self, task: Task) -> Result<(), Task> {
        let queues = self.queues.lock().unwrap();
        let queues = match queues.as_ref() {
            Some(q) => q,
            None => return Err(task),
        };
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        let mut task = task;
        self.depth.fetch_add(1, Ordering::Relaxed);
        for i in 0..queues.len() {
            let q = &queues[(start + i) % queues.len()];
            match q.try_send(task) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(t)) | Err(TrySendError::Disconnected(t)) => task = t,
            }
        }
        self.depth.fetch_sub(1, Ordering::Relaxed);
        Err(task)
    }

    /// Hand a task to a worker, waiting for queue room. `Err` only when the
    /// pool has been shut down.
    pub fn submit_blocking(&self, task: Task) -> Result<(), Task> {
        let tx = {
            let queues = self.queues.lock().unwrap();
            match queues.as_ref() {
                Some(q) => {
                    let i = self.next.fetch_add(1, Ordering::Relaxed) % q.len();
                    q[i].clone()
                }
                None => return Err(task),
            }
        };
        self.depth.fetch_add(1, Ordering::Relaxed);
        match tx.send(task) {
            Ok(()) => Ok(()),
            Err(mpsc::SendError(task)) => {
                self.depth.fetch_sub(1, Ordering::Relaxed);
                Err(task)
            }
        }
    }

    /// Stop accepting tasks, let queued tasks finish, and join the threads.
    pub fn shutdown(&self) {
        let queues = self.queues.lock().unwrap().take();
        if queues.is_none() {
            return;
        }
        drop(queues);
        let threads: Vec<_> = self.threads.lock().unwrap().drain(..).collect();
        for handle in threads {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;
    use std::time::Duration;

    #[test]
    fn submitted_tasks_run() {
        let pool = WorkerPool::new(2, 8).unwrap();
        let (tx, rx) = channel();
        for i in 0..16 {
            let tx = tx.clone();
            let mut task: Task = Box::new(move || tx.send(i).unwrap());
            loop {
                match pool.submit(task) {
                    Ok(()) => break,
                    Err(t) => {
                        task = t;
                        std::thread::sleep(Duration::from_millis(1));
                    }
                }
            }
        }
        let mut seen: Vec<u32> = (0..16)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..16).collect::<Vec<_>>());
        pool.shutdown();
    }

    #[test]
    fn full_queues_bounce_the_task() {
        let pool = WorkerPool::new(1, 1).unwrap();
        let (gate_tx, gate_rx) = channel::<()>();

        // occupy the worker
        assert!(pool
            .submit(Box::new(move || {
                gate_rx.recv().unwrap();
            }))
            .is_ok());

        // fill the queue, then overflow it
        let mut bounced = false;
        for _ in 0..4 {
            if pool.submit(Box::new(|| {})).is_err() {
                bounced = true;
                break;
            }
        }
        assert!(bounced);

        gate_tx.send(()).unwrap();
        pool.shutdown();
    }

    #[test]
    fn shutdown_rejects_new_tasks_and_is_idempotent() {
        let pool = WorkerPool::new(1, 4).unwrap();
        pool.shutdown();
        pool.shutdown();
        assert!(pool.submit(Box::new(|| {})).is_err());
        assert!(pool.submit_blocking(Box::new(|| {})).is_err());
    }

    #[test]
    fn blocking_submit_waits_for_queue_room() {
        let pool = WorkerPool::new(1, 1).unwrap();
        let (gate_tx, gate_rx) = channel::<()>();

        // occupy the worker, then fill the queue behind it
        assert!(pool
            .submit(Box::new(move || {
                gate_rx.recv().unwrap();
            }))
            .is_ok());
        while pool.submit(Box::new(|| {})).is_ok() {}

        let opener = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            gate_tx.send(()).unwrap();
        });

        let (done_tx, done_rx) = channel();
        assert!(pool
            .submit_blocking(Box::new(move || done_tx.send(()).unwrap()))
            .is_ok());
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        opener.join().unwrap();
        pool.shutdown();
    }

    #[test]
    fn shutdown_drains_queued_tasks() {
        let pool = WorkerPool::new(1, 8).unwrap();
        let (tx, rx) = channel();
        for i in 0..4 {
            let tx = tx.clone();
            assert!(pool.submit(Box::new(move || tx.send(i).unwrap())).is_ok());
        }
        pool.shutdown();
        let mut seen: Vec<u32> = rx.try_iter().collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }
}
