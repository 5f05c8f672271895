// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

/*! The worker pool that runs every completion handler in the engine.

A [`Scheduler`] owns a bounded set of worker threads draining a shared
job queue. Objects that need their handlers serialized (terminals,
bindings, connections) each hold a [`Strand`]: a lightweight queue that
feeds the pool one job at a time, so handlers for the same object never
run concurrently while handlers for different objects spread across the
pool.
*/

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    thread,
};

use tracing::warn;

use crate::{
    consts,
    errors::{Error, Result},
};

type Task = Box<dyn FnOnce() + Send>;

enum Job {
    Run(Task),
    Retire,
}

struct Workers {
    handles: Vec<thread::JoinHandle<()>>,
    size: usize,
}

struct SchedulerInner {
    tx: crossbeam_channel::Sender<Job>,
    rx: crossbeam_channel::Receiver<Job>,
    workers: Mutex<Workers>,
}

/// A handle to a bounded thread pool. Cloning the handle shares the
/// pool; the pool shuts down when the last handle drops.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        let (tx, rx) = crossbeam_channel::unbounded();
        let scheduler = Scheduler {
            inner: Arc::new(SchedulerInner {
                tx,
                rx,
                workers: Mutex::new(Workers { handles: vec![], size: 0 }),
            }),
        };

        scheduler
            .set_thread_pool_size(consts::DEFAULT_THREAD_POOL_SIZE)
            .expect("default pool size to be valid");

        scheduler
    }

    /// Resize the worker pool. Growing spawns workers immediately;
    /// shrinking retires workers once they finish their current job.
    pub fn set_thread_pool_size(&self, n: usize) -> Result<()> {
        if n < 1 || n > consts::MAX_THREAD_POOL_SIZE {
            return Err(Error::BadConfiguration(format!(
                "thread pool size {} outside [1, {}]",
                n,
                consts::MAX_THREAD_POOL_SIZE
            )));
        }

        let mut workers = self.inner.workers.lock().unwrap();
        while workers.size < n {
            let rx = self.inner.rx.clone();
            let handle = thread::Builder::new()
                .name(String::from("yogi-worker"))
                .spawn(move || worker_main(rx))
                .map_err(|_| Error::Unknown)?;
            workers.handles.push(handle);
            workers.size += 1;
        }
        while workers.size > n {
            // the retiring worker joins lazily; its handle is cleaned
            // up on the next resize or at shutdown
            let _ = self.inner.tx.send(Job::Retire);
            workers.size -= 1;
        }
        workers.handles.retain(|h| !h.is_finished());

        Ok(())
    }

    /// Run a job on some worker, as soon as one is free.
    pub(crate) fn post<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.inner.tx.send(Job::Run(Box::new(f))).is_err() {
            warn!("dropping job posted to a shut down scheduler");
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new()
    }
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        let workers = self.workers.get_mut().unwrap();
        for _ in 0..workers.size {
            let _ = self.tx.send(Job::Retire);
        }
        for handle in workers.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_main(rx: crossbeam_channel::Receiver<Job>) {
    while let Ok(job) = rx.recv() {
        match job {
            Job::Run(task) => task(),
            Job::Retire => break,
        }
    }
}

struct StrandQueue {
    tasks: VecDeque<Task>,
    running: bool,
}

struct StrandInner {
    scheduler: Scheduler,
    queue: Mutex<StrandQueue>,
}

/// Serializes jobs for one object on top of the shared pool: at most
/// one queued task runs at a time, in post order.
#[derive(Clone)]
pub(crate) struct Strand {
    inner: Arc<StrandInner>,
}

impl Strand {
    pub fn new(scheduler: &Scheduler) -> Strand {
        Strand {
            inner: Arc::new(StrandInner {
                scheduler: scheduler.clone(),
                queue: Mutex::new(StrandQueue { tasks: VecDeque::new(), running: false }),
            }),
        }
    }

    pub fn post<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let start = {
            let mut queue = self.inner.queue.lock().unwrap();
            queue.tasks.push_back(Box::new(f));
            if queue.running {
                false
            } else {
                queue.running = true;
                true
            }
        };

        if start {
            let inner = Arc::clone(&self.inner);
            self.inner.scheduler.post(move || run_one(inner));
        }
    }
}

// Runs a single task then yields the worker back to the pool so that a
// busy strand cannot starve the others.
fn run_one(inner: Arc<StrandInner>) {
    let task = {
        let mut queue = inner.queue.lock().unwrap();
        match queue.tasks.pop_front() {
            Some(t) => t,
            None => {
                queue.running = false;
                return;
            }
        }
    };

    task();

    let more = {
        let mut queue = inner.queue.lock().unwrap();
        if queue.tasks.is_empty() {
            queue.running = false;
            false
        } else {
            true
        }
    };

    if more {
        let scheduler = inner.scheduler.clone();
        scheduler.post(move || run_one(inner));
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time,
    };

    use super::*;

    #[test]
    fn pool_size_limits() {
        let scheduler = Scheduler::new();
        assert!(scheduler.set_thread_pool_size(3).is_ok());
        assert!(scheduler.set_thread_pool_size(999999).is_err());
        assert!(scheduler.set_thread_pool_size(0).is_err());
        assert!(scheduler.set_thread_pool_size(1).is_ok());
    }

    #[test]
    fn runs_posted_jobs() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            scheduler.post(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        let deadline = time::Instant::now() + time::Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < 100 {
            assert!(time::Instant::now() < deadline, "jobs never ran");
            thread::sleep(time::Duration::from_millis(1));
        }
    }

    #[test]
    fn strand_serializes_in_order() {
        let scheduler = Scheduler::new();
        scheduler.set_thread_pool_size(4).unwrap();
        let strand = Strand::new(&scheduler);

        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..50usize {
            let seen = Arc::clone(&seen);
            strand.post(move || {
                seen.lock().unwrap().push(i);
            });
        }

        let deadline = time::Instant::now() + time::Duration::from_secs(5);
        loop {
            {
                let seen = seen.lock().unwrap();
                if seen.len() == 50 {
                    assert_eq!(*seen, (0..50).collect::<Vec<_>>());
                    break;
                }
            }
            assert!(time::Instant::now() < deadline, "strand tasks never ran");
            thread::sleep(time::Duration::from_millis(1));
        }
    }
}
