//! Raft scheduler: worker pools processing ranges off a shared range-id
//! queue.
//!
//! A range may be enqueued any number of times; pending work accumulates as
//! state flags and the range sits in the queue at most once. While a worker
//! processes a range the range stays marked as queued, so no other worker
//! of the same pool picks it up; work added meanwhile re-queues it when the
//! worker is done.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::kvpb::RangeId;
use crate::utils::{KvError, MutexExt, Stopper};

use tokio::sync::Notify;

const RANGE_ID_CHUNK_SIZE: usize = 1000;

/// FIFO of range ids stored in fixed-size chunks, plus a single
/// high-priority id that jumps the line once per push.
#[derive(Debug, Default)]
pub struct RangeIdQueue {
    len: usize,
    chunks: VecDeque<VecDeque<RangeId>>,

    priority_id: RangeId,
    priority_queued: bool,
}

impl RangeIdQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, id: RangeId) {
        self.len += 1;
        if self.priority_id != 0 && self.priority_id == id {
            self.priority_queued = true;
            return;
        }
        match self.chunks.back_mut() {
            Some(chunk) if chunk.len() < RANGE_ID_CHUNK_SIZE => chunk.push_back(id),
            _ => {
                let mut chunk = VecDeque::with_capacity(RANGE_ID_CHUNK_SIZE);
                chunk.push_back(id);
                self.chunks.push_back(chunk);
            }
        }
    }

    pub fn pop_front(&mut self) -> Option<RangeId> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        if self.priority_queued {
            self.priority_queued = false;
            return Some(self.priority_id);
        }
        let front = self.chunks.front_mut()?;
        let id = front.pop_front();
        if front.is_empty() {
            self.chunks.pop_front();
        }
        id
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Sets the priority id; it can only be set once.
    pub fn set_priority_id(&mut self, id: RangeId) -> Result<(), KvError> {
        if self.priority_id != 0 && self.priority_id != id {
            return logged_err!("scheduler"; "priority range id already set: old={}, new={}",
                                            self.priority_id, id);
        }
        self.priority_id = id;
        Ok(())
    }
}

/// Callbacks into the store.
pub trait RaftProcessor: Send + Sync {
    /// Drives the range's pending consensus output to storage, the network
    /// and the state machine.
    fn process_ready(&self, range_id: RangeId);

    /// Steps queued incoming messages; returns true if ready processing is
    /// needed.
    fn process_request_queue(&self, range_id: RangeId) -> bool;

    /// Ticks the range; returns true if ready processing is needed.
    fn process_tick(&self, range_id: RangeId) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerType {
    Tick,
    ReadyRequest,
}

const STATE_QUEUED: u8 = 1 << 0;
const STATE_RAFT_READY: u8 = 1 << 1;
const STATE_RAFT_REQUEST: u8 = 1 << 2;
const STATE_RAFT_TICK: u8 = 1 << 3;

#[derive(Default)]
struct SchedulerState {
    queue: RangeIdQueue,
    state: HashMap<RangeId, u8>,
    stopped: bool,
}

/// One worker pool of the raft scheduler.
pub struct RaftScheduler {
    typ: SchedulerType,
    num_workers: usize,
    mu: Mutex<SchedulerState>,
    notify: Notify,
}

impl RaftScheduler {
    pub fn new(typ: SchedulerType, num_workers: usize) -> Arc<Self> {
        Arc::new(RaftScheduler {
            typ,
            num_workers: num_workers.max(1),
            mu: Mutex::new(SchedulerState::default()),
            notify: Notify::new(),
        })
    }

    /// Spawns the workers of the pool.
    pub fn start(
        self: &Arc<Self>,
        processor: Arc<dyn RaftProcessor>,
        stopper: &Stopper,
    ) -> Result<(), KvError> {
        let me = self.clone();
        let stopper_ref = stopper.clone();
        stopper.run_worker("raft-scheduler-stopper", async move {
            stopper_ref.quiesced().await;
            me.mu.locked().stopped = true;
            me.notify.notify_waiters();
        })?;

        for i in 0..self.num_workers {
            let me = self.clone();
            let processor = processor.clone();
            stopper.run_worker(
                &format!("raft-scheduler-{:?}-{}", self.typ, i),
                async move { me.worker(processor).await },
            )?;
        }
        Ok(())
    }

    async fn worker(self: Arc<Self>, processor: Arc<dyn RaftProcessor>) {
        loop {
            let popped = {
                let mut mu = self.mu.locked();
                if mu.stopped {
                    return;
                }
                match mu.queue.pop_front() {
                    Some(id) => {
                        // stays marked as queued so it is not queued again
                        let state = mu.state.insert(id, STATE_QUEUED).unwrap_or(0);
                        Some((id, state))
                    }
                    None => None,
                }
            };
            let (id, mut state) = match popped {
                Some(p) => p,
                None => {
                    self.notify.notified().await;
                    continue;
                }
            };

            match self.typ {
                SchedulerType::Tick => {
                    if state & STATE_RAFT_TICK != 0 && processor.process_tick(id) {
                        processor.process_ready(id);
                    }
                }
                SchedulerType::ReadyRequest => {
                    if state & STATE_RAFT_REQUEST != 0 && processor.process_request_queue(id) {
                        state |= STATE_RAFT_READY;
                    }
                    if state & STATE_RAFT_READY != 0 {
                        processor.process_ready(id);
                    }
                }
            }

            let mut mu = self.mu.locked();
            if mu.state.get(&id).copied() == Some(STATE_QUEUED) {
                mu.state.remove(&id);
            } else {
                mu.queue.push(id);
                drop(mu);
                self.notify.notify_one();
            }
        }
    }

    fn enqueue_with(mu: &mut SchedulerState, id: RangeId, add: u8) -> bool {
        let prev = mu.state.get(&id).copied().unwrap_or(0);
        if prev & add == add {
            return false;
        }
        let mut new = prev | add;
        if prev & STATE_QUEUED == 0 {
            new |= STATE_QUEUED;
            mu.queue.push(id);
            mu.state.insert(id, new);
            return true;
        }
        mu.state.insert(id, new);
        false
    }

    fn enqueue_one(&self, id: RangeId, add: u8) {
        let queued = Self::enqueue_with(&mut self.mu.locked(), id, add);
        if queued {
            self.notify.notify_one();
        }
    }

    pub fn enqueue_raft_ready(&self, id: RangeId) {
        self.enqueue_one(id, STATE_RAFT_READY);
    }

    pub fn enqueue_raft_request(&self, id: RangeId) {
        self.enqueue_one(id, STATE_RAFT_REQUEST);
    }

    pub fn enqueue_raft_ticks(&self, ids: &[RangeId]) {
        let mut count = 0;
        {
            let mut mu = self.mu.locked();
            for &id in ids {
                if Self::enqueue_with(&mut mu, id, STATE_RAFT_TICK) {
                    count += 1;
                }
            }
        }
        for _ in 0..count.min(self.num_workers) {
            self.notify.notify_one();
        }
    }

    pub fn set_priority_id(&self, id: RangeId) -> Result<(), KvError> {
        self.mu.locked().queue.set_priority_id(id)
    }

    pub fn priority_id(&self) -> RangeId {
        self.mu.locked().queue.priority_id
    }

    /// Number of ranges waiting in the queue.
    pub fn queue_len(&self) -> usize {
        self.mu.locked().queue.len()
    }
}
