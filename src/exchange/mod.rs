//! Buffer exchange between the input thread and the sort workers.
//!
//! ## Design Overview
//!
//! One producer fills [`RecordBuffer`]s with raw input; `N` consumers (one per
//! slot) split them into lines and feed their sorters. Each slot owns two
//! single-item queues:
//!
//! - **filled**: producer -> consumer, carries a buffer ready to be mapped;
//! - **empty**: consumer -> producer, carries a buffer the consumer is done with.
//!
//! Sending a buffer through a queue moves it, so a buffer is only ever
//! reachable from one thread. The producer scans slots round-robin, starting
//! after the slot it served last, and hands its filled buffer to the first
//! slot that either never received one (`Initial`) or has returned an empty
//! buffer (`Working`). When no slot is ready it blocks on all empty queues
//! plus a failure queue at once.
//!
//! ## Shutdown
//!
//! [`BufferExchange::producer_finish`] drops every filled sender. A consumer
//! still receives a buffer that was already pending, then sees the queue
//! disconnected and stops. [`BufferExchange::consumer_fail`] poisons the
//! exchange: the producer's next [`producer_swap`](BufferExchange::producer_swap)
//! returns `None`, after which it must call `producer_finish` to release the
//! remaining consumers.
//!
//! ## Allocation
//!
//! The producer may take `2 * N` buffers through
//! [`producer_get`](BufferExchange::producer_get). A slot receiving its first
//! buffer hands back a freshly allocated one, so at most `3 * N` buffers ever
//! exist.


use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use crossbeam::channel::{self, Receiver, Select, Sender};
use crossbeam::utils::Backoff;
use thiserror::Error;
use tracing::{debug, error};

use crate::buffer::RecordBuffer;

/// Errors returned by [`BufferExchange`].
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// The producer asked for more buffers than the pool allows.
    #[error("resource exhausted: producer may allocate at most {limit} buffers")]
    ResourceExhausted { limit: usize },
}

// ------------------------------------------------------------------------------------------------
// Slot state
// ------------------------------------------------------------------------------------------------

/// Observable state of one consumer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    /// No buffer has been delivered yet.
    Initial = 0,

    /// The consumer returned an empty buffer and waits for the next one.
    Working = 1,

    /// A buffer is waiting for the consumer.
    Filled = 2,

    /// The consumer holds a buffer and is mapping it.
    Processing = 3,

    /// Nothing more will be delivered.
    Finished = 4,
}

impl SlotState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SlotState::Initial,
            1 => SlotState::Working,
            2 => SlotState::Filled,
            3 => SlotState::Processing,
            _ => SlotState::Finished,
        }
    }
}

struct Slot {
    state: AtomicU8,
    filled_rx: Receiver<RecordBuffer>,
    empty_tx: Sender<RecordBuffer>,
    empty_rx: Receiver<RecordBuffer>,
}

impl Slot {
    fn state(&self) -> SlotState {
        SlotState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SlotState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

// ------------------------------------------------------------------------------------------------
// BufferExchange
// ------------------------------------------------------------------------------------------------

/// Hands record buffers from one producer to `N` consumer slots.
pub struct BufferExchange {
    buffer_size: usize,
    slots: Vec<Slot>,
    filled_tx: Mutex<Vec<Sender<RecordBuffer>>>,
    failure_tx: Sender<usize>,
    failure_rx: Receiver<usize>,
    failed: AtomicBool,
    next_slot: AtomicUsize,
    producer_allocated: AtomicUsize,
}

impl BufferExchange {
    /// Creates an exchange for `consumers` slots of `buffer_size`-byte buffers.
    pub fn new(buffer_size: usize, consumers: usize) -> Self {
        let consumers = consumers.max(1);
        let mut slots = Vec::with_capacity(consumers);
        let mut filled_tx = Vec::with_capacity(consumers);

        for _ in 0..consumers {
            let (ftx, frx) = channel::bounded(1);
            let (etx, erx) = channel::bounded(1);
            filled_tx.push(ftx);
            slots.push(Slot {
                state: AtomicU8::new(SlotState::Initial as u8),
                filled_rx: frx,
                empty_tx: etx,
                empty_rx: erx,
            });
        }

        let (failure_tx, failure_rx) = channel::unbounded();
        Self {
            buffer_size,
            slots,
            filled_tx: Mutex::new(filled_tx),
            failure_tx,
            failure_rx,
            failed: AtomicBool::new(false),
            next_slot: AtomicUsize::new(0),
            producer_allocated: AtomicUsize::new(0),
        }
    }

    pub fn consumers(&self) -> usize {
        self.slots.len()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn slot_state(&self, id: usize) -> SlotState {
        self.slots[id].state()
    }

    /// Whether a consumer has called [`consumer_fail`](Self::consumer_fail).
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    // --------------------------------------------------------------------------------------------
    // Producer side
    // --------------------------------------------------------------------------------------------

    /// Allocates a fresh buffer for the producer.
    pub fn producer_get(&self) -> Result<RecordBuffer, ExchangeError> {
        let limit = 2 * self.slots.len();
        let taken = self.producer_allocated.fetch_add(1, Ordering::AcqRel);
        if taken >= limit {
            self.producer_allocated.fetch_sub(1, Ordering::AcqRel);
            return Err(ExchangeError::ResourceExhausted { limit });
        }
        Ok(RecordBuffer::with_capacity(self.buffer_size))
    }

    /// Hands `filled` to the next ready slot and returns an empty buffer.
    ///
    /// Blocks until some slot is ready. Returns `None` once a consumer has
    /// failed or after [`producer_finish`](Self::producer_finish).
    pub fn producer_swap(&self, filled: RecordBuffer) -> Option<RecordBuffer> {
        let senders = match self.filled_tx.lock() {
            Ok(guard) => guard,
            Err(_) => return None,
        };
        if senders.is_empty() {
            return None;
        }

        let n = self.slots.len();
        loop {
            if self.is_failed() {
                return None;
            }

            let first = self.next_slot.load(Ordering::Relaxed);
            for offset in 0..n {
                let id = (first + offset) % n;
                let slot = &self.slots[id];
                let empty = match slot.state() {
                    SlotState::Finished => continue,
                    SlotState::Initial => RecordBuffer::with_capacity(self.buffer_size),
                    _ => match slot.empty_rx.try_recv() {
                        Ok(buffer) => buffer,
                        Err(_) => continue,
                    },
                };

                slot.set_state(SlotState::Filled);
                self.next_slot.store((id + 1) % n, Ordering::Relaxed);
                if senders[id].send(filled).is_err() {
                    return None;
                }
                return Some(empty);
            }

            // Nothing ready: wait for any returned buffer or a failure.
            let mut select = Select::new();
            for slot in &self.slots {
                select.recv(&slot.empty_rx);
            }
            select.recv(&self.failure_rx);
            select.ready();
        }
    }

    /// Ends the stream. Pending buffers are still delivered; afterwards
    /// every consumer observes end of input.
    pub fn producer_finish(&self) {
        match self.filled_tx.lock() {
            Ok(mut senders) => senders.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }

        for slot in &self.slots {
            if slot.state() != SlotState::Filled {
                slot.set_state(SlotState::Finished);
            }
        }

        // A consumer may still be picking up its last buffer.
        let backoff = Backoff::new();
        while self
            .slots
            .iter()
            .any(|slot| slot.state() != SlotState::Finished && !slot.filled_rx.is_empty())
        {
            backoff.snooze();
        }

        debug!(consumers = self.slots.len(), "buffer exchange finished");
    }

    // --------------------------------------------------------------------------------------------
    // Consumer side
    // --------------------------------------------------------------------------------------------

    /// Waits for the first buffer of slot `id`. `None` means end of stream.
    pub fn consumer_get(&self, id: usize) -> Option<RecordBuffer> {
        let slot = &self.slots[id];
        match slot.filled_rx.recv() {
            Ok(buffer) => {
                slot.set_state(SlotState::Processing);
                Some(buffer)
            }
            Err(_) => {
                slot.set_state(SlotState::Finished);
                None
            }
        }
    }

    /// Returns a processed buffer and waits for the next one.
    pub fn consumer_swap(&self, mut buffer: RecordBuffer, id: usize) -> Option<RecordBuffer> {
        let slot = &self.slots[id];
        buffer.clear();
        slot.set_state(SlotState::Working);
        // The producer drained the previous deposit before filling this slot,
        // so the queue has room.
        let _ = slot.empty_tx.try_send(buffer);
        self.consumer_get(id)
    }

    /// Poisons the exchange from consumer `id`.
    pub fn consumer_fail(&self, id: usize) {
        error!(consumer = id, "consumer failed, stopping input");
        self.slots[id].set_state(SlotState::Finished);
        self.failed.store(true, Ordering::Release);
        let _ = self.failure_tx.send(id);
    }
}
