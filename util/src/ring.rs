use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::packet::{DataPacket, DataPacketBatch};

pub const DEFAULT_BUFFER_COUNT: usize = 64;
pub const DEFAULT_BUFFER_SIZE: usize = 262144;
pub const DEFAULT_MAX_PACKETS_PER_BATCH: usize = 8;
pub const DEFAULT_MAX_BATCH_INTERVAL_MS: u64 = 50;

const WARNING_PERCENT: usize = 75;
const CRITICAL_PERCENT: usize = 90;

#[derive(Clone, Debug)]
pub struct RingConfig {
    pub buffer_count: usize,
    pub buffer_size: usize,
    pub max_packets_per_batch: usize,
    pub max_batch_interval: Duration,
    /// With batching off every commit surfaces as a loose packet instead
    /// of accruing into a batch.
    pub batching: bool,
}

impl Default for RingConfig {
    fn default() -> Self {
        RingConfig {
            buffer_count: DEFAULT_BUFFER_COUNT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_packets_per_batch: DEFAULT_MAX_PACKETS_PER_BATCH,
            max_batch_interval: Duration::from_millis(DEFAULT_MAX_BATCH_INTERVAL_MS),
            batching: true,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RingError {
    #[error("attempted to commit an empty buffer")]
    EmptyCommit,
    #[error("commit of {bytes} bytes exceeds slot capacity {capacity}")]
    Oversize { bytes: usize, capacity: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum OccupancyLevel {
    Normal,
    Warning,
    Critical,
}

#[derive(Debug)]
pub enum ReadyData {
    Batch(DataPacketBatch),
    Packet(DataPacket),
}

struct RingState {
    write_index: usize,
    ready_packets: VecDeque<DataPacket>,
    ready_batches: VecDeque<DataPacketBatch>,
    current_batch: Vec<DataPacket>,
    batch_start: Option<Instant>,
    next_batch_id: u32,
    /// Committed but not yet consumed packets, across both queues and the
    /// open batch. Drives the occupancy level.
    pending: usize,
}

/// Fixed pool of equal-sized byte buffers coupling the USB reader to the
/// downstream consumers.
///
/// The producer checks out the slot at `write_index`, fills it outside any
/// queue lock, and commits the number of bytes actually read. Committing
/// copies the payload into a fresh shared packet, so the slot is immediately
/// reusable. A single producer is assumed: only one slot may be checked out
/// at a time.
pub struct RingBuffer {
    slots: Vec<Mutex<Box<[u8]>>>,
    state: Mutex<RingState>,
    data_ready: Condvar,
    config: RingConfig,
}

pub struct WriteSlot<'a> {
    guard: MutexGuard<'a, Box<[u8]>>,
}

impl WriteSlot<'_> {
    pub fn buf(&mut self) -> &mut [u8] {
        &mut self.guard
    }

    pub fn capacity(&self) -> usize {
        self.guard.len()
    }
}

impl RingBuffer {
    pub fn new(config: RingConfig) -> Self {
        let slots = (0..config.buffer_count)
            .map(|_| Mutex::new(vec![0u8; config.buffer_size].into_boxed_slice()))
            .collect();

        RingBuffer {
            slots,
            state: Mutex::new(RingState {
                write_index: 0,
                ready_packets: VecDeque::new(),
                ready_batches: VecDeque::new(),
                current_batch: Vec::new(),
                batch_start: None,
                next_batch_id: 0,
                pending: 0,
            }),
            data_ready: Condvar::new(),
            config,
        }
    }

    pub fn config(&self) -> &RingConfig {
        &self.config
    }

    /// Check out the slot at the current write index. Does not advance the
    /// index; that happens on commit.
    pub fn write_slot(&self) -> WriteSlot<'_> {
        let index = self.state.lock().unwrap().write_index;
        WriteSlot {
            guard: self.slots[index].lock().unwrap(),
        }
    }

    /// Commit `bytes_written` bytes of the checked-out slot as a new packet.
    ///
    /// On error nothing is enqueued and the write index stays put.
    pub fn commit(&self, slot: WriteSlot<'_>, bytes_written: usize) -> Result<DataPacket, RingError> {
        if bytes_written == 0 {
            return Err(RingError::EmptyCommit);
        }
        if bytes_written > slot.guard.len() {
            return Err(RingError::Oversize {
                bytes: bytes_written,
                capacity: slot.guard.len(),
            });
        }

        let data: Box<[u8]> = slot.guard[..bytes_written].into();
        drop(slot);

        let mut state = self.state.lock().unwrap();
        let now = Instant::now();

        if state.current_batch.is_empty() {
            state.next_batch_id = state.next_batch_id.wrapping_add(1);
            state.batch_start = Some(now);
        }

        let batch_id = state.next_batch_id;
        let position = state.current_batch.len() as u32 + 1;
        let packet = DataPacket::new(data.into(), batch_id, position);

        if self.config.batching {
            state.current_batch.push(packet.clone());

            let elapsed = state
                .batch_start
                .map(|start| now.duration_since(start))
                .unwrap_or_default();

            if state.current_batch.len() >= self.config.max_packets_per_batch
                || elapsed >= self.config.max_batch_interval
            {
                Self::close_current_batch(&mut state);
            }
        } else {
            state.ready_packets.push_back(packet.clone());
        }

        state.pending += 1;
        state.write_index = (state.write_index + 1) % self.config.buffer_count;
        drop(state);
        self.data_ready.notify_all();

        Ok(packet)
    }

    fn close_current_batch(state: &mut RingState) {
        if state.current_batch.is_empty() {
            return;
        }
        if let Some(last) = state.current_batch.last_mut() {
            last.is_batch_complete = true;
        }
        let batch = DataPacketBatch {
            batch_id: state.next_batch_id,
            packets: std::mem::take(&mut state.current_batch),
        };
        state.ready_batches.push_back(batch);
        state.batch_start = None;
    }

    /// Close the open batch if its time trigger has elapsed without a
    /// further commit. Called from the consumer wait loop.
    pub fn close_stale_batch(&self) {
        let mut state = self.state.lock().unwrap();
        if self.stale_locked(&state) {
            Self::close_current_batch(&mut state);
            drop(state);
            self.data_ready.notify_all();
        }
    }

    fn stale_locked(&self, state: &RingState) -> bool {
        match state.batch_start {
            Some(start) if !state.current_batch.is_empty() => {
                start.elapsed() >= self.config.max_batch_interval
            }
            _ => false,
        }
    }

    /// Block until a closed batch or loose packet is available, up to
    /// `timeout`. Batches are preferred over loose packets.
    pub fn wait_ready(&self, timeout: Duration) -> Option<ReadyData> {
        let mut state = self.state.lock().unwrap();

        if self.stale_locked(&state) {
            Self::close_current_batch(&mut state);
        }

        if state.ready_batches.is_empty() && state.ready_packets.is_empty() {
            let (next, _) = self.data_ready.wait_timeout(state, timeout).unwrap();
            state = next;
            if self.stale_locked(&state) {
                Self::close_current_batch(&mut state);
            }
        }

        if let Some(batch) = state.ready_batches.pop_front() {
            state.pending = state.pending.saturating_sub(batch.len());
            return Some(ReadyData::Batch(batch));
        }
        if let Some(packet) = state.ready_packets.pop_front() {
            state.pending = state.pending.saturating_sub(1);
            return Some(ReadyData::Packet(packet));
        }
        None
    }

    /// Non-blocking variant of [`wait_ready`](Self::wait_ready).
    pub fn try_take_ready(&self) -> Option<ReadyData> {
        self.wait_ready(Duration::ZERO)
    }

    /// Committed but unconsumed packets.
    pub fn pending_packets(&self) -> usize {
        self.state.lock().unwrap().pending
    }

    pub fn occupancy_level(&self) -> OccupancyLevel {
        let pending = self.pending_packets();
        let count = self.config.buffer_count;
        if pending * 100 >= count * CRITICAL_PERCENT {
            OccupancyLevel::Critical
        } else if pending * 100 >= count * WARNING_PERCENT {
            OccupancyLevel::Warning
        } else {
            OccupancyLevel::Normal
        }
    }

    /// Drop all queued data and rewind the write index.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.ready_packets.clear();
        state.ready_batches.clear();
        state.current_batch.clear();
        state.batch_start = None;
        state.write_index = 0;
        state.pending = 0;
        drop(state);
        self.data_ready.notify_all();
    }

    /// Wake any consumer blocked in [`wait_ready`](Self::wait_ready).
    pub fn notify(&self) {
        self.data_ready.notify_all();
    }
}
