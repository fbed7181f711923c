//! Bounded ring of command batches between a producer and a single consumer.
//!
//! Each flushed batch becomes one length-prefixed record. Records never straddle
//! the end of the ring: a producer that does not fit in the remaining tail
//! writes a wrap marker (or relies on implicit padding when fewer than 4 bytes
//! remain) and starts again at offset 0. `tail_reserve` hands out space to
//! concurrent producers and `tail_commit` publishes records in order.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::{CommandHandler, CommandSerializer};

const RECORD_ALIGN: usize = 4;
const WRAP_MARKER: u32 = 0xFFFF_FFFF;

fn align_up(v: usize, a: usize) -> usize {
    (v + (a - 1)) & !(a - 1)
}

/// Bytes one record with a `payload_len`-byte batch occupies.
pub fn record_size(payload_len: usize) -> usize {
    align_up(4 + payload_len, RECORD_ALIGN)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    Full,
    TooLarge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopError {
    Empty,
    /// A record length that cannot be valid.
    Corrupt,
}

#[derive(Debug)]
pub struct CommandRing {
    cap: u32,
    head: AtomicU32,
    tail_reserve: AtomicU32,
    tail_commit: AtomicU32,
    data: Box<[AtomicU8]>,
}

impl CommandRing {
    /// Returns `None` unless `capacity_bytes` is a non-zero multiple of 4 below 4 GiB.
    pub fn new(capacity_bytes: usize) -> Option<Self> {
        if capacity_bytes == 0
            || capacity_bytes % RECORD_ALIGN != 0
            || capacity_bytes >= u32::MAX as usize
        {
            return None;
        }
        Some(Self {
            cap: capacity_bytes as u32,
            head: AtomicU32::new(0),
            tail_reserve: AtomicU32::new(0),
            tail_commit: AtomicU32::new(0),
            data: (0..capacity_bytes).map(|_| AtomicU8::new(0)).collect(),
        })
    }

    pub fn capacity_bytes(&self) -> usize {
        self.cap as usize
    }

    /// Largest batch that can ever be pushed.
    pub fn max_payload_len(&self) -> usize {
        self.capacity_bytes() - 4
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail_commit.load(Ordering::Acquire)
    }

    pub fn try_push(&self, payload: &[u8]) -> Result<(), PushError> {
        let record = record_size(payload.len());
        if payload.len() > self.max_payload_len() || record > self.capacity_bytes() {
            return Err(PushError::TooLarge);
        }

        loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail_reserve.load(Ordering::Acquire);
            let used = tail.wrapping_sub(head);
            if used > self.cap {
                // Raced with the consumer moving `head`.
                continue;
            }
            let free = self.cap - used;

            let tail_index = (tail % self.cap) as usize;
            let remaining = self.capacity_bytes() - tail_index;
            let (padding, wrap_marker) = if remaining < 4 {
                (remaining, false)
            } else if remaining < record {
                (remaining, true)
            } else {
                (0, false)
            };

            let reserve = padding + record;
            if reserve as u32 > free {
                return Err(PushError::Full);
            }
            let new_tail = tail.wrapping_add(reserve as u32);
            if self
                .tail_reserve
                .compare_exchange(tail, new_tail, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }

            if wrap_marker {
                self.write_u32(tail_index, WRAP_MARKER);
            }
            let start = (tail.wrapping_add(padding as u32) % self.cap) as usize;
            self.write_u32(start, payload.len() as u32);
            for (slot, byte) in self.data[start + 4..start + 4 + payload.len()]
                .iter()
                .zip(payload)
            {
                slot.store(*byte, Ordering::Relaxed);
            }

            while self.tail_commit.load(Ordering::Acquire) != tail {
                std::hint::spin_loop();
            }
            self.tail_commit.store(new_tail, Ordering::Release);
            return Ok(());
        }
    }

    pub fn try_pop(&self) -> Result<Vec<u8>, PopError> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail_commit.load(Ordering::Acquire);
            if head == tail {
                return Err(PopError::Empty);
            }

            let head_index = (head % self.cap) as usize;
            let remaining = self.capacity_bytes() - head_index;
            if remaining < 4 {
                self.head
                    .store(head.wrapping_add(remaining as u32), Ordering::Release);
                continue;
            }
            let len = self.read_u32(head_index);
            if len == WRAP_MARKER {
                self.head
                    .store(head.wrapping_add(remaining as u32), Ordering::Release);
                continue;
            }

            let len = len as usize;
            let total = record_size(len);
            if total > remaining || tail.wrapping_sub(head) < total as u32 {
                return Err(PopError::Corrupt);
            }
            let out = self.data[head_index + 4..head_index + 4 + len]
                .iter()
                .map(|b| b.load(Ordering::Relaxed))
                .collect();
            self.head
                .store(head.wrapping_add(total as u32), Ordering::Release);
            return Ok(out);
        }
    }

    /// Pops every committed batch into `handler`. Returns the number of batches
    /// handled, or `None` if a batch was rejected or the ring is corrupt.
    pub fn drain_into(&self, handler: &mut impl CommandHandler) -> Option<usize> {
        let mut handled = 0;
        loop {
            match self.try_pop() {
                Ok(batch) => {
                    handler.handle_commands(&batch)?;
                    handled += 1;
                }
                Err(PopError::Empty) => return Some(handled),
                Err(PopError::Corrupt) => {
                    warn!("command ring is corrupt");
                    return None;
                }
            }
        }
    }

    fn write_u32(&self, index: usize, v: u32) {
        for (slot, byte) in self.data[index..index + 4].iter().zip(v.to_le_bytes()) {
            slot.store(byte, Ordering::Relaxed);
        }
    }

    fn read_u32(&self, index: usize) -> u32 {
        let mut bytes = [0u8; 4];
        for (out, slot) in bytes.iter_mut().zip(&self.data[index..index + 4]) {
            *out = slot.load(Ordering::Relaxed);
        }
        u32::from_le_bytes(bytes)
    }
}

/// [`CommandSerializer`] that batches packets locally and pushes each flushed
/// batch into a [`CommandRing`].
#[derive(Debug)]
pub struct RingSerializer {
    ring: Arc<CommandRing>,
    pending: Vec<u8>,
    max_allocation_size: usize,
}

impl RingSerializer {
    /// `max_allocation_size` is clamped so that a flushed batch always fits the ring.
    pub fn new(ring: Arc<CommandRing>, max_allocation_size: usize) -> Self {
        let max_allocation_size = max_allocation_size.min(ring.max_payload_len()) & !3;
        Self {
            ring,
            pending: Vec::new(),
            max_allocation_size,
        }
    }

    pub fn ring(&self) -> &Arc<CommandRing> {
        &self.ring
    }

    /// Bytes serialized but not yet flushed.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

impl CommandSerializer for RingSerializer {
    fn get_cmd_space(&mut self, size: usize) -> Option<&mut [u8]> {
        if size > self.max_allocation_size {
            return None;
        }
        if self.pending.len() + size > self.max_allocation_size && !self.flush() {
            return None;
        }
        let start = self.pending.len();
        self.pending.resize(start + size, 0);
        Some(&mut self.pending[start..])
    }

    /// Fails, keeping the batch, while the consumer has not made room.
    fn flush(&mut self) -> bool {
        if self.pending.is_empty() {
            return true;
        }
        match self.ring.try_push(&self.pending) {
            Ok(()) => {
                self.pending.clear();
                true
            }
            Err(_) => false,
        }
    }

    fn maximum_allocation_size(&self) -> usize {
        self.max_allocation_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;

    struct Recorder(Vec<Vec<u8>>);

    impl CommandHandler for Recorder {
        fn handle_commands<'a>(&mut self, commands: &'a [u8]) -> Option<&'a [u8]> {
            self.0.push(commands.to_vec());
            Some(&commands[commands.len()..])
        }
    }

    #[test]
    fn rejects_unusable_capacities() {
        assert!(CommandRing::new(0).is_none());
        assert!(CommandRing::new(6).is_none());
        assert!(CommandRing::new(64).is_some());
    }

    #[test]
    fn wraps_with_marker_and_padding() {
        let ring = CommandRing::new(32).unwrap();
        ring.try_push(&[1; 10]).unwrap();
        assert_eq!(ring.try_pop().unwrap(), vec![1; 10]);
        ring.try_push(&[2; 8]).unwrap();
        // 16 + 12 = 28 used; a 12-byte record does not fit in the last 4 bytes.
        ring.try_push(&[3; 8]).unwrap();
        assert_eq!(ring.try_pop().unwrap(), vec![2; 8]);
        assert_eq!(ring.try_pop().unwrap(), vec![3; 8]);
        assert_eq!(ring.try_pop(), Err(PopError::Empty));
        assert_eq!(ring.try_push(&[0; 29]), Err(PushError::TooLarge));
    }

    #[test]
    fn serializer_flushes_batches_into_the_ring() {
        let ring = Arc::new(CommandRing::new(256).unwrap());
        let mut serializer = RingSerializer::new(Arc::clone(&ring), 1024);
        assert_eq!(serializer.maximum_allocation_size(), 252);

        serializer.get_cmd_space(8).unwrap().copy_from_slice(&[7; 8]);
        serializer.get_cmd_space(4).unwrap().copy_from_slice(&[9; 4]);
        assert!(ring.is_empty());
        assert!(serializer.flush());

        let mut recorder = Recorder(Vec::new());
        assert_eq!(ring.drain_into(&mut recorder), Some(1));
        assert_eq!(recorder.0, vec![[vec![7; 8], vec![9; 4]].concat()]);
    }

    #[test]
    fn producers_on_other_threads_keep_order_per_producer() {
        let ring = Arc::new(CommandRing::new(128).unwrap());
        let producers: Vec<_> = (0..3u8)
            .map(|p| {
                let ring = Arc::clone(&ring);
                std::thread::spawn(move || {
                    for i in 0..200u8 {
                        while ring.try_push(&[p, i]).is_err() {
                            std::thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        let mut next = [0u8; 3];
        let mut received = 0;
        while received < 600 {
            match ring.try_pop() {
                Ok(msg) => {
                    let p = msg[0] as usize;
                    assert_eq!(msg[1], next[p]);
                    next[p] = next[p].wrapping_add(1);
                    received += 1;
                }
                Err(PopError::Empty) => std::thread::yield_now(),
                Err(PopError::Corrupt) => panic!("corrupt ring"),
            }
        }
        for producer in producers {
            producer.join().unwrap();
        }
    }

    proptest! {
        #[test]
        fn matches_a_fifo_model(ops in proptest::collection::vec((any::<bool>(), 0usize..40), 1..300)) {
            let ring = CommandRing::new(96).unwrap();
            let mut model = VecDeque::new();
            for (push, len) in ops {
                if push {
                    let msg = vec![len as u8; len];
                    if ring.try_push(&msg).is_ok() {
                        model.push_back(msg);
                    }
                } else {
                    match ring.try_pop() {
                        Ok(msg) => prop_assert_eq!(Some(msg), model.pop_front()),
                        Err(PopError::Empty) => prop_assert!(model.is_empty()),
                        Err(PopError::Corrupt) => prop_assert!(false, "corrupt"),
                    }
                }
            }
        }
    }
}
