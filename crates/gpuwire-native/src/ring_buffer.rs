//! Circular sub-allocator over a fixed byte range.
//!
//! Allocations are accumulated into a running request until [`RingBuffer::track`]
//! attributes them to a serial. [`RingBuffer::tick`] frees every request whose
//! serial has completed. The ring only keeps offsets; the memory lives elsewhere.

use std::collections::VecDeque;

use crate::ExecutionSerial;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Request {
    end_offset: u64,
    size: u64,
    serial: ExecutionSerial,
}

#[derive(Debug)]
pub struct RingBuffer {
    capacity: u64,
    used_start_offset: u64,
    used_end_offset: u64,
    /// Bytes not yet reclaimed, including tail bytes skipped by a wrap.
    used_size: u64,
    current_request_size: u64,
    in_flight: VecDeque<Request>,
}

impl RingBuffer {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            used_start_offset: 0,
            used_end_offset: 0,
            used_size: 0,
            current_request_size: 0,
            in_flight: VecDeque::new(),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn used_size(&self) -> u64 {
        self.used_size
    }

    pub fn is_empty(&self) -> bool {
        self.used_size == 0
    }

    pub fn is_full(&self) -> bool {
        self.used_size >= self.capacity
    }

    /// Returns the offset of `size` free bytes, or `None` if they do not fit.
    pub fn sub_allocate(&mut self, size: u64) -> Option<u64> {
        if self.used_size >= self.capacity || size > self.capacity {
            return None;
        }

        if self.used_start_offset <= self.used_end_offset {
            // Live region does not wrap: try the tail, then the front.
            let tail_end = self
                .used_end_offset
                .checked_add(size)
                .filter(|end| *end <= self.capacity);
            if let Some(end) = tail_end {
                let offset = self.used_end_offset;
                self.used_end_offset = end;
                self.charge(size);
                return Some(offset);
            }
            if size <= self.used_start_offset {
                // The skipped tail stays charged to this request until it completes.
                let wasted = self.capacity - self.used_end_offset;
                let charged = wasted.checked_add(size)?;
                self.used_end_offset = size;
                self.charge(charged);
                return Some(0);
            }
            return None;
        }

        let end = self.used_end_offset.checked_add(size)?;
        if end <= self.used_start_offset {
            let offset = self.used_end_offset;
            self.used_end_offset = end;
            self.charge(size);
            return Some(offset);
        }
        None
    }

    fn charge(&mut self, size: u64) {
        self.used_size += size;
        self.current_request_size += size;
    }

    /// Attributes everything allocated since the previous call to `serial`.
    pub fn track(&mut self, serial: ExecutionSerial) {
        if self.current_request_size == 0 {
            return;
        }
        self.in_flight.push_back(Request {
            end_offset: self.used_end_offset,
            size: self.current_request_size,
            serial,
        });
        self.current_request_size = 0;
    }

    /// Tracks outstanding allocations under `pending`, then frees every request
    /// whose serial is at or before `completed`.
    pub fn tick(&mut self, completed: ExecutionSerial, pending: ExecutionSerial) {
        self.track(pending);

        while let Some(request) = self.in_flight.front().copied() {
            if request.serial > completed {
                break;
            }
            self.used_start_offset = request.end_offset;
            self.used_size -= request.size;
            self.in_flight.pop_front();
        }
    }
}
