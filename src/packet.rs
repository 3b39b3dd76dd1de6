//! Reusable fixed-capacity audio packets and the FIFO queue that owns them.
//!
//! A [`Packet`] is a byte buffer with two cursors: `size` counts the bytes the
//! producer actually filled, `used` counts the bytes already consumed by the
//! device. `used <= size <= capacity` holds at all times. A packet whose
//! `used == size` is fully consumed and is released by the queue.
//!
//! [`PacketQueue`] is the in-memory buffer shared by the push adapter and the
//! buffered streaming backend: packets transfer ownership on push and are
//! freed on pop.

use std::collections::VecDeque;

/// A fixed-capacity byte buffer holding audio awaiting playback.
pub struct Packet {
    data: Box<[u8]>,
    size: usize,
    used: usize,
}

impl Packet {
    /// Create an empty packet with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            size: 0,
            used: 0,
        }
    }

    /// Create a packet holding a copy of `data`, already marked filled.
    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            data: data.to_vec().into_boxed_slice(),
            size: data.len(),
            used: 0,
        }
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes filled by the producer.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes already consumed by the device.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Bytes filled but not yet consumed.
    pub fn remaining(&self) -> usize {
        self.size - self.used
    }

    /// True once every filled byte has been consumed.
    pub fn is_consumed(&self) -> bool {
        self.used == self.size
    }

    /// The full writable buffer, handed to the producer to fill.
    pub fn writable(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Record how many bytes the producer filled and rewind the read cursor.
    ///
    /// `size` is clamped to the capacity so a misbehaving producer cannot
    /// claim bytes that do not exist.
    pub fn set_size(&mut self, size: usize) {
        self.size = size.min(self.data.len());
        self.used = 0;
    }

    /// The filled-but-unconsumed span.
    pub fn unread(&self) -> &[u8] {
        &self.data[self.used..self.size]
    }

    /// Advance the consumed cursor by `n` bytes.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.remaining());
        self.used = (self.used + n).min(self.size);
    }
}

/// FIFO of packets plus a running count of unconsumed bytes.
#[derive(Default)]
pub struct PacketQueue {
    packets: VecDeque<Packet>,
    buffered_bytes: usize,
}

impl PacketQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a packet; the queue takes ownership.
    ///
    /// Empty packets (nothing filled, or already fully consumed) are dropped
    /// rather than queued.
    pub fn push(&mut self, packet: Packet) {
        let remaining = packet.remaining();
        if remaining == 0 {
            return;
        }
        self.buffered_bytes += remaining;
        self.packets.push_back(packet);
    }

    /// Sum of unconsumed bytes across all queued packets.
    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    /// True when no unconsumed bytes remain.
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Number of packets currently queued.
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    /// The head packet, if any.
    pub fn front(&self) -> Option<&Packet> {
        self.packets.front()
    }

    /// Copy bytes from the front of the queue into `dest`, in FIFO order.
    ///
    /// Stops when `dest` is full or the queue empties; returns the number of
    /// bytes copied. Partially consumed packets stay at the head with their
    /// `used` cursor advanced; fully consumed packets are popped and freed.
    pub fn read_into(&mut self, dest: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < dest.len() {
            let Some(front) = self.packets.front_mut() else {
                break;
            };
            let unread = front.unread();
            let n = unread.len().min(dest.len() - copied);
            dest[copied..copied + n].copy_from_slice(&unread[..n]);
            front.consume(n);
            copied += n;
            if front.is_consumed() {
                self.packets.pop_front();
            }
        }
        self.buffered_bytes -= copied;
        copied
    }

    /// Advance the head packet's consumed cursor by `n` bytes, popping it
    /// once fully consumed. Used by the device-write path, which reads from
    /// the head without copying through an intermediate buffer.
    pub fn consume_front(&mut self, n: usize) {
        let Some(front) = self.packets.front_mut() else {
            return;
        };
        let n = n.min(front.remaining());
        front.consume(n);
        self.buffered_bytes -= n;
        if front.is_consumed() {
            self.packets.pop_front();
        }
    }

    /// Release every queued packet.
    pub fn clear(&mut self) {
        self.packets.clear();
        self.buffered_bytes = 0;
    }
}
