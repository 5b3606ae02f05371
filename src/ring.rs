//! Single-producer/single-consumer ring used by the message bridge.
//!
//! A thin wrapper over [`ringbuf::HeapRb`]: storage for `capacity` items is allocated
//! when the ring is created and both halves are wait-free afterwards. The writer and
//! reader halves are separate types so each side of the bridge can own exactly one.

use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

pub struct RingChannel<T> {
    ring: HeapRb<T>,
    capacity: usize,
}

impl<T> RingChannel<T> {
    /// Creates a ring holding at most `capacity` items (minimum 1).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: HeapRb::new(capacity),
            capacity,
        }
    }

    pub fn split(self) -> (RingWriter<T>, RingReader<T>) {
        let (producer, consumer) = self.ring.split();
        (
            RingWriter {
                producer,
                capacity: self.capacity,
            },
            RingReader {
                consumer,
                capacity: self.capacity,
            },
        )
    }
}

/// Producer half. Only one thread may write at a time.
pub struct RingWriter<T> {
    producer: HeapProd<T>,
    capacity: usize,
}

impl<T> RingWriter<T> {
    /// Reserves a slot and commits `item` into it; returns the item if no slot is free.
    pub fn push(&mut self, item: T) -> Result<(), T> {
        self.producer.try_push(item)
    }

    pub fn vacant_len(&self) -> usize {
        self.producer.vacant_len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Consumer half. Only one thread may read at a time.
pub struct RingReader<T> {
    consumer: HeapCons<T>,
    capacity: usize,
}

impl<T> RingReader<T> {
    /// Takes the oldest fully-written item.
    pub fn pop(&mut self) -> Option<T> {
        self.consumer.try_pop()
    }

    pub fn occupied_len(&self) -> usize {
        self.consumer.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.occupied_len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
