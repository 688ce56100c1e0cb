//! Single-producer, single-consumer event ring over shared memory.
//!
//! Indices run modulo the capacity fixed at creation. One slot is always
//! left empty so that `front == back` means empty and
//! `(back + 1) % capacity == front` means full; a ring therefore holds at
//! most `capacity - 1` records.
//!
//! Each side keeps a private copy of the index it owns and only ever
//! publishes it, so a peer overwriting that index on the page has no effect.
//! The index owned by the peer is read from the page on every operation and
//! is where trust matters: the trusted side refuses an out-of-range value,
//! the untrusted side reduces it modulo the capacity.

use std::ptr::NonNull;
use std::sync::atomic::Ordering;

use shmif_core::RawEvent;

use crate::layout::RingHeader;

/// How much a ring view believes the peer-owned index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trust {
    /// Server side: a peer index outside `[0, capacity)` is a protocol
    /// violation.
    Trusted,
    /// Client side: indices are reduced modulo the capacity.
    Untrusted,
}

/// Errors from ring operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    /// Ring is full.
    Full,
    /// A peer-owned index pointed outside the ring.
    IndexOutOfBounds { index: u32, capacity: u32 },
}

impl std::fmt::Display for RingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "ring is full"),
            Self::IndexOutOfBounds { index, capacity } => {
                write!(f, "ring index {} outside capacity {}", index, capacity)
            }
        }
    }
}

impl std::error::Error for RingError {}

/// A view into one event ring in shared memory.
pub struct EventRing {
    header: NonNull<RingHeader>,
    slots: NonNull<RawEvent>,
    capacity: u32,
    trust: Trust,
}

// SAFETY: the view only touches the ring through atomics and volatile
// copies of whole records; the SPSC discipline is upheld by the owners of
// the local indices.
unsafe impl Send for EventRing {}
unsafe impl Sync for EventRing {}

impl EventRing {
    /// Create a ring view from raw pointers.
    ///
    /// `capacity` is the caller's own record of the ring size, never a value
    /// read back from a peer-writable location on the trusted side.
    ///
    /// # Safety
    ///
    /// - `header` must point to an initialized `RingHeader`.
    /// - `slots` must point to `capacity` records.
    /// - The memory must stay mapped for the lifetime of this view.
    pub unsafe fn from_raw(
        header: *mut RingHeader,
        slots: *mut RawEvent,
        capacity: u32,
        trust: Trust,
    ) -> Self {
        debug_assert!(capacity >= 2);
        Self {
            header: unsafe { NonNull::new_unchecked(header) },
            slots: unsafe { NonNull::new_unchecked(slots) },
            capacity,
            trust,
        }
    }

    #[inline]
    fn header(&self) -> &RingHeader {
        // SAFETY: valid for our lifetime per `from_raw`.
        unsafe { self.header.as_ref() }
    }

    /// The only way to reach a slot.
    #[inline]
    fn slot(&self, index: u32) -> Result<*mut RawEvent, RingError> {
        if index >= self.capacity {
            return Err(RingError::IndexOutOfBounds {
                index,
                capacity: self.capacity,
            });
        }
        // SAFETY: index < capacity and `slots` spans `capacity` records.
        Ok(unsafe { self.slots.as_ptr().add(index as usize) })
    }

    #[inline]
    fn peer_index(&self, raw: u32) -> Result<u32, RingError> {
        match self.trust {
            Trust::Trusted if raw >= self.capacity => Err(RingError::IndexOutOfBounds {
                index: raw,
                capacity: self.capacity,
            }),
            Trust::Trusted => Ok(raw),
            Trust::Untrusted => Ok(raw % self.capacity),
        }
    }

    #[inline]
    fn advance(&self, index: u32) -> u32 {
        ((index as u64 + 1) % self.capacity as u64) as u32
    }

    #[inline]
    fn used(&self, front: u32, back: u32) -> u32 {
        ((back as u64 + self.capacity as u64 - front as u64) % self.capacity as u64) as u32
    }

    /// Enqueue one record (producer side).
    ///
    /// `back` is the producer's private index. On success it is advanced and
    /// published, and the number of records that still fit is returned.
    pub fn try_push(&self, back: &mut u32, event: &RawEvent) -> Result<u32, RingError> {
        let front = self.peer_index(self.header().front.load(Ordering::Acquire))?;
        let next = self.advance(*back);
        if next == front {
            return Err(RingError::Full);
        }

        let slot = self.slot(*back)?;
        // SAFETY: the slot is in bounds and not visible to the consumer
        // until `back` is published below.
        unsafe { std::ptr::write_volatile(slot, *event) };

        *back = next;
        self.header().back.store(next, Ordering::Release);
        Ok(self.capacity - 1 - self.used(front, next))
    }

    /// Records that still fit behind the producer's `back`.
    pub fn free_slots(&self, back: u32) -> Result<u32, RingError> {
        let front = self.peer_index(self.header().front.load(Ordering::Acquire))?;
        Ok(self.capacity - 1 - self.used(front, back))
    }

    /// Dequeue one record (consumer side). Never blocks.
    pub fn pop(&self, front: &mut u32) -> Result<Option<RawEvent>, RingError> {
        let back = self.peer_index(self.header().back.load(Ordering::Acquire))?;
        if *front == back {
            return Ok(None);
        }

        let slot = self.slot(*front)?;
        // SAFETY: the producer published this slot before advancing `back`.
        let event = unsafe { std::ptr::read_volatile(slot) };

        *front = self.advance(*front);
        self.header().front.store(*front, Ordering::Release);
        Ok(Some(event))
    }

    /// Whether any queued record (from `front` on) satisfies `pred`, without
    /// consuming anything.
    pub fn any_pending(
        &self,
        front: u32,
        mut pred: impl FnMut(&RawEvent) -> bool,
    ) -> Result<bool, RingError> {
        let back = self.peer_index(self.header().back.load(Ordering::Acquire))?;
        let mut cursor = front;
        while cursor != back {
            let slot = self.slot(cursor)?;
            // SAFETY: slots between front and back are published.
            let event = unsafe { std::ptr::read_volatile(slot) };
            if pred(&event) {
                return Ok(true);
            }
            cursor = self.advance(cursor);
        }
        Ok(false)
    }

    /// Current value of the index the consumer publishes.
    pub fn published_front(&self) -> u32 {
        self.header().front.load(Ordering::Acquire) % self.capacity
    }

    /// Current value of the index the producer publishes.
    pub fn published_back(&self) -> u32 {
        self.header().back.load(Ordering::Acquire) % self.capacity
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Snapshot for diagnostics.
    pub fn status(&self) -> RingStatus {
        let front = self.header().front.load(Ordering::Acquire);
        let back = self.header().back.load(Ordering::Acquire);
        RingStatus {
            front,
            back,
            capacity: self.capacity,
            len: self.used(front % self.capacity, back % self.capacity),
        }
    }
}

/// Status snapshot of an event ring.
#[derive(Debug, Clone, Copy)]
pub struct RingStatus {
    pub front: u32,
    pub back: u32,
    pub capacity: u32,
    pub len: u32,
}

impl std::fmt::Display for RingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "front={} back={} len={}/{}",
            self.front,
            self.back,
            self.len,
            self.capacity.saturating_sub(1)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shmif_core::{Event, ExternalEvent, Message};

    /// Heap-backed ring storage with one view per side.
    struct HeapRing {
        header: Box<RingHeader>,
        slots: Vec<RawEvent>,
    }

    impl HeapRing {
        fn new(capacity: u32) -> Self {
            Self {
                header: Box::new(RingHeader::new(capacity)),
                slots: vec![RawEvent::zeroed(); capacity as usize],
            }
        }

        fn view(&mut self, trust: Trust) -> EventRing {
            let capacity = self.slots.len() as u32;
            // SAFETY: both allocations outlive every view in these tests.
            unsafe {
                EventRing::from_raw(
                    &mut *self.header as *mut RingHeader,
                    self.slots.as_mut_ptr(),
                    capacity,
                    trust,
                )
            }
        }

        fn header(&self) -> &RingHeader {
            &self.header
        }
    }

    fn record(n: u32) -> RawEvent {
        Event::External(ExternalEvent::Message {
            text: Message::truncated(&n.to_string()),
        })
        .encode()
    }

    #[test]
    fn fifo_order() {
        let mut storage = HeapRing::new(16);
        let ring = storage.view(Trust::Untrusted);
        let (mut back, mut front) = (0, 0);

        for n in 0..10 {
            ring.try_push(&mut back, &record(n)).unwrap();
        }
        for n in 0..10 {
            assert_eq!(ring.pop(&mut front).unwrap(), Some(record(n)));
        }
        assert_eq!(ring.pop(&mut front).unwrap(), None);
    }

    #[test]
    fn sacrificial_slot_caps_at_capacity_minus_one() {
        let mut storage = HeapRing::new(8);
        let ring = storage.view(Trust::Trusted);
        let mut back = 0;

        for n in 0..7 {
            let free = ring.try_push(&mut back, &record(n)).unwrap();
            assert_eq!(free, 6 - n);
        }
        assert_eq!(ring.try_push(&mut back, &record(7)), Err(RingError::Full));
        assert_eq!(ring.status().len, 7);
    }

    #[test]
    fn wraparound_preserves_order() {
        let mut storage = HeapRing::new(8);
        let ring = storage.view(Trust::Trusted);
        let (mut back, mut front) = (0, 0);

        for n in 0..20 {
            ring.try_push(&mut back, &record(n)).unwrap();
            assert_eq!(ring.pop(&mut front).unwrap(), Some(record(n)));
        }
        assert_eq!(ring.pop(&mut front).unwrap(), None);
        assert_eq!(front, 20 % 8);
    }

    #[test]
    fn trusted_side_rejects_hostile_peer_index() {
        let mut storage = HeapRing::new(8);
        storage.header().back.store(99, Ordering::Release);
        let ring = storage.view(Trust::Trusted);
        let mut front = 0;
        assert_eq!(
            ring.pop(&mut front),
            Err(RingError::IndexOutOfBounds {
                index: 99,
                capacity: 8
            })
        );
        assert_eq!(front, 0);

        storage.header().front.store(u32::MAX, Ordering::Release);
        let ring = storage.view(Trust::Trusted);
        let mut back = 0;
        assert!(matches!(
            ring.try_push(&mut back, &record(1)),
            Err(RingError::IndexOutOfBounds { .. })
        ));
    }

    #[test]
    fn untrusted_side_reduces_peer_index() {
        let mut storage = HeapRing::new(8);
        // 11 % 8 == 3: three records appear queued.
        storage.header().back.store(11, Ordering::Release);
        let ring = storage.view(Trust::Untrusted);
        let mut front = 0;
        for _ in 0..3 {
            assert!(ring.pop(&mut front).unwrap().is_some());
        }
        assert_eq!(ring.pop(&mut front).unwrap(), None);
    }

    #[test]
    fn own_index_on_page_is_ignored() {
        let mut storage = HeapRing::new(8);
        let ring = storage.view(Trust::Trusted);
        let (mut back, mut front) = (0, 0);
        ring.try_push(&mut back, &record(1)).unwrap();

        // A peer scribbling over the producer's published index cannot make
        // the producer reuse or skip a slot.
        storage.header().back.store(5, Ordering::Release);
        let ring = storage.view(Trust::Trusted);
        ring.try_push(&mut back, &record(2)).unwrap();
        assert_eq!(back, 2);
        assert_eq!(ring.pop(&mut front).unwrap(), Some(record(1)));
        assert_eq!(ring.pop(&mut front).unwrap(), Some(record(2)));
    }

    #[test]
    fn any_pending_scans_without_consuming() {
        let mut storage = HeapRing::new(8);
        let ring = storage.view(Trust::Untrusted);
        let (mut back, front) = (0, 0);
        ring.try_push(&mut back, &record(1)).unwrap();
        ring.try_push(&mut back, &record(2)).unwrap();

        assert!(ring.any_pending(front, |ev| *ev == record(2)).unwrap());
        assert!(!ring.any_pending(front, |ev| *ev == record(3)).unwrap());
        assert_eq!(ring.status().len, 2);
    }
}
