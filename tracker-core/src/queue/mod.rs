//! Bounded multi-producer / single-consumer event queue.
//!
//! Producers may run in interrupt context, so nothing here blocks, allocates,
//! or spins on another party. Storage and ordering are kept apart:
//!
//! * a pool of `N` event slots, each claimed with one `free -> allocated`
//!   compare-and-swap, so two producers can never own the same slot;
//! * a ring of `N` slot indices that [`SlotGrant::commit`] publishes into,
//!   with a per-cell sequence number guarding each position.
//!
//! The consumer reads the index ring, so events come out in the order their
//! commits were published. A producer that allocates and then stalls holds a
//! slot but blocks nobody. Targets without native CAS get it from
//! `portable-atomic`'s critical-section fallback.

use core::cell::UnsafeCell;
use core::fmt;
use core::mem::MaybeUninit;

use portable_atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicUsize, Ordering};

use crate::event::Event;

const FREE: u8 = 0;
const ALLOCATED: u8 = 1;
const COMMITTED: u8 = 2;

/// Ownership tag of a queue slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SlotState {
    Free,
    Allocated,
    Committed,
}

impl SlotState {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            ALLOCATED => SlotState::Allocated,
            COMMITTED => SlotState::Committed,
            _ => SlotState::Free,
        }
    }
}

/// Returned when an event could not be queued; hands the event back.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct QueueFull(pub Event);

impl QueueFull {
    /// Recovers the rejected event.
    #[must_use]
    pub fn into_event(self) -> Event {
        self.0
    }
}

impl fmt::Display for QueueFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event queue full, dropped {}", self.0.kind())
    }
}

/// Anything the control plane can post events into.
pub trait EventSink {
    /// Attempts to publish an event without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`QueueFull`] carrying the event when no slot is available.
    fn post(&self, event: Event) -> Result<(), QueueFull>;
}

struct Slot {
    state: AtomicU8,
    event: UnsafeCell<MaybeUninit<Event>>,
}

impl Slot {
    const fn new() -> Self {
        Self {
            state: AtomicU8::new(FREE),
            event: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

/// One position of the publish ring.
///
/// `sequence == position` means the cell is writable for that position,
/// `sequence == position + 1` means it holds a published slot index.
struct RingCell {
    sequence: AtomicUsize,
    index: AtomicUsize,
}

/// Fixed-capacity queue of [`Event`]s.
///
/// `N` must be a power of two so the free-running positions stay consistent
/// across integer wrap-around.
pub struct EventQueue<const N: usize> {
    slots: [Slot; N],
    ring: [RingCell; N],
    /// Where the next slot search starts.
    hint: AtomicUsize,
    publish: AtomicUsize,
    consume: AtomicUsize,
    consuming: AtomicBool,
    dropped: AtomicU32,
}

// SAFETY: a slot's payload is written only by the producer whose CAS moved it
// from `FREE` to `ALLOCATED`, and read only by the consumer after it observed
// the slot's index published in the ring with acquire ordering. The slot goes
// back to `FREE` only after that read. `consuming` keeps a second consumer out
// of the ring. `Event` holds plain data and is `Send`.
unsafe impl<const N: usize> Sync for EventQueue<N> {}

impl<const N: usize> EventQueue<N> {
    const MASK: usize = {
        assert!(N.is_power_of_two(), "event queue capacity must be a power of two");
        N - 1
    };

    /// Creates an empty queue; usable in `static` items.
    #[must_use]
    pub const fn new() -> Self {
        let mut ring = [const {
            RingCell {
                sequence: AtomicUsize::new(0),
                index: AtomicUsize::new(0),
            }
        }; N];
        let mut position = 0;
        while position < N {
            ring[position] = RingCell {
                sequence: AtomicUsize::new(position),
                index: AtomicUsize::new(0),
            };
            position += 1;
        }
        Self {
            slots: [const { Slot::new() }; N],
            ring,
            hint: AtomicUsize::new(0),
            publish: AtomicUsize::new(0),
            consume: AtomicUsize::new(0),
            consuming: AtomicBool::new(false),
            dropped: AtomicU32::new(0),
        }
    }

    /// Total number of slots.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Reserves a free slot for writing, or `None` when every slot is taken.
    ///
    /// Looks at each slot at most once.
    pub fn allocate(&self) -> Option<SlotGrant<'_, N>> {
        let start = self.hint.load(Ordering::Relaxed);
        for offset in 0..N {
            let index = start.wrapping_add(offset) & Self::MASK;
            let claimed = self.slots[index]
                .state
                .compare_exchange(FREE, ALLOCATED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok();
            if claimed {
                self.hint.store(index.wrapping_add(1), Ordering::Relaxed);
                return Some(SlotGrant {
                    queue: self,
                    index,
                    open: true,
                });
            }
        }
        None
    }

    /// Appends `index` to the publish ring.
    ///
    /// At most `N` slots exist, so the ring always has a writable cell for the
    /// position this call wins.
    fn publish(&self, index: usize) {
        let mut position = self.publish.load(Ordering::Relaxed);
        loop {
            let cell = &self.ring[position & Self::MASK];
            let sequence = cell.sequence.load(Ordering::Acquire);
            if sequence == position {
                match self.publish.compare_exchange_weak(
                    position,
                    position.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        cell.index.store(index, Ordering::Relaxed);
                        cell.sequence
                            .store(position.wrapping_add(1), Ordering::Release);
                        return;
                    }
                    Err(current) => position = current,
                }
            } else {
                position = self.publish.load(Ordering::Relaxed);
            }
        }
    }

    /// Pops the oldest committed event and frees its slot.
    ///
    /// Returns `None` when nothing is committed, or when another consumer is
    /// already inside `dequeue`.
    pub fn dequeue(&self) -> Option<Event> {
        if self.consuming.swap(true, Ordering::Acquire) {
            return None;
        }

        let position = self.consume.load(Ordering::Relaxed);
        let cell = &self.ring[position & Self::MASK];
        let event = if cell.sequence.load(Ordering::Acquire) == position.wrapping_add(1) {
            let index = cell.index.load(Ordering::Relaxed);
            let slot = &self.slots[index];
            // SAFETY: the index was published with release ordering after the
            // payload was fully written, and only this consumer reads the slot
            // before handing it back with `FREE`.
            let event = unsafe { (*slot.event.get()).assume_init_read() };
            cell.sequence
                .store(position.wrapping_add(N), Ordering::Release);
            self.consume
                .store(position.wrapping_add(1), Ordering::Relaxed);
            slot.state.store(FREE, Ordering::Release);
            Some(event)
        } else {
            None
        };

        self.consuming.store(false, Ordering::Release);
        event
    }

    /// Allocates and commits in one step, counting the drop on failure.
    ///
    /// # Errors
    ///
    /// Returns [`QueueFull`] carrying the event when every slot is taken.
    pub fn post(&self, event: Event) -> Result<(), QueueFull> {
        match self.allocate() {
            Some(grant) => {
                grant.commit(event);
                Ok(())
            }
            None => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(QueueFull(event))
            }
        }
    }

    /// Number of events rejected by [`EventQueue::post`] since boot.
    #[must_use]
    pub fn dropped(&self) -> u32 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Approximate number of committed events waiting for the consumer.
    #[must_use]
    pub fn len(&self) -> usize {
        let published = self.publish.load(Ordering::Relaxed);
        let consumed = self.consume.load(Ordering::Relaxed);
        published.wrapping_sub(consumed).min(N)
    }

    /// Returns `true` when no committed event is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ownership tag of the slot at `index`, for diagnostics.
    #[must_use]
    pub fn slot_state(&self, index: usize) -> SlotState {
        SlotState::from_raw(self.slots[index & Self::MASK].state.load(Ordering::Acquire))
    }
}

impl<const N: usize> Default for EventQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Drop for EventQueue<N> {
    fn drop(&mut self) {
        while self.dequeue().is_some() {}
    }
}

impl<const N: usize> EventSink for EventQueue<N> {
    fn post(&self, event: Event) -> Result<(), QueueFull> {
        EventQueue::post(self, event)
    }
}

/// Exclusive write access to one allocated slot.
///
/// Dropping a grant without committing releases the slot.
#[must_use = "an allocated slot must be committed or released"]
pub struct SlotGrant<'q, const N: usize> {
    queue: &'q EventQueue<N>,
    index: usize,
    open: bool,
}

impl<const N: usize> SlotGrant<'_, N> {
    /// Slot index inside the pool.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Writes the event and publishes it to the consumer.
    pub fn commit(mut self, event: Event) {
        let slot = &self.queue.slots[self.index];
        // SAFETY: this grant won the `FREE -> ALLOCATED` CAS for the slot and
        // the consumer cannot see it until the index is published below.
        unsafe { (*slot.event.get()).write(event) };
        slot.state.store(COMMITTED, Ordering::Relaxed);
        self.queue.publish(self.index);
        self.open = false;
    }

    /// Gives the slot back without publishing anything.
    pub fn release(mut self) {
        self.abandon();
    }

    fn abandon(&mut self) {
        if self.open {
            self.queue.slots[self.index]
                .state
                .store(FREE, Ordering::Release);
            self.open = false;
        }
    }
}

impl<const N: usize> Drop for SlotGrant<'_, N> {
    fn drop(&mut self) {
        self.abandon();
    }
}
