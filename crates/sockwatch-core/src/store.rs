//! Correlation store
//!
//! Fixed-capacity, lock-free map from thread id to [`SockRef`], the userspace
//! counterpart of the kernel's `BPF_MAP_TYPE_LRU_HASH`.
//!
//! Open addressing with linear probing over the whole table. A slot is one
//! packed state word (occupied bit, busy bit, version, key) plus the value
//! word. Writers claim a slot by CAS-ing the state to busy, write the value,
//! then publish a new version; readers validate the value by re-reading the
//! state. A slot that has never been written has state `0` and ends every
//! probe sequence; removal leaves a non-zero tombstone so later entries stay
//! reachable. Only when no slot is free is the least recently touched entry
//! in the table reclaimed, which only ever costs a missed connect event.

use sockwatch_common::probe::CorrelationStore;
use sockwatch_common::SockRef;
use std::sync::atomic::{fence, AtomicU64, Ordering};
use tracing::trace;

/// Bounded retries for contended slots
const MAX_ATTEMPTS: usize = 4;

const OCCUPIED: u64 = 1 << 63;
const BUSY: u64 = 1 << 62;
const VERSION_SHIFT: u32 = 32;
const VERSION_MASK: u64 = (1 << 30) - 1;

#[inline]
fn pack(key: u32, version: u64, occupied: bool) -> u64 {
    let flag = if occupied { OCCUPIED } else { 0 };
    flag | ((version & VERSION_MASK) << VERSION_SHIFT) | u64::from(key)
}

/// Versions skip zero so a written slot never reads as never-written
#[inline]
fn next_version(state: u64) -> u64 {
    ((version_of(state) + 1) & VERSION_MASK).max(1)
}

#[inline]
fn key_of(state: u64) -> u32 {
    state as u32
}

#[inline]
fn version_of(state: u64) -> u64 {
    (state >> VERSION_SHIFT) & VERSION_MASK
}

#[inline]
fn is_occupied(state: u64) -> bool {
    state & OCCUPIED != 0
}

#[inline]
fn is_busy(state: u64) -> bool {
    state & BUSY != 0
}

#[inline]
fn holds(state: u64, key: u32) -> bool {
    !is_busy(state) && is_occupied(state) && key_of(state) == key
}

#[derive(Default)]
struct Slot {
    state: AtomicU64,
    value: AtomicU64,
    touched: AtomicU64,
}

/// Bounded LRU correlation store
pub struct LruStore {
    slots: Box<[Slot]>,
    clock: AtomicU64,
    evictions: AtomicU64,
}

impl LruStore {
    /// Allocate all slots up front; nothing is allocated afterwards.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let slots = (0..capacity).map(|_| Slot::default()).collect::<Vec<_>>();

        Self {
            slots: slots.into_boxed_slice(),
            clock: AtomicU64::new(1),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of live entries; never exceeds [`LruStore::capacity`]
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| is_occupied(slot.state.load(Ordering::Relaxed)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live entries reclaimed (or puts abandoned) to stay within capacity
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    #[inline]
    fn start(&self, key: u32) -> usize {
        let hash = u64::from(key).wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32;
        (hash as usize) % self.slots.len()
    }

    /// Probe sequence for `key`: every slot once, starting at its hash
    #[inline]
    fn probe(&self, key: u32) -> impl Iterator<Item = &Slot> {
        let start = self.start(key);
        let len = self.slots.len();
        (0..len).map(move |i| &self.slots[(start + i) % len])
    }

    /// Slots that may hold `key`: the probe sequence up to the first never-written slot
    #[inline]
    fn chain(&self, key: u32) -> impl Iterator<Item = &Slot> {
        self.probe(key)
            .take_while(|slot| slot.state.load(Ordering::Acquire) != 0)
    }

    #[inline]
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Claim `slot` if its state is still `observed`, then publish `key -> value`.
    fn try_write(&self, slot: &Slot, observed: u64, key: u32, value: u64) -> bool {
        let version = next_version(observed);
        let claimed = pack(key, version, true) | BUSY;

        if slot
            .state
            .compare_exchange(observed, claimed, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }

        slot.value.store(value, Ordering::Release);
        slot.touched.store(self.tick(), Ordering::Relaxed);
        slot.state.store(pack(key, version, true), Ordering::Release);
        true
    }

    fn read(&self, slot: &Slot, key: u32) -> Option<u64> {
        for _ in 0..MAX_ATTEMPTS {
            let before = slot.state.load(Ordering::Acquire);
            if !holds(before, key) {
                return None;
            }

            let value = slot.value.load(Ordering::Relaxed);
            fence(Ordering::Acquire);
            let after = slot.state.load(Ordering::Relaxed);

            if before == after {
                slot.touched.store(self.tick(), Ordering::Relaxed);
                return Some(value);
            }
        }
        None
    }

    fn upsert(&self, key: u32, value: u64) -> bool {
        // existing entry for this key
        for slot in self.chain(key) {
            let state = slot.state.load(Ordering::Acquire);
            if holds(state, key) && self.try_write(slot, state, key, value) {
                return true;
            }
        }

        // first free slot; never past a never-written one, so the chain stays intact
        for slot in self.probe(key) {
            let state = slot.state.load(Ordering::Acquire);
            if !is_busy(state) && !is_occupied(state) && self.try_write(slot, state, key, value) {
                return true;
            }
        }

        // table full: least recently touched entry anywhere
        let mut victim: Option<(&Slot, u64, u64)> = None;
        for slot in self.slots.iter() {
            let state = slot.state.load(Ordering::Acquire);
            if is_busy(state) || !is_occupied(state) {
                continue;
            }
            let touched = slot.touched.load(Ordering::Relaxed);
            if victim.map_or(true, |(_, _, oldest)| touched < oldest) {
                victim = Some((slot, state, touched));
            }
        }

        match victim {
            Some((slot, state, _)) if self.try_write(slot, state, key, value) => {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                trace!(evicted = key_of(state), tid = key, "correlation entry evicted");
                true
            }
            _ => false,
        }
    }
}

impl CorrelationStore for LruStore {
    fn put(&self, tid: u32, sock: SockRef) {
        for _ in 0..MAX_ATTEMPTS {
            if self.upsert(tid, sock.0) {
                return;
            }
        }
        // every candidate slot was contended; the connect goes unobserved
        self.evictions.fetch_add(1, Ordering::Relaxed);
        trace!(tid, "correlation put abandoned");
    }

    fn get(&self, tid: u32) -> Option<SockRef> {
        self.chain(tid)
            .find_map(|slot| self.read(slot, tid))
            .map(SockRef)
    }

    fn remove(&self, tid: u32) {
        for slot in self.chain(tid) {
            for _ in 0..MAX_ATTEMPTS {
                let state = slot.state.load(Ordering::Acquire);
                if !holds(state, tid) {
                    break;
                }
                let cleared = pack(0, next_version(state), false);
                if slot
                    .state
                    .compare_exchange(state, cleared, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    break;
                }
            }
        }
    }
}
