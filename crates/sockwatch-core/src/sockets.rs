//! Socket arena
//!
//! Owns the socket objects of the userspace model. Handles given out by
//! [`SocketArena::open`] are the `SockRef`s the probes pass around: the low
//! half is the slot index plus one, the high half the slot generation, so a
//! handle to a released socket never reads a later occupant.

use crate::events::{ipv4_to_wire, SocketTuple};
use parking_lot::RwLock;
use sockwatch_common::probe::SocketReader;
use sockwatch_common::{Sock4, SockRef};

#[derive(Default)]
struct Slot {
    generation: u32,
    tuple: Option<SocketTuple>,
}

struct Slots {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

/// Fixed-capacity table of live sockets
pub struct SocketArena {
    inner: RwLock<Slots>,
}

fn handle(index: u32, generation: u32) -> SockRef {
    SockRef((u64::from(generation) << 32) | u64::from(index + 1))
}

fn split(sock: SockRef) -> Option<(usize, u32)> {
    let low = sock.0 as u32;
    if low == 0 {
        return None;
    }
    Some(((low - 1) as usize, (sock.0 >> 32) as u32))
}

impl SocketArena {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.min(u32::MAX as usize - 1);
        let slots = (0..capacity).map(|_| Slot::default()).collect();
        // pop() hands out the lowest index first
        let free = (0..capacity as u32).rev().collect();

        Self {
            inner: RwLock::new(Slots { slots, free }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.read().slots.len()
    }

    /// Sockets currently open
    pub fn live(&self) -> usize {
        let inner = self.inner.read();
        inner.slots.len() - inner.free.len()
    }

    /// Create a socket; `None` when the arena is full
    pub fn open(&self, tuple: SocketTuple) -> Option<SockRef> {
        let mut inner = self.inner.write();
        let index = inner.free.pop()?;
        let slot = &mut inner.slots[index as usize];
        slot.tuple = Some(tuple);
        Some(handle(index, slot.generation))
    }

    /// Replace the tuple of a live socket (e.g. once the local port is bound)
    pub fn update(&self, sock: SockRef, tuple: SocketTuple) -> bool {
        let Some((index, generation)) = split(sock) else {
            return false;
        };
        let mut inner = self.inner.write();
        match inner.slots.get_mut(index) {
            Some(slot) if slot.generation == generation && slot.tuple.is_some() => {
                slot.tuple = Some(tuple);
                true
            }
            _ => false,
        }
    }

    /// Free a socket. Outstanding handles to it become stale.
    pub fn release(&self, sock: SockRef) -> bool {
        let Some((index, generation)) = split(sock) else {
            return false;
        };
        let mut inner = self.inner.write();
        let released = match inner.slots.get_mut(index) {
            Some(slot) if slot.generation == generation && slot.tuple.is_some() => {
                slot.tuple = None;
                slot.generation = slot.generation.wrapping_add(1);
                true
            }
            _ => false,
        };
        if released {
            inner.free.push(index as u32);
        }
        released
    }

    pub fn get(&self, sock: SockRef) -> Option<SocketTuple> {
        let (index, generation) = split(sock)?;
        let inner = self.inner.read();
        inner
            .slots
            .get(index)
            .filter(|slot| slot.generation == generation)
            .and_then(|slot| slot.tuple)
    }
}

impl SocketReader for SocketArena {
    fn read_tuple(&self, sock: SockRef) -> Option<Sock4> {
        let tuple = self.get(sock)?;
        Some(Sock4::from_sock_common(
            ipv4_to_wire(*tuple.local.ip()),
            tuple.local.port(),
            ipv4_to_wire(*tuple.remote.ip()),
            // stored the way the kernel keeps skc_dport
            tuple.remote.port().to_be(),
        ))
    }
}
