#![no_std]

//! Wire format shared between the kernel probes and userspace.
//!
//! Every record starts with a [`Header`]. Process events are the header alone,
//! socket events append a [`Sock4`] tuple. The consumer reads `kind` first and
//! derives the total record length from it, so no length prefix is carried.

use bytemuck::{Pod, Zeroable};

pub mod probe;

/// Transport protocol number for TCP (`IPPROTO_TCP`)
pub const IPPROTO_TCP: u32 = 6;

/// Maximum number of in-flight connect calls tracked at once
pub const CORRELATION_CAPACITY: u32 = 512;

/// Size of the largest record on the wire
pub const MAX_RECORD_LEN: usize = core::mem::size_of::<SockRecord>();

// =============================================================================
// Event Kinds
// =============================================================================

/// Closed set of event kinds; the numeric value is the on-wire `kind` field
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Process executed a new image
    Exec = 0,
    /// Process (or thread) exited
    Exit = 1,
    /// Outbound TCP connection established
    Connect = 2,
    /// Inbound TCP connection accepted
    Accept = 3,
    /// TCP socket closed
    Close = 4,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::Exec,
        EventKind::Exit,
        EventKind::Connect,
        EventKind::Accept,
        EventKind::Close,
    ];

    pub const fn from_u32(kind: u32) -> Option<Self> {
        match kind {
            0 => Some(EventKind::Exec),
            1 => Some(EventKind::Exit),
            2 => Some(EventKind::Connect),
            3 => Some(EventKind::Accept),
            4 => Some(EventKind::Close),
            _ => None,
        }
    }

    /// Whether records of this kind carry a socket tuple
    pub const fn has_socket(self) -> bool {
        match self {
            EventKind::Exec | EventKind::Exit => false,
            EventKind::Connect | EventKind::Accept | EventKind::Close => true,
        }
    }

    /// Fixed total size of a record of this kind
    pub const fn record_len(self) -> usize {
        if self.has_socket() {
            core::mem::size_of::<SockRecord>()
        } else {
            core::mem::size_of::<Header>()
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            EventKind::Exec => "exec",
            EventKind::Exit => "exit",
            EventKind::Connect => "connect",
            EventKind::Accept => "accept",
            EventKind::Close => "close",
        }
    }
}

// =============================================================================
// Records
// =============================================================================

/// Present at the start of every record
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct Header {
    /// [`EventKind`] as `u32`
    pub kind: u32,
    /// Process id (tgid) of the task that triggered the event
    pub pid: u32,
}

impl Header {
    pub const fn new(kind: EventKind, pid: u32) -> Self {
        Self {
            kind: kind as u32,
            pid,
        }
    }
}

/// IPv4 socket tuple as observed in `struct sock_common`
///
/// Addresses keep the byte layout the kernel stores them in (network order
/// read as a native integer). `sport` is host order already (`skc_num`),
/// `dport` has been swapped from network order.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct Sock4 {
    pub proto: u32,
    pub saddr: u32,
    pub sport: u32,
    pub daddr: u32,
    pub dport: u32,
}

impl Sock4 {
    /// Build a tuple from raw `sock_common` fields.
    ///
    /// `dport_be` is `skc_dport` exactly as stored in the kernel (network order).
    pub const fn from_sock_common(saddr: u32, sport: u16, daddr: u32, dport_be: u16) -> Self {
        Self {
            proto: IPPROTO_TCP,
            saddr,
            sport: sport as u32,
            daddr,
            dport: u16::from_be(dport_be) as u32,
        }
    }
}

/// Header followed by the socket tuple, used for connect/accept/close
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct SockRecord {
    pub header: Header,
    pub socket: Sock4,
}

impl SockRecord {
    pub const fn new(kind: EventKind, pid: u32, socket: Sock4) -> Self {
        Self {
            header: Header::new(kind, pid),
            socket,
        }
    }
}

// =============================================================================
// Identifiers
// =============================================================================

/// Opaque reference to an in-flight kernel socket.
///
/// Only the component that owns socket access can turn this back into
/// anything meaningful; the correlation store just carries it around.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct SockRef(pub u64);

impl SockRef {
    pub const NULL: SockRef = SockRef(0);

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Thread id: low 32 bits of `bpf_get_current_pid_tgid()`
#[inline(always)]
pub const fn thread_id(pid_tgid: u64) -> u32 {
    pid_tgid as u32
}

/// Process id (tgid): high 32 bits of `bpf_get_current_pid_tgid()`
#[inline(always)]
pub const fn process_id(pid_tgid: u64) -> u32 {
    (pid_tgid >> 32) as u32
}
