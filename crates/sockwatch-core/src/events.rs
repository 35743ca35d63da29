//! Decoded event model
//!
//! [`Event`] is the userspace view of one wire record. Decoding and encoding
//! are exhaustive over [`EventKind`], so a new kind cannot be added without
//! touching both directions.

use serde::Serialize;
use sockwatch_common::{EventKind, Header, Sock4, SockRecord, IPPROTO_TCP};
use std::fmt;
use std::mem::size_of;
use std::net::{Ipv4Addr, SocketAddrV4};
use thiserror::Error;

/// Errors raised while decoding a wire record
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("record too short for header: {0} bytes")]
    TruncatedHeader(usize),

    #[error("unknown event kind: {0}")]
    UnknownKind(u32),

    #[error("{kind} record too short: {len} bytes, expected {expected}")]
    TruncatedSocket {
        kind: &'static str,
        len: usize,
        expected: usize,
    },

    #[error("port out of range: {0}")]
    PortOutOfRange(u32),
}

/// One endpoint pair of an IPv4 TCP connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SocketTuple {
    /// Transport protocol number (always 6)
    pub proto: u32,
    pub local: SocketAddrV4,
    pub remote: SocketAddrV4,
}

impl SocketTuple {
    pub fn tcp(local: SocketAddrV4, remote: SocketAddrV4) -> Self {
        Self {
            proto: IPPROTO_TCP,
            local,
            remote,
        }
    }

    fn from_wire(sock: &Sock4) -> Result<Self, DecodeError> {
        let sport = u16::try_from(sock.sport).map_err(|_| DecodeError::PortOutOfRange(sock.sport))?;
        let dport = u16::try_from(sock.dport).map_err(|_| DecodeError::PortOutOfRange(sock.dport))?;

        Ok(Self {
            proto: sock.proto,
            local: SocketAddrV4::new(ipv4_from_wire(sock.saddr), sport),
            remote: SocketAddrV4::new(ipv4_from_wire(sock.daddr), dport),
        })
    }

    fn to_wire(self) -> Sock4 {
        Sock4 {
            proto: self.proto,
            saddr: ipv4_to_wire(*self.local.ip()),
            sport: u32::from(self.local.port()),
            daddr: ipv4_to_wire(*self.remote.ip()),
            dport: u32::from(self.remote.port()),
        }
    }
}

/// Kernel addresses are stored in network order and read as a native `u32`
pub fn ipv4_from_wire(addr: u32) -> Ipv4Addr {
    Ipv4Addr::from(addr.to_ne_bytes())
}

pub fn ipv4_to_wire(addr: Ipv4Addr) -> u32 {
    u32::from_ne_bytes(addr.octets())
}

/// Socket lifecycle event payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SockEvent {
    pub pid: u32,
    #[serde(flatten)]
    pub tuple: SocketTuple,
}

/// A decoded record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    Exec { pid: u32 },
    Exit { pid: u32 },
    Connect(SockEvent),
    Accept(SockEvent),
    Close(SockEvent),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Exec { .. } => EventKind::Exec,
            Event::Exit { .. } => EventKind::Exit,
            Event::Connect(_) => EventKind::Connect,
            Event::Accept(_) => EventKind::Accept,
            Event::Close(_) => EventKind::Close,
        }
    }

    pub fn pid(&self) -> u32 {
        match self {
            Event::Exec { pid } | Event::Exit { pid } => *pid,
            Event::Connect(s) | Event::Accept(s) | Event::Close(s) => s.pid,
        }
    }

    pub fn tuple(&self) -> Option<&SocketTuple> {
        match self {
            Event::Exec { .. } | Event::Exit { .. } => None,
            Event::Connect(s) | Event::Accept(s) | Event::Close(s) => Some(&s.tuple),
        }
    }

    /// Decode one record. Trailing bytes past the kind's fixed size are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let header_len = size_of::<Header>();
        if buf.len() < header_len {
            return Err(DecodeError::TruncatedHeader(buf.len()));
        }

        let header: Header = bytemuck::pod_read_unaligned(&buf[..header_len]);
        let kind = EventKind::from_u32(header.kind).ok_or(DecodeError::UnknownKind(header.kind))?;
        let pid = header.pid;

        Ok(match kind {
            EventKind::Exec => Event::Exec { pid },
            EventKind::Exit => Event::Exit { pid },
            EventKind::Connect => Event::Connect(SockEvent::decode(kind, pid, buf)?),
            EventKind::Accept => Event::Accept(SockEvent::decode(kind, pid, buf)?),
            EventKind::Close => Event::Close(SockEvent::decode(kind, pid, buf)?),
        })
    }

    /// Encode into the exact wire layout the kernel program emits
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Event::Exec { pid } => bytemuck::bytes_of(&Header::new(EventKind::Exec, *pid)).to_vec(),
            Event::Exit { pid } => bytemuck::bytes_of(&Header::new(EventKind::Exit, *pid)).to_vec(),
            Event::Connect(s) => s.encode(EventKind::Connect),
            Event::Accept(s) => s.encode(EventKind::Accept),
            Event::Close(s) => s.encode(EventKind::Close),
        }
    }
}

impl SockEvent {
    fn decode(kind: EventKind, pid: u32, buf: &[u8]) -> Result<Self, DecodeError> {
        let expected = kind.record_len();
        if buf.len() < expected {
            return Err(DecodeError::TruncatedSocket {
                kind: kind.as_str(),
                len: buf.len(),
                expected,
            });
        }

        let record: SockRecord = bytemuck::pod_read_unaligned(&buf[..expected]);
        Ok(Self {
            pid,
            tuple: SocketTuple::from_wire(&record.socket)?,
        })
    }

    fn encode(&self, kind: EventKind) -> Vec<u8> {
        let record = SockRecord::new(kind, self.pid, self.tuple.to_wire());
        bytemuck::bytes_of(&record).to_vec()
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Exec { pid } => write!(f, "[EXEC] pid={}", pid),
            Event::Exit { pid } => write!(f, "[EXIT] pid={}", pid),
            Event::Connect(s) => write!(f, "[CONNECT] {}", s),
            Event::Accept(s) => write!(f, "[ACCEPT] {}", s),
            Event::Close(s) => write!(f, "[CLOSE] {}", s),
        }
    }
}

impl fmt::Display for SockEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pid={} proto={} {} -> {}",
            self.pid, self.tuple.proto, self.tuple.local, self.tuple.remote
        )
    }
}
