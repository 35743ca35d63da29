//! sockwatch core - event model and the userspace side of the tracer
//!
//! This crate provides:
//!
//! - **Events**: decoded view of the wire records emitted by the kernel program
//! - **Store**: lock-free bounded LRU correlation store
//! - **Channel**: per-CPU bounded event channel
//! - **Sockets**: socket arena backing `SockRef` handles
//! - **Tracer**: the shared probe handlers wired to the pieces above
//! - **Config**: TOML configuration with discovery and env overrides

pub mod channel;
pub mod config;
pub mod events;
pub mod metrics;
pub mod sockets;
pub mod store;
pub mod tracer;

// Re-export commonly used types
pub use channel::{PerCpuChannel, RawRecord};
pub use config::{ConfigError, ConfigLoader, OutputFormat, SensorConfig};
pub use events::{DecodeError, Event, SockEvent, SocketTuple};
pub use metrics::{StatsSnapshot, TracerStats};
pub use sockets::SocketArena;
pub use store::LruStore;
pub use tracer::{TaskContext, Tracer, TracerConfig};

pub use sockwatch_common::{EventKind, SockRef};

/// Sensor version
pub const SENSOR_VERSION: &str = env!("CARGO_PKG_VERSION");
