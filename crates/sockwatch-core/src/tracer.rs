//! Userspace tracer
//!
//! Runs the shared probe handlers against the in-memory store, channel and
//! socket arena. The kernel program wires the same handlers to bpf maps; this
//! is what the tests and the `demo` command drive.

use crate::channel::{CpuProducer, PerCpuChannel};
use crate::events::Event;
use crate::metrics::TracerStats;
use crate::sockets::SocketArena;
use crate::store::LruStore;
use sockwatch_common::probe::{Diagnostics, EventChannel, Pod, Probes, Publish};
use sockwatch_common::{
    process_id, thread_id, EventKind, Header, SockRef, CORRELATION_CAPACITY,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Where a probe fired: the CPU and `bpf_get_current_pid_tgid()` of the task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskContext {
    pub cpu: usize,
    pub pid_tgid: u64,
}

impl TaskContext {
    pub fn new(cpu: usize, pid: u32, tid: u32) -> Self {
        Self {
            cpu,
            pid_tgid: (u64::from(pid) << 32) | u64::from(tid),
        }
    }

    pub fn pid(&self) -> u32 {
        process_id(self.pid_tgid)
    }

    pub fn tid(&self) -> u32 {
        thread_id(self.pid_tgid)
    }
}

/// Sizes of the preallocated structures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TracerConfig {
    pub cpus: usize,
    pub channel_capacity: usize,
    pub correlation_capacity: usize,
    pub socket_capacity: usize,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            cpus: 4,
            channel_capacity: 1024,
            correlation_capacity: CORRELATION_CAPACITY as usize,
            socket_capacity: 4096,
        }
    }
}

/// Counts every publish attempt per kind before handing the record on
struct CountingChannel<'a> {
    inner: CpuProducer<'a>,
    stats: &'a TracerStats,
}

impl EventChannel for CountingChannel<'_> {
    fn publish<T: Pod>(&self, record: &T) -> Publish {
        let outcome = self.inner.publish(record);

        let bytes = bytemuck::bytes_of(record);
        if let Some(kind) = bytes
            .get(..size_of::<Header>())
            .map(bytemuck::pod_read_unaligned::<Header>)
            .and_then(|header| EventKind::from_u32(header.kind))
        {
            match outcome {
                Publish::Sent => self.stats.record_published(kind),
                Publish::Dropped => self.stats.record_dropped(kind),
            }
        }
        outcome
    }
}

struct LogDiagnostics<'a> {
    stats: &'a TracerStats,
}

impl Diagnostics for LogDiagnostics<'_> {
    fn publish_dropped(&self, kind: EventKind) {
        debug!(kind = kind.as_str(), "event channel full, record dropped");
    }

    fn connect_unobserved(&self, _tid: u32) {
        self.stats.unobserved_connects.fetch_add(1, Ordering::Relaxed);
    }

    fn connect_failed(&self, tid: u32, rc: i32) {
        self.stats.failed_connects.fetch_add(1, Ordering::Relaxed);
        trace!(tid, rc, "connect failed");
    }
}

/// Producer and consumer sides of the tracer in one process
pub struct Tracer {
    store: LruStore,
    channel: PerCpuChannel,
    sockets: SocketArena,
    stats: Arc<TracerStats>,
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new(TracerConfig::default())
    }
}

impl Tracer {
    pub fn new(config: TracerConfig) -> Self {
        debug!(
            cpus = config.cpus,
            channel_capacity = config.channel_capacity,
            correlation_capacity = config.correlation_capacity,
            "tracer created"
        );

        Self {
            store: LruStore::with_capacity(config.correlation_capacity),
            channel: PerCpuChannel::new(config.cpus, config.channel_capacity),
            sockets: SocketArena::with_capacity(config.socket_capacity),
            stats: Arc::new(TracerStats::new()),
        }
    }

    pub fn store(&self) -> &LruStore {
        &self.store
    }

    pub fn channel(&self) -> &PerCpuChannel {
        &self.channel
    }

    pub fn sockets(&self) -> &SocketArena {
        &self.sockets
    }

    pub fn stats(&self) -> Arc<TracerStats> {
        self.stats.clone()
    }

    fn run<F>(&self, cpu: usize, handler: F)
    where
        F: FnOnce(&Probes<'_, LruStore, CountingChannel<'_>, SocketArena, LogDiagnostics<'_>>),
    {
        let channel = CountingChannel {
            inner: self.channel.producer(cpu),
            stats: &self.stats,
        };
        let diag = LogDiagnostics { stats: &self.stats };
        handler(&Probes::new(&self.store, &channel, &self.sockets, &diag));
    }

    /// Entry of the connect call on `sock`
    pub fn on_connect_enter(&self, ctx: TaskContext, sock: SockRef) {
        self.run(ctx.cpu, |probes| probes.connect_enter(ctx.pid_tgid, sock));
    }

    /// Return of the connect call with return code `rc`
    pub fn on_connect_return(&self, ctx: TaskContext, rc: i32) {
        self.run(ctx.cpu, |probes| probes.connect_return(ctx.pid_tgid, rc));
    }

    /// Return of the accept call; `sock` may be null
    pub fn on_accept_return(&self, ctx: TaskContext, sock: SockRef) {
        self.run(ctx.cpu, |probes| probes.accept_return(ctx.pid_tgid, sock));
    }

    pub fn on_close(&self, ctx: TaskContext, sock: SockRef) {
        self.run(ctx.cpu, |probes| probes.close(ctx.pid_tgid, sock));
    }

    /// `sched_process_exec`; `pid` is the tracepoint's pid field
    pub fn on_exec(&self, ctx: TaskContext, pid: u32) {
        self.run(ctx.cpu, |probes| probes.exec(pid));
    }

    /// `sched_process_exit`; `pid` is the tracepoint's pid field
    pub fn on_exit(&self, ctx: TaskContext, pid: u32) {
        self.run(ctx.cpu, |probes| probes.exit(pid));
    }

    /// Consume and decode everything queued, CPU by CPU.
    ///
    /// Records that fail to decode are counted and skipped.
    pub fn poll(&self) -> Vec<Event> {
        self.channel
            .drain()
            .iter()
            .filter_map(|raw| match Event::decode(raw.as_bytes()) {
                Ok(event) => {
                    self.stats.record_received(event.kind());
                    Some(event)
                }
                Err(e) => {
                    self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("Failed to decode record: {}", e);
                    None
                }
            })
            .collect()
    }
}
