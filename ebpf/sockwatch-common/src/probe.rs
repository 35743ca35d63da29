//! Probe handlers
//!
//! The handlers are written once against four small seams so the same logic
//! runs inside the kernel program (bpf maps, `bpf_probe_read_kernel`) and in
//! userspace (in-memory store and channel, used for tests and the demo).
//!
//! Handlers never fail. Anything that goes wrong is swallowed locally and at
//! most reported through [`Diagnostics`].

pub use bytemuck::Pod;

use crate::{process_id, thread_id, EventKind, Header, Sock4, SockRecord, SockRef};

/// Outcome of a publish attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Publish {
    Sent,
    Dropped,
}

/// Bounded thread id -> socket map joining connect entry and return
pub trait CorrelationStore {
    /// Upsert; replaces any stale entry for `tid`
    fn put(&self, tid: u32, sock: SockRef);

    fn get(&self, tid: u32) -> Option<SockRef>;

    /// Removing an absent key is a no-op
    fn remove(&self, tid: u32);
}

/// Non-blocking record sink
pub trait EventChannel {
    fn publish<T: Pod>(&self, record: &T) -> Publish;
}

/// Access to the socket object behind a [`SockRef`]
pub trait SocketReader {
    /// Read the IPv4 tuple; `None` if the socket cannot be read
    fn read_tuple(&self, sock: SockRef) -> Option<Sock4>;
}

/// Best-effort hooks for conditions the handlers swallow
pub trait Diagnostics {
    fn publish_dropped(&self, _kind: EventKind) {}

    fn connect_unobserved(&self, _tid: u32) {}

    fn connect_failed(&self, _tid: u32, _rc: i32) {}
}

impl Diagnostics for () {}

/// The set of handlers, borrowing the injected store, channel, socket reader
/// and diagnostics sink.
pub struct Probes<'a, S, C, R, D> {
    pub store: &'a S,
    pub channel: &'a C,
    pub sockets: &'a R,
    pub diag: &'a D,
}

impl<'a, S, C, R, D> Probes<'a, S, C, R, D>
where
    S: CorrelationStore,
    C: EventChannel,
    R: SocketReader,
    D: Diagnostics,
{
    pub fn new(store: &'a S, channel: &'a C, sockets: &'a R, diag: &'a D) -> Self {
        Self {
            store,
            channel,
            sockets,
            diag,
        }
    }

    /// Entry of the connect call: remember which socket this thread is connecting.
    #[inline(always)]
    pub fn connect_enter(&self, pid_tgid: u64, sock: SockRef) {
        self.store.put(thread_id(pid_tgid), sock);
    }

    /// Return of the connect call.
    ///
    /// Emits `CONNECT` only for `rc == 0`. The correlation entry is removed on
    /// every path that found one.
    #[inline(always)]
    pub fn connect_return(&self, pid_tgid: u64, rc: i32) {
        let tid = thread_id(pid_tgid);

        let Some(sock) = self.store.get(tid) else {
            self.diag.connect_unobserved(tid);
            return;
        };

        if rc != 0 {
            self.store.remove(tid);
            self.diag.connect_failed(tid, rc);
            return;
        }

        if let Some(socket) = self.sockets.read_tuple(sock) {
            let record = SockRecord::new(EventKind::Connect, process_id(pid_tgid), socket);
            if self.channel.publish(&record) == Publish::Dropped {
                self.diag.publish_dropped(EventKind::Connect);
            }
        }

        self.store.remove(tid);
    }

    /// Return of the accept call; `sock` is the accepted socket or null.
    #[inline(always)]
    pub fn accept_return(&self, pid_tgid: u64, sock: SockRef) {
        if sock.is_null() {
            return;
        }

        let Some(socket) = self.sockets.read_tuple(sock) else {
            return;
        };

        // no drop diagnostic on this path
        let record = SockRecord::new(EventKind::Accept, process_id(pid_tgid), socket);
        let _ = self.channel.publish(&record);
    }

    /// Entry of the close call.
    ///
    /// Also clears any correlation entry left by a connect on this thread that
    /// never came back through [`Probes::connect_return`].
    #[inline(always)]
    pub fn close(&self, pid_tgid: u64, sock: SockRef) {
        if !sock.is_null() {
            if let Some(socket) = self.sockets.read_tuple(sock) {
                let record = SockRecord::new(EventKind::Close, process_id(pid_tgid), socket);
                if self.channel.publish(&record) == Publish::Dropped {
                    self.diag.publish_dropped(EventKind::Close);
                }
            }
        }

        self.store.remove(thread_id(pid_tgid));
    }

    /// `sched_process_exec` with the pid reported by the tracepoint
    #[inline(always)]
    pub fn exec(&self, pid: u32) {
        self.process_event(EventKind::Exec, pid);
    }

    /// `sched_process_exit` with the pid reported by the tracepoint
    #[inline(always)]
    pub fn exit(&self, pid: u32) {
        self.process_event(EventKind::Exit, pid);
    }

    #[inline(always)]
    fn process_event(&self, kind: EventKind, pid: u32) {
        let record = Header::new(kind, pid);
        if self.channel.publish(&record) == Publish::Dropped {
            self.diag.publish_dropped(kind);
        }
    }
}
