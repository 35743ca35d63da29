#![no_std]
#![no_main]

use aya_ebpf::{
    bpf_printk,
    helpers::{bpf_get_current_pid_tgid, bpf_probe_read_kernel},
    macros::{kprobe, kretprobe, map, tracepoint},
    maps::{LruHashMap, RingBuf},
    programs::{ProbeContext, RetProbeContext, TracePointContext},
};
use sockwatch_common::{
    probe::{CorrelationStore, Diagnostics, EventChannel, Pod, Probes, Publish, SocketReader},
    EventKind, Sock4, SockRef, CORRELATION_CAPACITY,
};

// =============================================================================
// Maps
// =============================================================================

/// Ring buffer carrying every record to userspace
/// Size: 256KB - records are 8 or 28 bytes
#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(256 * 1024, 0);

/// In-flight connect calls
/// Key: thread id (low half of pid_tgid), Value: `struct sock *`
#[map]
static SOCKS: LruHashMap<u32, u64> = LruHashMap::with_max_entries(CORRELATION_CAPACITY, 0);

// =============================================================================
// Seams
// =============================================================================

/// `struct sock_common` field offsets (Linux 5.4+, x86_64 and aarch64)
const SKC_DADDR: usize = 0;
const SKC_RCV_SADDR: usize = 4;
const SKC_DPORT: usize = 12;
const SKC_NUM: usize = 14;

struct SockMap;

impl CorrelationStore for SockMap {
    #[inline(always)]
    fn put(&self, tid: u32, sock: SockRef) {
        // LRU map: a full table evicts instead of failing
        let _ = SOCKS.insert(&tid, &sock.0, 0);
    }

    #[inline(always)]
    fn get(&self, tid: u32) -> Option<SockRef> {
        unsafe { SOCKS.get(&tid) }.map(|sk| SockRef(*sk))
    }

    #[inline(always)]
    fn remove(&self, tid: u32) {
        let _ = SOCKS.remove(&tid);
    }
}

struct EventRing;

impl EventChannel for EventRing {
    #[inline(always)]
    fn publish<T: Pod>(&self, record: &T) -> Publish {
        match EVENTS.output(record, 0) {
            Ok(()) => Publish::Sent,
            Err(_) => Publish::Dropped,
        }
    }
}

struct KernelSockets;

impl SocketReader for KernelSockets {
    #[inline(always)]
    fn read_tuple(&self, sock: SockRef) -> Option<Sock4> {
        let sk = sock.0 as *const u8;
        unsafe {
            let daddr = bpf_probe_read_kernel(sk.add(SKC_DADDR) as *const u32).ok()?;
            let saddr = bpf_probe_read_kernel(sk.add(SKC_RCV_SADDR) as *const u32).ok()?;
            let dport = bpf_probe_read_kernel(sk.add(SKC_DPORT) as *const u16).ok()?;
            let sport = bpf_probe_read_kernel(sk.add(SKC_NUM) as *const u16).ok()?;
            Some(Sock4::from_sock_common(saddr, sport, daddr, dport))
        }
    }
}

struct Printk;

impl Diagnostics for Printk {
    #[inline(always)]
    fn publish_dropped(&self, kind: EventKind) {
        unsafe {
            bpf_printk!(b"event output failure: kind %d", kind as u32);
        }
    }
}

#[inline(always)]
fn probes() -> Probes<'static, SockMap, EventRing, KernelSockets, Printk> {
    Probes::new(&SockMap, &EventRing, &KernelSockets, &Printk)
}

// =============================================================================
// TCP Connect
// =============================================================================

/// kprobe on tcp_v4_connect - remembers the socket being connected
/// int tcp_v4_connect(struct sock *sk, struct sockaddr *uaddr, int addr_len);
#[kprobe]
pub fn tcp_v4_connect(ctx: ProbeContext) -> u32 {
    match try_tcp_v4_connect(&ctx) {
        Ok(()) => 0,
        Err(_) => 0,
    }
}

fn try_tcp_v4_connect(ctx: &ProbeContext) -> Result<(), i64> {
    let sk: *const u8 = ctx.arg(0).ok_or(1i64)?;
    probes().connect_enter(bpf_get_current_pid_tgid(), SockRef(sk as u64));
    Ok(())
}

/// kretprobe on tcp_v4_connect - emits CONNECT when the call succeeded
#[kretprobe]
pub fn tcp_v4_connect_ret(ctx: RetProbeContext) -> u32 {
    let rc: i32 = ctx.ret::<i32>();
    probes().connect_return(bpf_get_current_pid_tgid(), rc);
    0
}

// =============================================================================
// TCP Accept
// =============================================================================

/// kretprobe on inet_csk_accept - returns the accepted `struct sock *` or NULL
#[kretprobe]
pub fn inet_csk_accept_ret(ctx: RetProbeContext) -> u32 {
    let sk: u64 = ctx.ret::<u64>();
    probes().accept_return(bpf_get_current_pid_tgid(), SockRef(sk));
    0
}

// =============================================================================
// TCP Close
// =============================================================================

/// kprobe on tcp_close
/// void tcp_close(struct sock *sk, long timeout);
#[kprobe]
pub fn tcp_close(ctx: ProbeContext) -> u32 {
    let sk: *const u8 = ctx.arg(0).unwrap_or(core::ptr::null());
    probes().close(bpf_get_current_pid_tgid(), SockRef(sk as u64));
    0
}

// =============================================================================
// Process Tracepoints
// =============================================================================

/// Offset of `pid` in sched/sched_process_exec
/// See: /sys/kernel/debug/tracing/events/sched/sched_process_exec/format
const EXEC_PID_OFFSET: usize = 12;

/// Offset of `pid` in sched/sched_process_exit (after `char comm[16]`)
/// See: /sys/kernel/debug/tracing/events/sched/sched_process_exit/format
const EXIT_PID_OFFSET: usize = 24;

#[tracepoint]
pub fn sched_process_exec(ctx: TracePointContext) -> u32 {
    match try_sched_process_exec(&ctx) {
        Ok(()) => 0,
        Err(_) => 0,
    }
}

fn try_sched_process_exec(ctx: &TracePointContext) -> Result<(), i64> {
    let pid: i32 = unsafe { ctx.read_at(EXEC_PID_OFFSET)? };
    probes().exec(pid as u32);
    Ok(())
}

#[tracepoint]
pub fn sched_process_exit(ctx: TracePointContext) -> u32 {
    match try_sched_process_exit(&ctx) {
        Ok(()) => 0,
        Err(_) => 0,
    }
}

fn try_sched_process_exit(ctx: &TracePointContext) -> Result<(), i64> {
    let pid: i32 = unsafe { ctx.read_at(EXIT_PID_OFFSET)? };
    probes().exit(pid as u32);
    Ok(())
}

// =============================================================================
// Required for eBPF programs
// =============================================================================

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}

#[unsafe(link_section = "license")]
#[unsafe(no_mangle)]
static LICENSE: [u8; 4] = *b"GPL\0";
