//! bpf object loader and ring buffer consumer

use crate::sink::EventSink;
use anyhow::{bail, Context};
use aya::maps::{MapData, RingBuf};
use aya::programs::{KProbe, TracePoint};
use aya::Ebpf;
use sockwatch_core::config::CaptureSettings;
use sockwatch_core::{Event, EventKind, TracerStats};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Ring buffer poll interval
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Check if eBPF is available on this system
pub fn check_ebpf_available() -> bool {
    if !Path::new("/sys/fs/bpf").exists() {
        warn!("BPF filesystem not mounted at /sys/fs/bpf");
        return false;
    }

    if !Path::new("/sys/kernel/btf/vmlinux").exists() {
        debug!("BTF not available");
    }

    true
}

/// Check kernel version for eBPF feature support
pub fn get_kernel_version() -> Option<(u32, u32, u32)> {
    let release = std::fs::read_to_string("/proc/sys/kernel/osrelease").ok()?;
    parse_kernel_release(&release)
}

fn parse_kernel_release(release: &str) -> Option<(u32, u32, u32)> {
    let parts: Vec<&str> = release.trim().split('.').collect();

    if parts.len() >= 2 {
        let major = parts[0].parse().ok()?;
        let minor = parts[1].split('-').next()?.parse().ok()?;
        let patch = parts
            .get(2)
            .and_then(|p| p.split('-').next())
            .and_then(|p| p.parse().ok())
            .unwrap_or(0);

        Some((major, minor, patch))
    } else {
        None
    }
}

/// Check if running as root
pub fn is_root() -> bool {
    unsafe { libc::getuid() == 0 }
}

/// Bump memlock rlimit for eBPF (required on older kernels)
fn bump_memlock_rlimit() -> bool {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        warn!("Failed to remove limit on locked memory (ret={})", ret);
        false
    } else {
        true
    }
}

/// Loaded and attached kernel programs plus the ring buffer they write to
pub struct Capture {
    // programs stay attached while this is alive
    _ebpf: Ebpf,
    events: RingBuf<MapData>,
}

impl Capture {
    /// Load the bpf object at `path` and attach the programs enabled in `settings`
    pub fn load(path: &Path, settings: &CaptureSettings) -> anyhow::Result<Self> {
        if !is_root() {
            bail!("record requires root privileges");
        }
        bump_memlock_rlimit();

        let bytecode = std::fs::read(path)
            .with_context(|| format!("Failed to read bpf object from '{}'", path.display()))?;
        info!("Loading bpf object ({} bytes)...", bytecode.len());

        let mut ebpf = Ebpf::load(&bytecode).context("Failed to load bpf object")?;

        if settings.network {
            attach_kprobe(&mut ebpf, "tcp_v4_connect", &settings.connect_symbol)?;
            attach_kprobe(&mut ebpf, "tcp_v4_connect_ret", &settings.connect_symbol)?;
            attach_kprobe(&mut ebpf, "inet_csk_accept_ret", "inet_csk_accept")?;
            attach_kprobe(&mut ebpf, "tcp_close", "tcp_close")?;
        }

        if settings.process {
            attach_tracepoint(&mut ebpf, "sched_process_exec", "sched")?;
            attach_tracepoint(&mut ebpf, "sched_process_exit", "sched")?;
        }

        let map = ebpf.take_map("EVENTS").context("EVENTS map not found")?;
        let events = RingBuf::try_from(map).context("Failed to open EVENTS ring buffer")?;
        info!("EVENTS ring buffer initialized");

        Ok(Self {
            _ebpf: ebpf,
            events,
        })
    }

    /// Poll until Ctrl+C, writing every decoded record to `sink`
    pub async fn run(&mut self, sink: &mut EventSink, stats: &TracerStats) -> anyhow::Result<()> {
        let mut shutdown = std::pin::pin!(tokio::signal::ctrl_c());

        loop {
            while let Some(item) = self.events.next() {
                match Event::decode(item.as_ref()) {
                    Ok(event) => {
                        stats.record_received(event.kind());
                        sink.write(&event)?;
                    }
                    Err(e) => {
                        stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                        warn!("Failed to decode record: {}", e);
                    }
                }
            }
            sink.flush()?;

            tokio::select! {
                result = &mut shutdown => {
                    result.context("Failed to listen for Ctrl+C")?;
                    break;
                }
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }

        info!("Ring buffer polling stopped");
        Ok(())
    }
}

/// Load `program` and attach it to kernel function `symbol`.
///
/// Return probes are the same program type; the object records which is which.
fn attach_kprobe(ebpf: &mut Ebpf, program: &str, symbol: &str) -> anyhow::Result<()> {
    let probe: &mut KProbe = ebpf
        .program_mut(program)
        .with_context(|| format!("{} program not found", program))?
        .try_into()
        .with_context(|| format!("{} is not a kprobe program", program))?;
    probe
        .load()
        .with_context(|| format!("Failed to load {}", program))?;
    probe
        .attach(symbol, 0)
        .with_context(|| format!("Failed to attach {} to {}", program, symbol))?;
    debug!(program, symbol, "kprobe attached");
    Ok(())
}

fn attach_tracepoint(ebpf: &mut Ebpf, name: &str, category: &str) -> anyhow::Result<()> {
    let tracepoint: &mut TracePoint = ebpf
        .program_mut(name)
        .with_context(|| format!("{} program not found", name))?
        .try_into()
        .with_context(|| format!("{} is not a tracepoint program", name))?;
    tracepoint
        .load()
        .with_context(|| format!("Failed to load {}", name))?;
    tracepoint
        .attach(category, name)
        .with_context(|| format!("Failed to attach {}/{}", category, name))?;
    debug!(category, name, "tracepoint attached");
    Ok(())
}

/// Per-kind totals for the shutdown summary
pub fn summary(stats: &TracerStats) -> String {
    let counts = EventKind::ALL
        .iter()
        .map(|kind| format!("{}={}", kind.as_str(), stats.received_by(*kind)))
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "received {} records ({}), {} decode errors",
        stats.received.load(Ordering::Relaxed),
        counts,
        stats.decode_errors.load(Ordering::Relaxed)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kernel_release() {
        assert_eq!(parse_kernel_release("6.8.0-45-generic\n"), Some((6, 8, 0)));
        assert_eq!(parse_kernel_release("5.15.167.4-microsoft-standard-WSL2"), Some((5, 15, 167)));
        assert_eq!(parse_kernel_release("6.1-rc3"), Some((6, 1, 0)));
        assert_eq!(parse_kernel_release("garbage"), None);
    }

    #[test]
    fn test_summary() {
        let stats = TracerStats::new();
        stats.record_received(EventKind::Connect);
        let text = summary(&stats);
        assert!(text.starts_with("received 1 records"));
        assert!(text.contains("connect=1"));
        assert!(text.contains("0 decode errors"));
        assert_eq!(stats.published(EventKind::Connect), 0);
    }
}
