//! Event channel
//!
//! One bounded queue per CPU, preallocated at construction. Producers publish
//! through the handle for the CPU they run on and never block: a full shard
//! drops the record. Records keep their wire bytes so the consumer decodes
//! exactly what the kernel program would have written.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use sockwatch_common::probe::{EventChannel, Pod, Publish};
use sockwatch_common::MAX_RECORD_LEN;
use std::sync::atomic::{AtomicU64, Ordering};

/// Fixed-size copy of one wire record
#[derive(Clone, Copy)]
pub struct RawRecord {
    len: u8,
    bytes: [u8; MAX_RECORD_LEN],
}

impl RawRecord {
    /// `None` if `data` does not fit in a record slot
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() > MAX_RECORD_LEN {
            return None;
        }
        let mut bytes = [0u8; MAX_RECORD_LEN];
        bytes[..data.len()].copy_from_slice(data);
        Some(Self {
            len: data.len() as u8,
            bytes,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl std::fmt::Debug for RawRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawRecord")
            .field("len", &self.len)
            .field("bytes", &self.as_bytes())
            .finish()
    }
}

struct Shard {
    tx: Sender<RawRecord>,
    rx: Receiver<RawRecord>,
}

/// Per-CPU bounded event channel
pub struct PerCpuChannel {
    shards: Vec<Shard>,
    capacity: usize,
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl PerCpuChannel {
    pub fn new(cpus: usize, capacity_per_cpu: usize) -> Self {
        let capacity = capacity_per_cpu.max(1);
        let shards = (0..cpus.max(1))
            .map(|_| {
                let (tx, rx) = bounded(capacity);
                Shard { tx, rx }
            })
            .collect();

        Self {
            shards,
            capacity,
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn cpus(&self) -> usize {
        self.shards.len()
    }

    pub fn capacity_per_cpu(&self) -> usize {
        self.capacity
    }

    /// CPU ids past the shard count wrap around
    fn shard(&self, cpu: usize) -> &Shard {
        &self.shards[cpu % self.shards.len()]
    }

    /// Publishing handle for `cpu`
    pub fn producer(&self, cpu: usize) -> CpuProducer<'_> {
        CpuProducer {
            shard: self.shard(cpu),
            channel: self,
        }
    }

    /// Next record from one CPU's stream, in publish order
    pub fn poll(&self, cpu: usize) -> Option<RawRecord> {
        self.shard(cpu).rx.try_recv().ok()
    }

    /// Everything currently queued, CPU by CPU
    pub fn drain(&self) -> Vec<RawRecord> {
        self.shards
            .iter()
            .flat_map(|shard| shard.rx.try_iter())
            .collect()
    }

    /// Records queued but not yet consumed
    pub fn pending(&self) -> usize {
        self.shards.iter().map(|shard| shard.rx.len()).sum()
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Producer side of one CPU shard
pub struct CpuProducer<'a> {
    shard: &'a Shard,
    channel: &'a PerCpuChannel,
}

impl EventChannel for CpuProducer<'_> {
    fn publish<T: Pod>(&self, record: &T) -> Publish {
        let Some(raw) = RawRecord::from_bytes(bytemuck::bytes_of(record)) else {
            self.channel.dropped.fetch_add(1, Ordering::Relaxed);
            return Publish::Dropped;
        };

        match self.shard.tx.try_send(raw) {
            Ok(()) => {
                self.channel.sent.fetch_add(1, Ordering::Relaxed);
                Publish::Sent
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.channel.dropped.fetch_add(1, Ordering::Relaxed);
                Publish::Dropped
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sockwatch_common::{EventKind, Header};

    fn header(pid: u32) -> Header {
        Header::new(EventKind::Exec, pid)
    }

    #[test]
    fn test_fifo_within_cpu() {
        let channel = PerCpuChannel::new(2, 8);
        let producer = channel.producer(1);
        for pid in 1..=3 {
            assert_eq!(producer.publish(&header(pid)), Publish::Sent);
        }

        let pids = std::iter::from_fn(|| channel.poll(1))
            .map(|raw| bytemuck::pod_read_unaligned::<Header>(raw.as_bytes()).pid)
            .collect::<Vec<_>>();
        assert_eq!(pids, vec![1, 2, 3]);
        assert!(channel.poll(0).is_none());
    }

    #[test]
    fn test_full_shard_drops_without_blocking() {
        let channel = PerCpuChannel::new(1, 2);
        let producer = channel.producer(0);
        assert_eq!(producer.publish(&header(1)), Publish::Sent);
        assert_eq!(producer.publish(&header(2)), Publish::Sent);
        assert_eq!(producer.publish(&header(3)), Publish::Dropped);

        assert_eq!(channel.sent(), 2);
        assert_eq!(channel.dropped(), 1);
        assert_eq!(channel.pending(), 2);

        // consuming frees room again
        assert!(channel.poll(0).is_some());
        assert_eq!(producer.publish(&header(4)), Publish::Sent);
    }

    #[test]
    fn test_shards_are_independent() {
        let channel = PerCpuChannel::new(2, 1);
        assert_eq!(channel.producer(0).publish(&header(1)), Publish::Sent);
        assert_eq!(channel.producer(1).publish(&header(2)), Publish::Sent);
        assert_eq!(channel.producer(0).publish(&header(3)), Publish::Dropped);
        assert_eq!(channel.drain().len(), 2);
    }

    #[test]
    fn test_producer_cpu_wraps() {
        let channel = PerCpuChannel::new(2, 4);
        channel.producer(3).publish(&header(9));
        channel.producer(2).publish(&header(8));

        // poll wraps the same way, so cpu 3 and cpu 1 name one stream
        let pid = |raw: RawRecord| bytemuck::pod_read_unaligned::<Header>(raw.as_bytes()).pid;
        assert_eq!(channel.poll(3).map(pid), Some(9));
        assert_eq!(channel.poll(2).map(pid), Some(8));
        assert!(channel.poll(1).is_none());
        assert!(channel.poll(0).is_none());
    }

    #[test]
    fn test_raw_record_rejects_oversized() {
        assert!(RawRecord::from_bytes(&[0u8; MAX_RECORD_LEN + 1]).is_none());
        let raw = RawRecord::from_bytes(&[1, 2, 3]).unwrap();
        assert_eq!(raw.as_bytes(), &[1, 2, 3]);
    }
}
