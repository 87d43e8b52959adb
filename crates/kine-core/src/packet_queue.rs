// crates/kine-core/src/packet_queue.rs
//
// PacketQueue: bounded thread-safe FIFO of encoded packets with epoch
// (serial) discipline. The reader puts, one decoder gets. A flush drains
// everything and increments the serial; consumers detect the new epoch
// through the serial attached to the next packet they pop — there is no
// in-band flush sentinel.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// Epoch counter. Advanced by `flush` and `start`; live epochs are ≥ 1,
/// so 0 can be used by callers as a "never set" sentinel.
pub type Serial = u64;

/// Lock-free view of a packet queue's current serial. Handed to clocks and
/// frame queues so they can detect staleness without touching the queue
/// mutex. The cell is only ever written under the queue mutex.
#[derive(Clone)]
pub struct SerialRef(Arc<AtomicU64>);

impl SerialRef {
    pub fn get(&self) -> Serial {
        self.0.load(Ordering::Acquire)
    }
}

/// Lock-free view of a packet queue's abort flag.
#[derive(Clone)]
pub struct AbortRef(Arc<AtomicBool>);

impl AbortRef {
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Returned by operations refused because the queue is aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueAborted;

/// Implemented by whatever the queue stores, so count/bytes/duration
/// bookkeeping stays exact without the queue knowing the packet layout.
pub trait PacketItem {
    /// Encoded payload size in bytes.
    fn byte_size(&self) -> usize;
    /// Encoded duration in stream time-base units (0 if unknown).
    fn duration_units(&self) -> i64;
}

/// Result of `PacketQueue::get`.
pub enum PacketGet<P> {
    /// A packet plus the serial it was enqueued under.
    Packet(P, Serial),
    /// Non-blocking get on an empty queue.
    Empty,
    /// The queue was aborted while (or before) waiting.
    Aborted,
}

struct Inner<P> {
    items:      VecDeque<(P, Serial)>,
    nb_packets: usize,
    byte_size:  usize,
    duration:   i64,
    serial:     Serial,
    abort:      bool,
}

/// Snapshot of the queue counters, read under the lock.
#[derive(Debug, Clone, Copy)]
pub struct PacketQueueStats {
    pub nb_packets:     usize,
    pub byte_size:      usize,
    pub duration_units: i64,
    pub serial:         Serial,
}

pub struct PacketQueue<P> {
    inner:       Mutex<Inner<P>>,
    cond:        Condvar,
    serial_cell: Arc<AtomicU64>,
    abort_cell:  Arc<AtomicBool>,
}

impl<P: PacketItem> PacketQueue<P> {
    /// A new queue starts aborted (serial 0); `start` opens it for traffic.
    /// This mirrors component startup: the decoder thread may begin pulling
    /// before the reader has called `start`, and must see Aborted, not Empty.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items:      VecDeque::new(),
                nb_packets: 0,
                byte_size:  0,
                duration:   0,
                serial:     0,
                abort:      true,
            }),
            cond:        Condvar::new(),
            serial_cell: Arc::new(AtomicU64::new(0)),
            abort_cell:  Arc::new(AtomicBool::new(true)),
        }
    }

    /// Append a packet under the current serial. Fails once aborted.
    pub fn put(&self, pkt: P) -> Result<(), QueueAborted> {
        let mut q = self.inner.lock().unwrap();
        if q.abort {
            return Err(QueueAborted);
        }
        q.nb_packets += 1;
        q.byte_size  += pkt.byte_size();
        q.duration   += pkt.duration_units();
        let serial = q.serial;
        q.items.push_back((pkt, serial));
        self.cond.notify_one();
        Ok(())
    }

    /// Pop the head packet. In blocking mode, waits until a packet arrives
    /// or the queue is aborted; non-blocking returns `Empty` immediately.
    pub fn get(&self, block: bool) -> PacketGet<P> {
        let mut q = self.inner.lock().unwrap();
        loop {
            if q.abort {
                return PacketGet::Aborted;
            }
            if let Some((pkt, serial)) = q.items.pop_front() {
                q.nb_packets -= 1;
                q.byte_size  -= pkt.byte_size();
                q.duration   -= pkt.duration_units();
                return PacketGet::Packet(pkt, serial);
            }
            if !block {
                return PacketGet::Empty;
            }
            q = self.cond.wait(q).unwrap();
        }
    }

    /// Drain all queued packets, zero the counters, advance the epoch.
    pub fn flush(&self) {
        let mut q = self.inner.lock().unwrap();
        q.items.clear();
        q.nb_packets = 0;
        q.byte_size  = 0;
        q.duration   = 0;
        q.serial += 1;
        self.serial_cell.store(q.serial, Ordering::Release);
    }

    /// Clear the abort flag and open a fresh epoch.
    pub fn start(&self) {
        let mut q = self.inner.lock().unwrap();
        q.abort = false;
        self.abort_cell.store(false, Ordering::Release);
        q.serial += 1;
        self.serial_cell.store(q.serial, Ordering::Release);
        self.cond.notify_all();
    }

    /// Set the abort flag and wake all waiters. Subsequent put/get fail
    /// until `start` is called again.
    pub fn abort(&self) {
        let mut q = self.inner.lock().unwrap();
        q.abort = true;
        self.abort_cell.store(true, Ordering::Release);
        self.cond.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.abort_cell.load(Ordering::Acquire)
    }

    /// Current epoch, without taking the lock.
    pub fn serial(&self) -> Serial {
        self.serial_cell.load(Ordering::Acquire)
    }

    pub fn serial_ref(&self) -> SerialRef {
        SerialRef(Arc::clone(&self.serial_cell))
    }

    pub fn abort_ref(&self) -> AbortRef {
        AbortRef(Arc::clone(&self.abort_cell))
    }

    pub fn stats(&self) -> PacketQueueStats {
        let q = self.inner.lock().unwrap();
        PacketQueueStats {
            nb_packets:     q.nb_packets,
            byte_size:      q.byte_size,
            duration_units: q.duration,
            serial:         q.serial,
        }
    }
}

impl<P: PacketItem> Default for PacketQueue<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    struct FakePkt {
        bytes: usize,
        dur:   i64,
    }

    impl PacketItem for FakePkt {
        fn byte_size(&self) -> usize {
            self.bytes
        }
        fn duration_units(&self) -> i64 {
            self.dur
        }
    }

    fn pkt(bytes: usize, dur: i64) -> FakePkt {
        FakePkt { bytes, dur }
    }

    #[test]
    fn new_queue_is_aborted_until_started() {
        let q: PacketQueue<FakePkt> = PacketQueue::new();
        assert!(q.put(pkt(10, 1)).is_err());
        assert!(matches!(q.get(false), PacketGet::Aborted));
        q.start();
        assert!(q.put(pkt(10, 1)).is_ok());
    }

    #[test]
    fn fifo_order_and_counters() {
        let q: PacketQueue<FakePkt> = PacketQueue::new();
        q.start();
        q.put(pkt(100, 10)).unwrap();
        q.put(pkt(200, 20)).unwrap();
        q.put(pkt(300, 30)).unwrap();

        let s = q.stats();
        assert_eq!(s.nb_packets, 3);
        assert_eq!(s.byte_size, 600);
        assert_eq!(s.duration_units, 60);

        match q.get(false) {
            PacketGet::Packet(p, serial) => {
                assert_eq!(p.bytes, 100);
                assert_eq!(serial, q.serial());
            }
            _ => panic!("expected packet"),
        }
        let s = q.stats();
        assert_eq!(s.nb_packets, 2);
        assert_eq!(s.byte_size, 500);
        assert_eq!(s.duration_units, 50);
    }

    #[test]
    fn serial_is_nondecreasing_across_start_and_flush() {
        let q: PacketQueue<FakePkt> = PacketQueue::new();
        let mut last = q.serial();
        q.start();
        assert!(q.serial() > last);
        last = q.serial();
        for _ in 0..5 {
            q.flush();
            assert!(q.serial() > last);
            last = q.serial();
        }
    }

    #[test]
    fn flush_empties_and_advances_epoch() {
        let q: PacketQueue<FakePkt> = PacketQueue::new();
        q.start();
        let before = q.serial();
        q.put(pkt(64, 5)).unwrap();
        q.put(pkt(64, 5)).unwrap();
        q.flush();

        let s = q.stats();
        assert_eq!(s.nb_packets, 0);
        assert_eq!(s.byte_size, 0);
        assert_eq!(s.duration_units, 0);
        assert_eq!(s.serial, before + 1);
        assert!(matches!(q.get(false), PacketGet::Empty));
    }

    #[test]
    fn packets_carry_the_serial_they_were_enqueued_under() {
        let q: PacketQueue<FakePkt> = PacketQueue::new();
        q.start();
        let first_epoch = q.serial();
        q.put(pkt(1, 0)).unwrap();
        // A put that races a flush lands in the new epoch; one enqueued
        // before keeps the old serial. Here the queue is flushed with one
        // packet inside, so the pre-flush packet is simply gone.
        q.flush();
        q.put(pkt(2, 0)).unwrap();
        match q.get(false) {
            PacketGet::Packet(p, serial) => {
                assert_eq!(p.bytes, 2);
                assert_eq!(serial, first_epoch + 1);
            }
            _ => panic!("expected packet"),
        }
    }

    #[test]
    fn abort_unblocks_a_waiting_consumer() {
        let q: Arc<PacketQueue<FakePkt>> = Arc::new(PacketQueue::new());
        q.start();
        let q2 = Arc::clone(&q);
        let h = thread::spawn(move || matches!(q2.get(true), PacketGet::Aborted));
        thread::sleep(Duration::from_millis(30));
        q.abort();
        assert!(h.join().unwrap());
    }

    #[test]
    fn blocking_get_wakes_on_put() {
        let q: Arc<PacketQueue<FakePkt>> = Arc::new(PacketQueue::new());
        q.start();
        let q2 = Arc::clone(&q);
        let h = thread::spawn(move || match q2.get(true) {
            PacketGet::Packet(p, _) => p.bytes,
            _ => 0,
        });
        thread::sleep(Duration::from_millis(30));
        q.put(pkt(77, 0)).unwrap();
        assert_eq!(h.join().unwrap(), 77);
    }

    #[test]
    fn serial_ref_tracks_the_queue_without_locking() {
        let q: PacketQueue<FakePkt> = PacketQueue::new();
        let sref = q.serial_ref();
        q.start();
        assert_eq!(sref.get(), q.serial());
        q.flush();
        assert_eq!(sref.get(), q.serial());
    }
}
