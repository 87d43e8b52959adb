// crates/kine-core/src/frame_queue.rs
//
// FrameQueue: small fixed-capacity ring of decoded frames between a
// decoder thread and a presenter. With `keep_last` the most recently
// presented frame stays peekable (for re-blit on expose and for
// computing the display duration against the incoming frame) until the
// next advance actually displaces it.
//
// Frames are stored as Arc so the presenter can hold the current and
// next frame across a tick while the decoder keeps writing.

use std::sync::{Arc, Condvar, Mutex};

use crate::packet_queue::{AbortRef, QueueAborted, Serial, SerialRef};

struct Ring<F> {
    slots:        Vec<Option<Arc<F>>>,
    rindex:       usize,
    windex:       usize,
    size:         usize,
    rindex_shown: usize, // 0 or 1
}

pub struct FrameQueue<F> {
    ring:        Mutex<Ring<F>>,
    cond:        Condvar,
    max_size:    usize,
    keep_last:   bool,
    pktq_abort:  AbortRef,
    pktq_serial: SerialRef,
}

impl<F> FrameQueue<F> {
    /// `abort` / `serial` come from the packet queue feeding this ring's
    /// decoder; blocking calls bail out when that queue aborts, and
    /// staleness checks compare frame serials against it.
    pub fn new(max_size: usize, keep_last: bool, abort: AbortRef, serial: SerialRef) -> Self {
        let mut slots = Vec::with_capacity(max_size);
        slots.resize_with(max_size, || None);
        Self {
            ring: Mutex::new(Ring {
                slots,
                rindex:       0,
                windex:       0,
                size:         0,
                rindex_shown: 0,
            }),
            cond: Condvar::new(),
            max_size,
            keep_last,
            pktq_abort:  abort,
            pktq_serial: serial,
        }
    }

    /// Current serial of the associated packet queue.
    pub fn queue_serial(&self) -> Serial {
        self.pktq_serial.get()
    }

    /// Blocking enqueue: waits for a free slot, then writes at `windex`.
    /// Returns Err when the associated packet queue aborts.
    pub fn push(&self, frame: F) -> Result<(), QueueAborted> {
        let mut r = self.ring.lock().unwrap();
        while r.size >= self.max_size {
            if self.pktq_abort.is_set() {
                return Err(QueueAborted);
            }
            r = self.cond.wait(r).unwrap();
        }
        if self.pktq_abort.is_set() {
            return Err(QueueAborted);
        }
        let w = r.windex;
        r.slots[w] = Some(Arc::new(frame));
        r.windex = (r.windex + 1) % self.max_size;
        r.size += 1;
        self.cond.notify_one();
        Ok(())
    }

    /// Blocking peek of the next frame to show. None on abort.
    /// The frame stays in the ring; call `advance` to consume it.
    pub fn peek_readable(&self) -> Option<Arc<F>> {
        let mut r = self.ring.lock().unwrap();
        while r.size - r.rindex_shown == 0 {
            if self.pktq_abort.is_set() {
                return None;
            }
            r = self.cond.wait(r).unwrap();
        }
        let idx = (r.rindex + r.rindex_shown) % self.max_size;
        r.slots[idx].clone()
    }

    /// Non-blocking peek of the next frame to show.
    pub fn peek_current(&self) -> Option<Arc<F>> {
        let r = self.ring.lock().unwrap();
        if r.size - r.rindex_shown == 0 {
            return None;
        }
        let idx = (r.rindex + r.rindex_shown) % self.max_size;
        r.slots[idx].clone()
    }

    /// The frame one past current (needs at least two unshown frames).
    pub fn peek_next(&self) -> Option<Arc<F>> {
        let r = self.ring.lock().unwrap();
        if r.size - r.rindex_shown < 2 {
            return None;
        }
        let idx = (r.rindex + r.rindex_shown + 1) % self.max_size;
        r.slots[idx].clone()
    }

    /// The most recently presented frame (meaningful with `keep_last`).
    pub fn peek_last(&self) -> Option<Arc<F>> {
        let r = self.ring.lock().unwrap();
        r.slots[r.rindex].clone()
    }

    /// Consume one frame. With `keep_last`, the first advance after a push
    /// only flips the shown flag — the frame remains peekable via
    /// `peek_last` until the following advance releases it.
    pub fn advance(&self) {
        let mut r = self.ring.lock().unwrap();
        if self.keep_last && r.rindex_shown == 0 {
            if r.size > 0 {
                r.rindex_shown = 1;
            }
            return;
        }
        if r.size == 0 {
            return;
        }
        let idx = r.rindex;
        r.slots[idx] = None;
        r.rindex = (r.rindex + 1) % self.max_size;
        r.size -= 1;
        self.cond.notify_one();
    }

    /// Frames queued and not yet shown.
    pub fn remaining(&self) -> usize {
        let r = self.ring.lock().unwrap();
        r.size - r.rindex_shown
    }

    /// Wake any blocked push/peek so they can observe an abort.
    pub fn wake(&self) {
        self.cond.notify_all();
    }

    /// Drop every queued frame and reset the indices. Used when a stream
    /// component closes (the seek path does NOT flush frame rings — stale
    /// frames are skipped by serial on the presenter side).
    pub fn drain(&self) {
        let mut r = self.ring.lock().unwrap();
        for slot in r.slots.iter_mut() {
            *slot = None;
        }
        r.rindex = 0;
        r.windex = 0;
        r.size = 0;
        r.rindex_shown = 0;
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet_queue::{PacketItem, PacketQueue};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    struct NoPkt;
    impl PacketItem for NoPkt {
        fn byte_size(&self) -> usize {
            0
        }
        fn duration_units(&self) -> i64 {
            0
        }
    }

    #[derive(Debug, PartialEq)]
    struct Fr(u32);

    fn queue(max: usize, keep_last: bool) -> (PacketQueue<NoPkt>, FrameQueue<Fr>) {
        let pq: PacketQueue<NoPkt> = PacketQueue::new();
        pq.start();
        let fq = FrameQueue::new(max, keep_last, pq.abort_ref(), pq.serial_ref());
        (pq, fq)
    }

    #[test]
    fn push_then_peek_current() {
        let (_pq, fq) = queue(3, true);
        fq.push(Fr(1)).unwrap();
        assert_eq!(fq.remaining(), 1);
        assert_eq!(fq.peek_current().unwrap().0, 1);
        // Peeking does not consume.
        assert_eq!(fq.remaining(), 1);
    }

    #[test]
    fn keep_last_first_advance_only_marks_shown() {
        let (_pq, fq) = queue(3, true);
        fq.push(Fr(1)).unwrap();
        fq.push(Fr(2)).unwrap();

        fq.advance(); // shows frame 1, keeps it peekable
        assert_eq!(fq.remaining(), 1);
        assert_eq!(fq.peek_last().unwrap().0, 1);
        assert_eq!(fq.peek_current().unwrap().0, 2);

        fq.advance(); // releases frame 1, frame 2 becomes "last"
        assert_eq!(fq.remaining(), 0);
        assert_eq!(fq.peek_last().unwrap().0, 2);
        assert!(fq.peek_current().is_none());
    }

    #[test]
    fn without_keep_last_advance_consumes_immediately() {
        let (_pq, fq) = queue(3, false);
        fq.push(Fr(1)).unwrap();
        fq.push(Fr(2)).unwrap();
        fq.advance();
        assert_eq!(fq.remaining(), 1);
        assert_eq!(fq.peek_current().unwrap().0, 2);
    }

    #[test]
    fn peek_next_requires_two_unshown() {
        let (_pq, fq) = queue(3, true);
        fq.push(Fr(1)).unwrap();
        assert!(fq.peek_next().is_none());
        fq.push(Fr(2)).unwrap();
        assert_eq!(fq.peek_next().unwrap().0, 2);
    }

    #[test]
    fn remaining_never_exceeds_capacity() {
        let (_pq, fq) = queue(3, true);
        fq.push(Fr(1)).unwrap();
        fq.push(Fr(2)).unwrap();
        fq.push(Fr(3)).unwrap();
        assert_eq!(fq.remaining(), 3);
        fq.advance();
        // size stays 3 (keep_last holds the shown frame), remaining drops.
        assert_eq!(fq.remaining(), 2);
    }

    #[test]
    fn full_ring_blocks_push_until_advance() {
        let (_pq, fq) = queue(2, false);
        let fq = Arc::new(fq);
        fq.push(Fr(1)).unwrap();
        fq.push(Fr(2)).unwrap();

        let fq2 = Arc::clone(&fq);
        let h = thread::spawn(move || fq2.push(Fr(3)).is_ok());
        thread::sleep(Duration::from_millis(30));
        fq.advance();
        assert!(h.join().unwrap());
        assert_eq!(fq.remaining(), 2);
    }

    #[test]
    fn abort_unblocks_reader_and_writer() {
        let (pq, fq) = queue(1, false);
        let fq = Arc::new(fq);
        fq.push(Fr(1)).unwrap();

        let fq_w = Arc::clone(&fq);
        let writer = thread::spawn(move || fq_w.push(Fr(2)).is_err());
        thread::sleep(Duration::from_millis(30));
        pq.abort();
        fq.wake();
        assert!(writer.join().unwrap());

        let fq_r = Arc::clone(&fq);
        let reader = thread::spawn(move || {
            // ring still holds Fr(1), so consume it first, then block
            fq_r.advance();
            fq_r.peek_readable().is_none()
        });
        fq.wake();
        assert!(reader.join().unwrap());
    }

    #[test]
    fn wraparound_preserves_fifo() {
        let (_pq, fq) = queue(3, false);
        for i in 1..=3 {
            fq.push(Fr(i)).unwrap();
        }
        fq.advance();
        fq.advance();
        fq.push(Fr(4)).unwrap();
        fq.push(Fr(5)).unwrap();
        let order: Vec<u32> = std::iter::from_fn(|| {
            let f = fq.peek_current().map(|f| f.0);
            fq.advance();
            f
        })
        .take(3)
        .collect();
        assert_eq!(order, vec![3, 4, 5]);
    }
}
