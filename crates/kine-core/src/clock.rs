// crates/kine-core/src/clock.rs
//
// The clock model: (pts, pts_drift, last_updated, speed, paused, serial).
// A clock is updated by exactly one task (audio callback, video presenter,
// or reader) and read by the others; coherence across seeks comes from the
// serial check against the paired packet queue, not from locking the
// writer and readers together.

use std::sync::{Mutex, OnceLock};
use std::time::Instant;

use crate::packet_queue::{Serial, SerialRef};
use crate::sync::NOSYNC_THRESHOLD;

/// Monotonic wall time in seconds since the first call in this process.
pub fn wall_time() -> f64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_secs_f64()
}

struct ClockState {
    pts:          f64,
    pts_drift:    f64, // pts - wall time at the moment of set
    last_updated: f64,
    speed:        f64,
    paused:       bool,
    serial:       Serial,
}

pub struct Clock {
    state: Mutex<ClockState>,
    /// Serial of the paired packet queue. None = free-running (the
    /// external clock), which can never go stale.
    queue_serial: Option<SerialRef>,
}

impl Clock {
    /// Clock paired with a packet queue; reads go undefined (NaN) whenever
    /// the stored serial no longer matches the queue's.
    pub fn new(queue_serial: SerialRef) -> Self {
        Self::build(Some(queue_serial))
    }

    /// Free-running clock (the external clock references its own serial).
    pub fn free_running() -> Self {
        Self::build(None)
    }

    fn build(queue_serial: Option<SerialRef>) -> Self {
        Self {
            state: Mutex::new(ClockState {
                pts:          f64::NAN,
                pts_drift:    f64::NAN,
                last_updated: wall_time(),
                speed:        1.0,
                paused:       false,
                serial:       0,
            }),
            queue_serial,
        }
    }

    /// Current clock value, or NaN while undefined (stale serial or never
    /// set). While paused, returns the captured pts.
    pub fn get(&self) -> f64 {
        let s = self.state.lock().unwrap();
        if let Some(qs) = &self.queue_serial {
            if qs.get() != s.serial {
                return f64::NAN;
            }
        }
        if s.paused {
            s.pts
        } else {
            let time = wall_time();
            s.pts_drift + time - (time - s.last_updated) * (1.0 - s.speed)
        }
    }

    pub fn set_at(&self, pts: f64, serial: Serial, time: f64) {
        let mut s = self.state.lock().unwrap();
        s.pts = pts;
        s.last_updated = time;
        s.pts_drift = pts - time;
        s.serial = serial;
    }

    pub fn set(&self, pts: f64, serial: Serial) {
        self.set_at(pts, serial, wall_time());
    }

    /// Change speed without a discontinuity: re-anchor at the current
    /// reading first, then adopt the new rate.
    pub fn set_speed(&self, speed: f64) {
        let (pts, serial) = {
            let s = self.state.lock().unwrap();
            (s.pts, s.serial)
        };
        let current = self.get();
        let anchor = if current.is_nan() { pts } else { current };
        self.set(anchor, serial);
        self.state.lock().unwrap().speed = speed;
    }

    pub fn speed(&self) -> f64 {
        self.state.lock().unwrap().speed
    }

    pub fn set_paused(&self, paused: bool) {
        self.state.lock().unwrap().paused = paused;
    }

    /// Serial of the last update.
    pub fn serial(&self) -> Serial {
        self.state.lock().unwrap().serial
    }

    /// Last explicitly set pts (no drift extrapolation).
    pub fn last_pts(&self) -> f64 {
        self.state.lock().unwrap().pts
    }

    pub fn last_updated(&self) -> f64 {
        self.state.lock().unwrap().last_updated
    }

    /// Adopt `slave`'s reading if this clock is undefined or has drifted
    /// past the no-sync threshold from it.
    pub fn sync_to(&self, slave: &Clock) {
        let own = self.get();
        let other = slave.get();
        if !other.is_nan() && (own.is_nan() || (own - other).abs() > NOSYNC_THRESHOLD) {
            self.set(other, slave.serial());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet_queue::{PacketItem, PacketQueue};

    struct NoPkt;
    impl PacketItem for NoPkt {
        fn byte_size(&self) -> usize {
            0
        }
        fn duration_units(&self) -> i64 {
            0
        }
    }

    fn started_queue() -> PacketQueue<NoPkt> {
        let q = PacketQueue::new();
        q.start();
        q
    }

    #[test]
    fn unset_clock_reads_nan() {
        let q = started_queue();
        let c = Clock::new(q.serial_ref());
        assert!(c.get().is_nan());
    }

    #[test]
    fn set_then_get_tracks_wall_time() {
        let q = started_queue();
        let c = Clock::new(q.serial_ref());
        let t0 = wall_time();
        c.set_at(5.0, q.serial(), t0);
        let v = c.get();
        // get() == 5.0 + (now - t0); now ≥ t0 so v ≥ 5.0, and the test
        // body runs in far less than 100 ms.
        assert!(v >= 5.0 && v < 5.1, "v = {v}");
    }

    #[test]
    fn stale_serial_reads_nan() {
        let q = started_queue();
        let c = Clock::new(q.serial_ref());
        c.set(1.0, q.serial());
        assert!(!c.get().is_nan());
        q.flush(); // seek: epoch advances
        assert!(c.get().is_nan());
        c.set(2.0, q.serial());
        assert!(!c.get().is_nan());
    }

    #[test]
    fn paused_clock_returns_captured_pts() {
        let q = started_queue();
        let c = Clock::new(q.serial_ref());
        c.set(3.0, q.serial());
        c.set_paused(true);
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(c.get(), 3.0);
    }

    #[test]
    fn speed_change_is_continuous() {
        let c = Clock::free_running();
        c.set(10.0, 1);
        let before = c.get();
        c.set_speed(1.01);
        let after = c.get();
        assert!((after - before).abs() < 0.01, "jump = {}", after - before);
        assert_eq!(c.speed(), 1.01);
    }

    #[test]
    fn free_running_clock_never_goes_stale() {
        let c = Clock::free_running();
        c.set(0.0, 42);
        assert!(!c.get().is_nan());
    }

    #[test]
    fn sync_to_adopts_when_undefined_or_far() {
        let q = started_queue();
        let master = Clock::new(q.serial_ref());
        master.set(100.0, q.serial());

        let ext = Clock::free_running();
        assert!(ext.get().is_nan());
        ext.sync_to(&master);
        assert!((ext.get() - 100.0).abs() < 0.1);

        // Small drift is left alone.
        ext.set(100.5, master.serial());
        ext.sync_to(&master);
        assert!((ext.get() - 100.5).abs() < 0.1);

        // Past the no-sync threshold it snaps.
        ext.set(500.0, master.serial());
        ext.sync_to(&master);
        assert!((ext.get() - 100.0).abs() < 0.1);
    }
}
