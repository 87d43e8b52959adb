// crates/kine-core/src/sync.rs
//
// A/V synchronization math and the pipeline's timing constants: master
// clock selection, target display delay for the next video frame,
// clamped inter-frame duration, and the external-clock speed tuner used
// for realtime inputs.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::clock::Clock;
use crate::options::ClockSource;

/// Below this, a sync error is not worth correcting.
pub const SYNC_THRESHOLD_MIN: f64 = 0.04;
/// Above this, correction kicks in even for short frames.
pub const SYNC_THRESHOLD_MAX: f64 = 0.1;
/// Frames longer than this are never duplicated to compensate.
pub const SYNC_FRAMEDUP_THRESHOLD: f64 = 0.1;
/// A difference this large is a stream discontinuity, not drift; no
/// correction is attempted.
pub const NOSYNC_THRESHOLD: f64 = 10.0;

/// Nominal presenter poll period (seconds): the refresh tick should run
/// at least once per this interval when idle.
pub const REFRESH_RATE: f64 = 0.01;

/// Reader backpressure: combined packet-queue budget in bytes...
pub const MAX_QUEUE_BYTES: usize = 15 * 1024 * 1024;
/// ...or every stream holding at least this many packets covering at
/// least one second of encoded duration.
pub const MIN_FRAMES: usize = 25;

/// External-clock tuning bounds and step (realtime inputs only).
pub const EXTERNAL_CLOCK_SPEED_MIN: f64 = 0.900;
pub const EXTERNAL_CLOCK_SPEED_MAX: f64 = 1.010;
pub const EXTERNAL_CLOCK_SPEED_STEP: f64 = 0.001;
/// Queue fill levels steering the tuner.
pub const EXTERNAL_CLOCK_MIN_FRAMES: usize = 2;
pub const EXTERNAL_CLOCK_MAX_FRAMES: usize = 10;

/// Which clock the others slave to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Master {
    Audio,
    Video,
    External,
}

/// Resolve the configured sync source against the streams that actually
/// exist: video falls back to audio, audio falls back to external.
pub fn select_master(preferred: ClockSource, has_video: bool, has_audio: bool) -> Master {
    match preferred {
        ClockSource::Video if has_video => Master::Video,
        ClockSource::Video if has_audio => Master::Audio,
        ClockSource::Audio if has_audio => Master::Audio,
        ClockSource::Video | ClockSource::Audio => Master::External,
        ClockSource::External => Master::External,
    }
}

/// Duration between two consecutive queued frames, clamped: a NaN,
/// non-positive or absurd (> max_frame_duration) difference falls back
/// to the current frame's stored duration.
pub fn frame_duration(
    current_pts: f64,
    next_pts: f64,
    fallback: f64,
    max_frame_duration: f64,
) -> f64 {
    let d = next_pts - current_pts;
    if d.is_nan() || d <= 0.0 || d > max_frame_duration {
        fallback
    } else {
        d
    }
}

/// Display delay for the frame about to be scheduled, given the clamped
/// duration since the previous frame and the video-vs-master clock
/// difference. Only meaningful when video is not the master (the master
/// never corrects toward itself).
pub fn compute_target_delay(last_duration: f64, diff: f64, max_frame_duration: f64) -> f64 {
    let mut delay = last_duration;
    if diff.is_nan() || diff.abs() >= max_frame_duration {
        return delay;
    }
    let sync_threshold = last_duration.clamp(SYNC_THRESHOLD_MIN, SYNC_THRESHOLD_MAX);
    if diff <= -sync_threshold {
        // Video is behind: shrink the delay to catch up.
        delay = (last_duration + diff).max(0.0);
    } else if diff >= sync_threshold && last_duration > SYNC_FRAMEDUP_THRESHOLD {
        // Video is ahead and frames are long: wait the error out rather
        // than doubling a long frame.
        delay = last_duration + diff;
    } else if diff >= sync_threshold {
        delay = 2.0 * last_duration;
    }
    delay
}

/// The three pipeline clocks plus master resolution. Stream presence is
/// kept as atomics so stream switching (which opens/closes components
/// from the UI task) re-resolves the master without locking the clocks.
pub struct ClockHub {
    pub audclk: Clock,
    pub vidclk: Clock,
    pub extclk: Clock,
    preferred: ClockSource,
    has_audio: AtomicBool,
    has_video: AtomicBool,
}

impl ClockHub {
    pub fn new(audclk: Clock, vidclk: Clock, preferred: ClockSource) -> Self {
        Self {
            audclk,
            vidclk,
            extclk: Clock::free_running(),
            preferred,
            has_audio: AtomicBool::new(false),
            has_video: AtomicBool::new(false),
        }
    }

    pub fn set_has_audio(&self, v: bool) {
        self.has_audio.store(v, Ordering::Release);
    }

    pub fn set_has_video(&self, v: bool) {
        self.has_video.store(v, Ordering::Release);
    }

    pub fn master(&self) -> Master {
        select_master(
            self.preferred,
            self.has_video.load(Ordering::Acquire),
            self.has_audio.load(Ordering::Acquire),
        )
    }

    pub fn video_is_master(&self) -> bool {
        self.master() == Master::Video
    }

    /// Current reading of whichever clock is master.
    pub fn master_value(&self) -> f64 {
        match self.master() {
            Master::Audio => self.audclk.get(),
            Master::Video => self.vidclk.get(),
            Master::External => self.extclk.get(),
        }
    }

    pub fn set_paused(&self, paused: bool) {
        self.audclk.set_paused(paused);
        self.vidclk.set_paused(paused);
        self.extclk.set_paused(paused);
    }
}

/// One tuner step for the external clock speed. `starved` = some active
/// stream's packet queue fell to ≤ EXTERNAL_CLOCK_MIN_FRAMES;
/// `saturated` = every active stream holds ≥ EXTERNAL_CLOCK_MAX_FRAMES.
/// Otherwise the speed eases back toward 1.0.
pub fn external_speed_step(current: f64, starved: bool, saturated: bool) -> f64 {
    if starved {
        (current - EXTERNAL_CLOCK_SPEED_STEP).max(EXTERNAL_CLOCK_SPEED_MIN)
    } else if saturated {
        (current + EXTERNAL_CLOCK_SPEED_STEP).min(EXTERNAL_CLOCK_SPEED_MAX)
    } else if current != 1.0 {
        current + EXTERNAL_CLOCK_SPEED_STEP * (1.0 - current) / (1.0 - current).abs()
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_FD: f64 = 10.0;

    #[test]
    fn master_falls_back_by_priority() {
        use ClockSource::*;
        assert_eq!(select_master(Audio, true, true), Master::Audio);
        assert_eq!(select_master(Audio, true, false), Master::External);
        assert_eq!(select_master(Audio, false, false), Master::External);
        assert_eq!(select_master(Video, true, false), Master::Video);
        assert_eq!(select_master(Video, false, true), Master::Audio);
        assert_eq!(select_master(Video, false, false), Master::External);
        assert_eq!(select_master(External, true, true), Master::External);
    }

    #[test]
    fn frame_duration_clamps_bad_deltas() {
        assert!((frame_duration(1.0, 1.04, 0.02, MAX_FD) - 0.04).abs() < 1e-9); // delta used
        assert_eq!(frame_duration(1.0, 1.0, 0.02, MAX_FD), 0.02); // zero delta
        assert_eq!(frame_duration(1.0, 0.5, 0.02, MAX_FD), 0.02); // negative
        assert_eq!(frame_duration(1.0, 100.0, 0.02, MAX_FD), 0.02); // discontinuity
        assert_eq!(frame_duration(f64::NAN, 1.0, 0.02, MAX_FD), 0.02);
    }

    #[test]
    fn in_band_diff_keeps_nominal_delay() {
        // |diff| below the threshold: no correction.
        let d = compute_target_delay(0.04, 0.01, MAX_FD);
        assert_eq!(d, 0.04);
    }

    #[test]
    fn behind_shrinks_delay_to_zero_floor() {
        // Video clock behind master by more than the threshold.
        let d = compute_target_delay(0.04, -0.06, MAX_FD);
        assert!((d - 0.0).abs() < 1e-9, "d = {d}");
        let d = compute_target_delay(0.04, -0.05, MAX_FD);
        assert!((d - 0.0).abs() < 1e-9 || d > 0.0);
    }

    #[test]
    fn ahead_with_long_frames_waits_out_the_error() {
        let d = compute_target_delay(0.2, 0.15, MAX_FD);
        assert!((d - 0.35).abs() < 1e-9);
    }

    #[test]
    fn ahead_with_short_frames_doubles() {
        let d = compute_target_delay(0.04, 0.06, MAX_FD);
        assert!((d - 0.08).abs() < 1e-9);
    }

    #[test]
    fn discontinuity_disables_correction() {
        let d = compute_target_delay(0.04, 50.0, MAX_FD);
        assert_eq!(d, 0.04);
        let d = compute_target_delay(0.04, f64::NAN, MAX_FD);
        assert_eq!(d, 0.04);
    }

    #[test]
    fn clock_hub_reresolves_master_on_stream_change() {
        use crate::clock::Clock;
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

        let aq: PacketQueue<NoPkt> = PacketQueue::new();
        let vq: PacketQueue<NoPkt> = PacketQueue::new();
        aq.start();
        vq.start();
        let hub = ClockHub::new(
            Clock::new(aq.serial_ref()),
            Clock::new(vq.serial_ref()),
            ClockSource::Audio,
        );
        assert_eq!(hub.master(), Master::External);
        hub.set_has_audio(true);
        hub.set_has_video(true);
        assert_eq!(hub.master(), Master::Audio);
        hub.set_has_audio(false);
        assert_eq!(hub.master(), Master::External);

        hub.audclk.set(7.5, aq.serial());
        hub.set_has_audio(true);
        assert!(!hub.master_value().is_nan());
    }

    #[test]
    fn external_speed_stays_in_bounds() {
        let mut s = 1.0;
        for _ in 0..1000 {
            s = external_speed_step(s, true, false);
            assert!(s >= EXTERNAL_CLOCK_SPEED_MIN);
        }
        for _ in 0..1000 {
            s = external_speed_step(s, false, true);
            assert!(s <= EXTERNAL_CLOCK_SPEED_MAX);
        }
    }

    #[test]
    fn external_speed_eases_back_toward_unity() {
        let low = external_speed_step(0.95, false, false);
        assert!(low > 0.95 && low < 1.0 + 1e-9);
        let high = external_speed_step(1.005, false, false);
        assert!(high < 1.005 && high > 1.0 - 1e-9);
        assert_eq!(external_speed_step(1.0, false, false), 1.0);
    }
}
