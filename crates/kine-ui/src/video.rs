// crates/kine-ui/src/video.rs
//
// The video presenter: a nominal-100 Hz refresh tick that decides
// whether to display a new frame, re-blit the current one, or idle, and
// keeps the frame timer honest across pauses and seeks. Runs on the UI
// task; the only cross-thread traffic is the frame ring and the clocks.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use kine_core::sync::{
    compute_target_delay, external_speed_step, frame_duration, EXTERNAL_CLOCK_MAX_FRAMES,
    EXTERNAL_CLOCK_MIN_FRAMES, REFRESH_RATE, SYNC_THRESHOLD_MAX,
};
use kine_core::{wall_time, Master};
use kine_media::{Shared, StreamKind, SubtitleFrame, VideoFrame};

pub struct Presenter {
    force_refresh: bool,
}

impl Presenter {
    pub fn new() -> Self {
        Self {
            force_refresh: true,
        }
    }

    /// One tick. Lowers `remaining_time` to the time until the next
    /// scheduled frame (capped at REFRESH_RATE by the caller's default)
    /// and returns the frame to blit when the display should change.
    pub fn tick(&mut self, sh: &Shared, remaining_time: &mut f64) -> Option<Arc<VideoFrame>> {
        if sh.clocks.master() == Master::External && sh.realtime && !sh.is_paused() {
            check_external_clock_speed(sh);
        }

        loop {
            if sh.vframes.remaining() == 0 {
                break; // nothing queued; idle at the nominal rate
            }
            let Some(vp) = sh.vframes.peek_current() else {
                break;
            };
            // Stale: produced before the last seek. Skip without showing.
            if vp.serial != sh.videoq.serial() {
                sh.vframes.advance();
                continue;
            }
            let last = sh.vframes.peek_last().unwrap_or_else(|| Arc::clone(&vp));

            if last.serial != vp.serial {
                // First frame of a new epoch restarts the schedule.
                *sh.frame_timer.lock().unwrap() = wall_time();
            }

            if sh.is_paused() {
                break; // hold the current picture
            }

            let last_duration =
                frame_duration(last.pts, vp.pts, last.duration, sh.max_frame_duration);
            // The master never corrects toward itself: a NaN diff keeps
            // the nominal delay.
            let diff = if sh.clocks.video_is_master() {
                f64::NAN
            } else {
                sh.clocks.vidclk.get() - sh.clocks.master_value()
            };
            let delay = compute_target_delay(last_duration, diff, sh.max_frame_duration);

            let time = wall_time();
            let scheduled = *sh.frame_timer.lock().unwrap();
            if time < scheduled + delay {
                *remaining_time = remaining_time.min(scheduled + delay - time);
                break; // too early; keep showing the current frame
            }

            {
                let mut ft = sh.frame_timer.lock().unwrap();
                *ft += delay;
                if delay > 0.0 && time - *ft > SYNC_THRESHOLD_MAX {
                    // Severely behind schedule: snap rather than chase.
                    *ft = time;
                }
            }

            if !vp.pts.is_nan() {
                sh.clocks.vidclk.set(vp.pts, vp.serial);
                sh.clocks.extclk.sync_to(&sh.clocks.vidclk);
            }

            // Late drop: a queued successor whose display time already
            // passed displaces the current frame without showing it.
            let step = sh.ctrl.lock().unwrap().step;
            if sh.vframes.remaining() > 1 && !step {
                if let Some(next) = sh.vframes.peek_next() {
                    let duration =
                        frame_duration(vp.pts, next.pts, vp.duration, sh.max_frame_duration);
                    if sh.opts.framedrop.applies(sh.clocks.video_is_master())
                        && time > *sh.frame_timer.lock().unwrap() + duration
                    {
                        sh.stats.frame_drops_late.fetch_add(1, Ordering::Relaxed);
                        sh.vframes.advance();
                        continue;
                    }
                }
            }

            advance_subtitles(sh);

            sh.vframes.advance();
            self.force_refresh = true;

            if step && !sh.is_paused() {
                // Step mode: one frame shown, back to hold.
                sh.toggle_pause_inner();
            }
            break;
        }

        if self.force_refresh {
            self.force_refresh = false;
            return sh.vframes.peek_last();
        }
        None
    }

    /// The subtitle to overlay right now, if its window covers the video
    /// clock and it belongs to the current epoch.
    pub fn current_subtitle(&self, sh: &Shared) -> Option<Arc<SubtitleFrame>> {
        let sp = sh.sframes.peek_current()?;
        if sp.serial != sh.subq.serial() {
            return None;
        }
        let now = sh.clocks.vidclk.last_pts();
        sp.visible(now).then_some(sp)
    }
}

impl Default for Presenter {
    fn default() -> Self {
        Self::new()
    }
}

/// Drop subtitle frames whose display window has passed (or that a
/// successor supersedes), measured against the video clock.
fn advance_subtitles(sh: &Shared) {
    loop {
        if sh.sframes.remaining() == 0 {
            return;
        }
        let Some(sp) = sh.sframes.peek_current() else {
            return;
        };
        let next_start = sh.sframes.peek_next().map(|n| n.pts + n.start);
        let now = sh.clocks.vidclk.last_pts();
        let stale = sp.serial != sh.subq.serial();
        let passed = sp.expired(now);
        let superseded = matches!(next_start, Some(s) if !now.is_nan() && now > s);
        if stale || passed || superseded {
            sh.sframes.advance();
        } else {
            return;
        }
    }
}

/// External-clock tuner for realtime inputs: slow down when a packet
/// queue is close to empty, speed up when all are comfortably full,
/// otherwise ease back toward unity.
fn check_external_clock_speed(sh: &Shared) {
    let (video_active, audio_active) = {
        let comp = sh.comp.lock().unwrap();
        (
            comp.get(StreamKind::Video).is_some(),
            comp.get(StreamKind::Audio).is_some(),
        )
    };
    let vq = sh.videoq.stats().nb_packets;
    let aq = sh.audioq.stats().nb_packets;
    let starved = (video_active && vq <= EXTERNAL_CLOCK_MIN_FRAMES)
        || (audio_active && aq <= EXTERNAL_CLOCK_MIN_FRAMES);
    let saturated = (!video_active || vq >= EXTERNAL_CLOCK_MAX_FRAMES)
        && (!audio_active || aq >= EXTERNAL_CLOCK_MAX_FRAMES);
    let speed = sh.clocks.extclk.speed();
    let next = external_speed_step(speed, starved, saturated);
    if next != speed {
        sh.clocks.extclk.set_speed(next);
    }
}

/// How long the UI may sleep before the next tick must run.
pub fn idle_budget(remaining_time: f64) -> f64 {
    remaining_time.clamp(0.0, REFRESH_RATE)
}
