// crates/kine-media/src/demux.rs
//
// The reader: one thread that owns the demuxer, services seek requests,
// paces ingestion against queue fullness, routes packets to the three
// packet queues, and injects end-of-stream terminators at EOF.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use ffmpeg_the_third as ffmpeg;

use ffmpeg::ffi;
use ffmpeg::format::context::Input;
use ffmpeg::Rational;

use kine_core::sync::{MAX_QUEUE_BYTES, MIN_FRAMES};
use kine_core::PacketQueue;

use crate::packet::StreamPacket;
use crate::session::{PlayerEvent, SeekRequest, Shared, StreamKind};

fn q2d(r: Rational) -> f64 {
    if r.denominator() == 0 {
        0.0
    } else {
        r.numerator() as f64 / r.denominator() as f64
    }
}

/// A stream has "enough" queued when the reader need not hurry for it:
/// absent, attached picture (fed once, out of band), or ≥ MIN_FRAMES
/// packets covering more than a second of encoded duration.
fn has_enough(active: bool, attached_pic: bool, nb_packets: usize, duration_secs: f64) -> bool {
    !active || attached_pic || (nb_packets > MIN_FRAMES && (duration_secs <= 0.0 || duration_secs > 1.0))
}

/// User play-range check, all in seconds. Packets without any timestamp
/// pass (they belong to frames whose timing the decoder synthesizes).
fn in_play_range(
    user_duration: Option<f64>,
    user_start: f64,
    pkt_ts: Option<f64>,
    stream_start: f64,
) -> bool {
    let Some(limit) = user_duration else {
        return true;
    };
    let Some(ts) = pkt_ts else {
        return true;
    };
    (ts - stream_start) - user_start <= limit
}

struct SlotView {
    active:       bool,
    index:        usize,
    attached_pic: bool,
    time_base:    Rational,
    finished:     u64,
}

fn slot_view(sh: &Shared, kind: StreamKind) -> SlotView {
    let comp = sh.comp.lock().unwrap();
    match comp.get(kind) {
        Some(s) => SlotView {
            active:       true,
            index:        s.index,
            attached_pic: s.attached_pic,
            time_base:    s.time_base,
            finished:     s.finished.load(Ordering::Acquire),
        },
        None => SlotView {
            active:       false,
            index:        usize::MAX,
            attached_pic: false,
            time_base:    Rational::new(0, 1),
            finished:     0,
        },
    }
}

fn queue_has_enough(sh: &Shared, kind: StreamKind, q: &PacketQueue<StreamPacket>) -> bool {
    let v = slot_view(sh, kind);
    let stats = q.stats();
    has_enough(
        v.active,
        v.attached_pic,
        stats.nb_packets,
        stats.duration_units as f64 * q2d(v.time_base),
    )
}

fn stream_finished(
    sh: &Shared,
    kind: StreamKind,
    q: &PacketQueue<StreamPacket>,
    frames_remaining: usize,
) -> bool {
    let v = slot_view(sh, kind);
    !v.active || (v.finished == q.serial() && frames_remaining == 0)
}

/// Service a pending seek: container seek, queue flushes (each advances
/// its serial), external clock reset, attachment requeue request, and a
/// single step when paused so the picture updates.
fn service_seek(sh: &Shared, ictx: &mut Input, req: SeekRequest) {
    let (min, max, flags) = if req.by_bytes {
        (i64::MIN, i64::MAX, ffi::AVSEEK_FLAG_BYTE as i32)
    } else {
        let min = if req.rel > 0 { req.target - req.rel + 2 } else { i64::MIN };
        let max = if req.rel < 0 { req.target - req.rel - 2 } else { i64::MAX };
        (min, max, 0i32)
    };
    let ret =
        unsafe { ffi::avformat_seek_file(ictx.as_mut_ptr(), -1, min, req.target, max, flags) };
    if ret < 0 {
        eprintln!("[reader] seek to {} failed ({ret})", req.target);
        return;
    }

    {
        let comp = sh.comp.lock().unwrap();
        if comp.audio.is_some() {
            sh.audioq.flush();
        }
        if comp.subtitle.is_some() {
            sh.subq.flush();
        }
        if comp.video.is_some() {
            sh.videoq.flush();
        }
    }
    if req.by_bytes {
        sh.clocks.extclk.set(f64::NAN, 0);
    } else {
        sh.clocks
            .extclk
            .set(req.target as f64 / ffi::AV_TIME_BASE as f64, 0);
    }

    let mut ctrl = sh.ctrl.lock().unwrap();
    ctrl.attachments_req = true;
    if ctrl.paused {
        // Step one frame so the paused display lands on the target.
        drop(ctrl);
        sh.step_to_next_frame();
    }
}

/// Requeue the attached picture (album art): one ref-copied packet, then
/// a terminator so the decoder treats the still as a full stream.
fn queue_attachment(sh: &Shared, ictx: &Input) {
    let v = slot_view(sh, StreamKind::Video);
    if !v.active || !v.attached_pic {
        return;
    }
    let Some(stream) = ictx.stream(v.index) else {
        return;
    };
    let mut pkt = ffmpeg::Packet::empty();
    let ret = unsafe { ffi::av_packet_ref(pkt.as_mut_ptr(), &(*stream.as_ptr()).attached_pic) };
    if ret < 0 {
        eprintln!("[reader] attached picture ref failed ({ret})");
        return;
    }
    let _ = sh.videoq.put(StreamPacket::Data(pkt));
    let _ = sh.videoq.put(StreamPacket::Terminator);
}

pub(crate) fn read_loop(sh: Arc<Shared>, mut ictx: Input) {
    let infinite = sh.opts.infinite_buffer.unwrap_or(sh.realtime);
    let user_start = sh.opts.start_time.unwrap_or(0.0);
    let mut eof = false;
    // Plays left, counted down at each wrap; None = loop forever.
    let mut loops_left = match sh.opts.loop_count {
        0 => None,
        n => Some(n),
    };

    loop {
        // Abort and pause-change service.
        {
            let mut ctrl = sh.ctrl.lock().unwrap();
            if ctrl.abort {
                break;
            }
            if ctrl.paused != ctrl.last_paused {
                ctrl.last_paused = ctrl.paused;
                if ctrl.paused {
                    let _ = ictx.pause();
                } else {
                    let _ = ictx.play();
                }
            }
        }

        let pending_seek = sh.ctrl.lock().unwrap().seek.take();
        if let Some(req) = pending_seek {
            service_seek(&sh, &mut ictx, req);
            eof = false;
        }

        let want_attachments = {
            let mut ctrl = sh.ctrl.lock().unwrap();
            std::mem::take(&mut ctrl.attachments_req)
        };
        if want_attachments {
            queue_attachment(&sh, &ictx);
        }

        // Backpressure: bounded memory, or every stream already fed ahead.
        if !infinite {
            let total = sh.audioq.stats().byte_size
                + sh.videoq.stats().byte_size
                + sh.subq.stats().byte_size;
            let fed_ahead = queue_has_enough(&sh, StreamKind::Audio, &sh.audioq)
                && queue_has_enough(&sh, StreamKind::Video, &sh.videoq)
                && queue_has_enough(&sh, StreamKind::Subtitle, &sh.subq);
            if total > MAX_QUEUE_BYTES || fed_ahead {
                let ctrl = sh.ctrl.lock().unwrap();
                let _ = sh
                    .read_wake
                    .wait_timeout(ctrl, Duration::from_millis(10))
                    .unwrap();
                continue;
            }
        }

        // Completion: both presentation chains drained at the current
        // epoch (subtitles intentionally excluded).
        let paused = sh.ctrl.lock().unwrap().paused;
        if !paused
            && stream_finished(&sh, StreamKind::Audio, &sh.audioq, sh.aframes.remaining())
            && stream_finished(&sh, StreamKind::Video, &sh.videoq, sh.vframes.remaining())
        {
            let wrap = match &mut loops_left {
                None => true,
                Some(n) => {
                    *n -= 1;
                    *n > 0
                }
            };
            if wrap {
                eprintln!("[reader] looping to start");
                let target = (user_start * ffi::AV_TIME_BASE as f64) as i64;
                sh.ctrl.lock().unwrap().seek = Some(SeekRequest {
                    target,
                    rel: 0,
                    by_bytes: false,
                });
                continue;
            } else if sh.opts.autoexit {
                let _ = sh.events.send(PlayerEvent::Quit);
                break;
            } else {
                // Nothing left to feed; idle until a seek or quit.
                loops_left = Some(1);
                let ctrl = sh.ctrl.lock().unwrap();
                let _ = sh
                    .read_wake
                    .wait_timeout(ctrl, Duration::from_millis(10))
                    .unwrap();
                continue;
            }
        }

        match ictx.packets().next() {
            None | Some(Err(ffmpeg::Error::Eof)) => {
                if !eof {
                    eprintln!("[reader] end of input");
                    let comp = sh.comp.lock().unwrap();
                    if comp.video.is_some() {
                        let _ = sh.videoq.put(StreamPacket::Terminator);
                    }
                    if comp.audio.is_some() {
                        let _ = sh.audioq.put(StreamPacket::Terminator);
                    }
                    if comp.subtitle.is_some() {
                        let _ = sh.subq.put(StreamPacket::Terminator);
                    }
                    eof = true;
                }
                let ctrl = sh.ctrl.lock().unwrap();
                let _ = sh
                    .read_wake
                    .wait_timeout(ctrl, Duration::from_millis(10))
                    .unwrap();
            }
            Some(Err(e)) => {
                eprintln!("[reader] read error: {e}");
                if sh.opts.autoexit {
                    let _ = sh.events.send(PlayerEvent::Error(e.to_string()));
                    let _ = sh.events.send(PlayerEvent::Quit);
                    break;
                }
                let ctrl = sh.ctrl.lock().unwrap();
                let _ = sh
                    .read_wake
                    .wait_timeout(ctrl, Duration::from_millis(10))
                    .unwrap();
            }
            Some(Ok((stream, packet))) => {
                let index = stream.index();
                let ts = packet.pts().or(packet.dts());
                let tb = stream.time_base();
                let raw_start = stream.start_time();
                let start = if raw_start == ffi::AV_NOPTS_VALUE {
                    0.0
                } else {
                    raw_start as f64 * q2d(tb)
                };
                let ts_secs = ts.map(|t| t as f64 * q2d(tb));
                if !in_play_range(sh.opts.play_duration, user_start, ts_secs, start) {
                    continue;
                }

                let audio = slot_view(&sh, StreamKind::Audio);
                let video = slot_view(&sh, StreamKind::Video);
                let sub = slot_view(&sh, StreamKind::Subtitle);
                if audio.active && index == audio.index {
                    let _ = sh.audioq.put(StreamPacket::Data(packet));
                } else if video.active && index == video.index && !video.attached_pic {
                    let _ = sh.videoq.put(StreamPacket::Data(packet));
                } else if sub.active && index == sub.index {
                    let _ = sh.subq.put(StreamPacket::Data(packet));
                }
                // Anything else is dropped on the floor.
            }
        }
    }
    eprintln!("[reader] exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enough_packets_predicate() {
        // Inactive stream never blocks the reader.
        assert!(has_enough(false, false, 0, 0.0));
        // Attached picture is fed out of band.
        assert!(has_enough(true, true, 0, 0.0));
        // Needs both a packet count and a duration cushion.
        assert!(!has_enough(true, false, 10, 5.0));
        assert!(!has_enough(true, false, 30, 0.5));
        assert!(has_enough(true, false, 30, 1.5));
        // Unknown duration: count alone decides.
        assert!(has_enough(true, false, 30, 0.0));
    }

    #[test]
    fn play_range_filter() {
        // No duration limit: everything passes.
        assert!(in_play_range(None, 0.0, Some(1e9), 0.0));
        // Timestampless packets pass.
        assert!(in_play_range(Some(5.0), 0.0, None, 0.0));
        // Within range.
        assert!(in_play_range(Some(5.0), 0.0, Some(4.9), 0.0));
        assert!(!in_play_range(Some(5.0), 0.0, Some(5.1), 0.0));
        // User start shifts the window.
        assert!(in_play_range(Some(5.0), 10.0, Some(14.9), 0.0));
        assert!(!in_play_range(Some(5.0), 10.0, Some(15.1), 0.0));
        // Stream start offset is subtracted first.
        assert!(in_play_range(Some(5.0), 0.0, Some(104.0), 100.0));
        assert!(!in_play_range(Some(5.0), 0.0, Some(106.0), 100.0));
    }
}
