// crates/kine-media/src/decode.rs
//
// Decoder drivers: one thread per stream kind, pulling packets from the
// stream's packet queue, feeding the codec, and pushing decoded frames
// into the frame ring. Epoch discipline: a popped packet whose serial
// differs from the last-fed serial flushes the codec; packets from a
// previous epoch are dropped unseen.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ffmpeg_the_third as ffmpeg;

use ffmpeg::codec::subtitle::Rect;
use ffmpeg::decoder;
use ffmpeg::frame;
use ffmpeg::util::error::EAGAIN;
use ffmpeg::Rational;
use ffmpeg::Rescale;

use kine_core::sync::NOSYNC_THRESHOLD;
use kine_core::{wall_time, PacketGet, PtsPolicy, Serial};

use crate::filter::{AudioFilterGraph, VideoFilterGraph};
use crate::frame::{AudioFrame, SubtitleFrame, SubtitleRect, VideoFrame};
use crate::packet::StreamPacket;
use crate::session::{Shared, StreamKind};

fn q2d(r: Rational) -> f64 {
    if r.denominator() == 0 {
        0.0
    } else {
        r.numerator() as f64 / r.denominator() as f64
    }
}

/// Pop the next packet belonging to the queue's current epoch, waking the
/// reader when the queue runs dry. None = queue aborted, decoder exits.
fn fetch_packet(sh: &Shared, which: StreamKind) -> Option<(StreamPacket, Serial)> {
    let q = sh.queue(which);
    loop {
        if q.stats().nb_packets == 0 {
            sh.wake_reader();
        }
        match q.get(true) {
            PacketGet::Packet(pkt, serial) => {
                // Packets enqueued before the last flush are stale.
                if serial != q.serial() {
                    continue;
                }
                return Some((pkt, serial));
            }
            PacketGet::Aborted => return None,
            PacketGet::Empty => unreachable!("blocking get never returns Empty"),
        }
    }
}

// ── Video ─────────────────────────────────────────────────────────────────────

pub(crate) struct VideoDecoderCtx {
    pub shared:     Arc<Shared>,
    pub finished:   Arc<AtomicU64>,
    pub time_base:  Rational,
    pub frame_rate: Rational,
    pub rotation:   f64,
}

pub(crate) fn video_decoder_loop(ctx: VideoDecoderCtx, mut dec: decoder::Video) {
    let sh = &ctx.shared;
    let rotation = if sh.opts.autorotate { ctx.rotation } else { 0.0 };
    let mut graph = VideoFilterGraph::new(ctx.time_base, rotation);
    let mut pkt_serial: Serial = 0;
    let mut last_filter_delay = 0.0f64;

    let frame_duration = if ctx.frame_rate.numerator() != 0 {
        q2d(Rational::new(
            ctx.frame_rate.denominator(),
            ctx.frame_rate.numerator(),
        ))
    } else {
        0.0
    };

    'outer: loop {
        // Drain phase: pull every ready frame for the current epoch.
        if pkt_serial != 0 && pkt_serial == sh.videoq.serial() {
            loop {
                if sh.videoq.is_aborted() {
                    break 'outer;
                }
                let mut decoded = frame::Video::empty();
                match dec.receive_frame(&mut decoded) {
                    Ok(()) => {
                        match sh.opts.pts_policy {
                            PtsPolicy::BestEffort => decoded.set_pts(decoded.timestamp()),
                            PtsPolicy::RawPts => {}
                            PtsPolicy::Dts => {
                                let dts = unsafe { (*decoded.as_ptr()).pkt_dts };
                                decoded.set_pts(if dts == ffmpeg::ffi::AV_NOPTS_VALUE {
                                    None
                                } else {
                                    Some(dts)
                                });
                            }
                        }
                        if !process_video_frame(
                            sh,
                            &mut graph,
                            decoded,
                            pkt_serial,
                            ctx.time_base,
                            frame_duration,
                            &mut last_filter_delay,
                        ) {
                            break 'outer;
                        }
                    }
                    Err(ffmpeg::Error::Other { errno: EAGAIN }) => break,
                    Err(ffmpeg::Error::Eof) => {
                        ctx.finished.store(pkt_serial, Ordering::Release);
                        dec.flush();
                        break;
                    }
                    Err(e) => {
                        eprintln!("[video] decode error: {e}");
                        break 'outer;
                    }
                }
            }
        }

        // Feed phase.
        let Some((pkt, serial)) = fetch_packet(sh, StreamKind::Video) else {
            break;
        };
        if serial != pkt_serial && pkt_serial != 0 {
            // Epoch changed under us: drop codec state from the old one.
            dec.flush();
            ctx.finished.store(0, Ordering::Release);
        }
        pkt_serial = serial;
        match pkt {
            StreamPacket::Data(p) => {
                if let Err(e) = dec.send_packet(&p) {
                    eprintln!("[video] send_packet: {e}");
                }
            }
            StreamPacket::Terminator => {
                let _ = dec.send_eof();
            }
        }
    }
    eprintln!("[video] decoder exiting");
}

/// Early drop, filter, convert, enqueue. Returns false when the frame
/// ring aborts (decoder should exit).
#[allow(clippy::too_many_arguments)]
fn process_video_frame(
    sh: &Shared,
    graph: &mut VideoFilterGraph,
    decoded: frame::Video,
    serial: Serial,
    time_base: Rational,
    nominal_duration: f64,
    last_filter_delay: &mut f64,
) -> bool {
    let dpts = match decoded.pts() {
        Some(p) => p as f64 * q2d(time_base),
        None => f64::NAN,
    };

    // Early drop: trim decode output before it costs filter + queue work.
    // Only when video slaves to another clock, and never across a
    // discontinuity.
    if sh.opts.framedrop.applies(sh.clocks.video_is_master()) && !dpts.is_nan() {
        let diff = dpts - sh.clocks.master_value();
        if diff.is_finite()
            && diff.abs() < NOSYNC_THRESHOLD
            && diff - *last_filter_delay < 0.0
            && serial == sh.clocks.vidclk.serial()
            && sh.videoq.stats().nb_packets > 0
        {
            sh.stats.frame_drops_early.fetch_add(1, Ordering::Relaxed);
            return true;
        }
    }

    let vfilter = {
        let ctrl = sh.ctrl.lock().unwrap();
        sh.opts.video_filters.get(ctrl.vfilter_index).cloned()
    };

    let filter_start = wall_time();
    if let Err(e) = graph.reconfigure_if_needed(&decoded, serial, vfilter.as_deref()) {
        eprintln!("[video] filter reconfigure: {e}");
        return false;
    }
    if let Err(e) = graph.push(&decoded) {
        eprintln!("[video] filter push: {e}");
        return false;
    }

    loop {
        let mut filtered = frame::Video::empty();
        match graph.pull(&mut filtered) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                eprintln!("[video] filter pull: {e}");
                return false;
            }
        }
        *last_filter_delay = wall_time() - filter_start;
        if *last_filter_delay > 1.0 / 10.0 {
            // A stalled filter chain should not poison the drop logic.
            *last_filter_delay = 0.0;
        }

        let sink_tb = graph.sink_time_base();
        let pts = match filtered.pts() {
            Some(p) => p as f64 * q2d(sink_tb),
            None => f64::NAN,
        };
        let pos = unsafe { (*filtered.as_ptr()).pkt_pos };
        let vf = match rgba_frame(&filtered, pts, nominal_duration, pos, serial) {
            Some(vf) => vf,
            None => {
                eprintln!("[video] unexpected sink format, frame skipped");
                continue;
            }
        };
        if sh.vframes.push(vf).is_err() {
            return false;
        }
    }
    true
}

/// Destripe the RGBA sink frame into a tightly packed buffer. A negative
/// source stride is copied in storage order (image lands bottom-up) and
/// flagged for a vertical flip at blit time.
fn rgba_frame(
    filtered: &frame::Video,
    pts: f64,
    duration: f64,
    pos: i64,
    serial: Serial,
) -> Option<VideoFrame> {
    if filtered.format() != ffmpeg::format::Pixel::RGBA {
        return None;
    }
    let w = filtered.width();
    let h = filtered.height();
    let row_bytes = w as usize * 4;
    let linesize = unsafe { (*filtered.as_ptr()).linesize[0] };

    let (data, flip_v) = if linesize >= 0 {
        let stride = linesize as usize;
        let raw = filtered.data(0);
        let mut out = Vec::with_capacity(row_bytes * h as usize);
        for row in 0..h as usize {
            out.extend_from_slice(&raw[row * stride..row * stride + row_bytes]);
        }
        (out, false)
    } else {
        // Rows run upward in memory; copy ascending and let the blit flip.
        let stride = (-linesize) as usize;
        let mut out = Vec::with_capacity(row_bytes * h as usize);
        unsafe {
            let top = (*filtered.as_ptr()).data[0];
            let base = top.offset(linesize as isize * (h as isize - 1));
            for row in 0..h as usize {
                let src = base.add(row * stride);
                out.extend_from_slice(std::slice::from_raw_parts(src, row_bytes));
            }
        }
        (out, true)
    };

    let sar = filtered.aspect_ratio();
    let sar = if sar.numerator() > 0 && sar.denominator() > 0 {
        q2d(sar)
    } else {
        1.0
    };
    Some(VideoFrame::new(
        data, w, h, sar, pts, duration, pos, serial, flip_v,
    ))
}

// ── Audio ─────────────────────────────────────────────────────────────────────

pub(crate) struct AudioDecoderCtx {
    pub shared:    Arc<Shared>,
    pub finished:  Arc<AtomicU64>,
    pub time_base: Rational,
    pub graph:     AudioFilterGraph,
    pub start_pts: Option<i64>,
}

pub(crate) fn audio_decoder_loop(ctx: AudioDecoderCtx, mut dec: decoder::Audio) {
    let sh = &ctx.shared;
    let mut graph = ctx.graph;
    let mut pkt_serial: Serial = 0;
    // Synthesized pts chain in {1, sample_rate} units for frames without
    // timestamps.
    let mut next_pts: Option<i64> = ctx.start_pts;
    let mut next_pts_tb = ctx.time_base;

    'outer: loop {
        if pkt_serial != 0 && pkt_serial == sh.audioq.serial() {
            loop {
                if sh.audioq.is_aborted() {
                    break 'outer;
                }
                let mut decoded = frame::Audio::empty();
                match dec.receive_frame(&mut decoded) {
                    Ok(()) => {
                        let rate = decoded.rate();
                        let tb = Rational::new(1, rate as i32);
                        match decoded.pts() {
                            Some(p) => decoded.set_pts(Some(p.rescale(ctx.time_base, tb))),
                            None => {
                                if let Some(np) = next_pts {
                                    decoded.set_pts(Some(np.rescale(next_pts_tb, tb)));
                                }
                            }
                        }
                        if let Some(p) = decoded.pts() {
                            next_pts = Some(p + decoded.samples() as i64);
                            next_pts_tb = tb;
                        }
                        if !process_audio_frame(sh, &mut graph, decoded, pkt_serial) {
                            break 'outer;
                        }
                    }
                    Err(ffmpeg::Error::Other { errno: EAGAIN }) => break,
                    Err(ffmpeg::Error::Eof) => {
                        ctx.finished.store(pkt_serial, Ordering::Release);
                        dec.flush();
                        break;
                    }
                    Err(e) => {
                        eprintln!("[audio] decode error: {e}");
                        break 'outer;
                    }
                }
            }
        }

        let Some((pkt, serial)) = fetch_packet(sh, StreamKind::Audio) else {
            break;
        };
        if serial != pkt_serial && pkt_serial != 0 {
            dec.flush();
            ctx.finished.store(0, Ordering::Release);
            next_pts = ctx.start_pts;
            next_pts_tb = ctx.time_base;
        }
        pkt_serial = serial;
        match pkt {
            StreamPacket::Data(p) => {
                if let Err(e) = dec.send_packet(&p) {
                    eprintln!("[audio] send_packet: {e}");
                }
            }
            StreamPacket::Terminator => {
                let _ = dec.send_eof();
            }
        }
    }
    eprintln!("[audio] decoder exiting");
}

fn process_audio_frame(
    sh: &Shared,
    graph: &mut AudioFilterGraph,
    decoded: frame::Audio,
    serial: Serial,
) -> bool {
    if let Err(e) = graph.reconfigure_if_needed(&decoded, serial) {
        eprintln!("[audio] filter reconfigure: {e}");
        return false;
    }
    if let Err(e) = graph.push(&decoded) {
        eprintln!("[audio] filter push: {e}");
        return false;
    }
    loop {
        let mut filtered = frame::Audio::empty();
        match graph.pull(&mut filtered) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                eprintln!("[audio] filter pull: {e}");
                return false;
            }
        }
        let rate = filtered.rate();
        let samples = filtered.samples();
        let pts = match filtered.pts() {
            Some(p) => p as f64 / rate as f64,
            None => f64::NAN,
        };
        let pos = unsafe { (*filtered.as_ptr()).pkt_pos };
        let af = AudioFrame {
            frame: filtered,
            pts,
            duration: samples as f64 / rate as f64,
            pos,
            serial,
        };
        if sh.aframes.push(af).is_err() {
            return false;
        }
    }
    true
}

// ── Subtitles ─────────────────────────────────────────────────────────────────

pub(crate) struct SubtitleDecoderCtx {
    pub shared:    Arc<Shared>,
    pub finished:  Arc<AtomicU64>,
    pub time_base: Rational,
}

pub(crate) fn subtitle_decoder_loop(ctx: SubtitleDecoderCtx, mut dec: decoder::Subtitle) {
    let sh = &ctx.shared;
    let mut pkt_serial: Serial = 0;

    loop {
        let Some((pkt, serial)) = fetch_packet(sh, StreamKind::Subtitle) else {
            break;
        };
        if serial != pkt_serial && pkt_serial != 0 {
            dec.flush();
        }
        pkt_serial = serial;

        let p = match pkt {
            StreamPacket::Data(p) => p,
            StreamPacket::Terminator => {
                // Subtitle codecs hold no delayed output.
                ctx.finished.store(pkt_serial, Ordering::Release);
                continue;
            }
        };

        let mut sub = ffmpeg::codec::subtitle::Subtitle::new();
        match dec.decode(&p, &mut sub) {
            Ok(true) => {
                let pts = match p.pts().or(p.dts()) {
                    Some(t) => t as f64 * q2d(ctx.time_base),
                    None => f64::NAN,
                };
                let rects: Vec<SubtitleRect> = sub.rects().map(convert_rect).collect();
                let sf = SubtitleFrame {
                    rects,
                    pts,
                    start: sub.start() as f64 / 1000.0,
                    end: sub.end() as f64 / 1000.0,
                    serial,
                };
                if sh.sframes.push(sf).is_err() {
                    break;
                }
            }
            Ok(false) => {}
            Err(e) => eprintln!("[subtitle] decode error: {e}"),
        }
    }
    eprintln!("[subtitle] decoder exiting");
}

fn convert_rect(rect: Rect<'_>) -> SubtitleRect {
    match rect {
        Rect::Text(t) => SubtitleRect {
            x:      0,
            y:      0,
            width:  0,
            height: 0,
            text:   Some(t.get().to_string()),
        },
        Rect::Ass(a) => SubtitleRect {
            x:      0,
            y:      0,
            width:  0,
            height: 0,
            text:   Some(ass_dialogue_text(a.get())),
        },
        Rect::Bitmap(b) => SubtitleRect {
            x:      b.x() as i32,
            y:      b.y() as i32,
            width:  b.width(),
            height: b.height(),
            text:   None,
        },
        Rect::None(_) => SubtitleRect {
            x:      0,
            y:      0,
            width:  0,
            height: 0,
            text:   None,
        },
    }
}

/// Pull the plain text out of an ASS dialogue event: everything after the
/// ninth comma, override blocks stripped, `\N`/`\n` as line breaks and
/// `\h` as a space.
fn ass_dialogue_text(line: &str) -> String {
    let body = line.splitn(10, ',').nth(9).unwrap_or(line);
    let mut out = String::with_capacity(body.len());
    let mut depth = 0u32;
    let mut chars = body.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '{' => depth += 1,
            '}' => depth = depth.saturating_sub(1),
            '\\' if depth == 0 => match chars.peek() {
                Some('N') | Some('n') => {
                    chars.next();
                    out.push('\n');
                }
                Some('h') => {
                    chars.next();
                    out.push(' ');
                }
                // Unknown escape: drop the backslash, keep the payload.
                _ => {}
            },
            _ if depth == 0 => out.push(ch),
            _ => {}
        }
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ass_text_extraction() {
        let line = "0,0,Default,,0,0,0,,{\\an8}Hello there";
        assert_eq!(ass_dialogue_text(line), "Hello there");
        // Fewer than nine commas: keep the tail as-is.
        assert_eq!(ass_dialogue_text("just text"), "just text");
    }

    #[test]
    fn ass_forced_line_breaks_and_hard_spaces() {
        let line = "0,0,Default,,0,0,0,,Hello\\Nthere";
        assert_eq!(ass_dialogue_text(line), "Hello\nthere");
        let line = "0,0,Default,,0,0,0,,soft\\nbreak and\\hhard space";
        assert_eq!(ass_dialogue_text(line), "soft\nbreak and hard space");
        // An unknown escape drops only the backslash.
        let line = "0,0,Default,,0,0,0,,a\\qb";
        assert_eq!(ass_dialogue_text(line), "aqb");
    }

    #[test]
    fn q2d_handles_degenerate_rationals() {
        assert_eq!(q2d(Rational::new(1, 0)), 0.0);
        assert!((q2d(Rational::new(1, 25)) - 0.04).abs() < 1e-12);
    }
}
