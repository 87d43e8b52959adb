// crates/kine-media/src/session.rs
//
// The playback session: owns the three packet queues, three frame
// rings, the clock hub, the reader and decoder threads, and the control
// surface the UI drives (pause, step, seek, stream cycling, volume).
//
// Threading: the UI task calls Session methods; the reader and decoder
// threads share the same `Shared` hub. A seek is a transaction — the UI
// sets the request fields and wakes the reader, which performs the
// container seek and flushes the packet queues (each flush advances the
// queue's serial); decoders and presenters notice the new epoch on
// their next queue interaction.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use anyhow::{anyhow, bail, Context as _, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use ffmpeg_the_third as ffmpeg;

use ffmpeg::ffi;
use ffmpeg::format;
use ffmpeg::media::Type;
use ffmpeg::Rational;

use kine_core::{wall_time, Clock, ClockHub, FrameQueue, PacketQueue, PlayerOptions, SeekMode};

use crate::audio::{AudioBackend, AudioOutput, AudioParams, AudioSource};
use crate::decode::{
    audio_decoder_loop, subtitle_decoder_loop, video_decoder_loop, AudioDecoderCtx,
    SubtitleDecoderCtx, VideoDecoderCtx,
};
use crate::demux::read_loop;
use crate::filter::AudioFilterGraph;
use crate::frame::{AudioFrame, SubtitleFrame, VideoFrame};
use crate::packet::StreamPacket;

fn q2d(r: Rational) -> f64 {
    if r.denominator() == 0 {
        0.0
    } else {
        r.numerator() as f64 / r.denominator() as f64
    }
}

// ── Shared hub ────────────────────────────────────────────────────────────────

/// Notifications surfaced to the UI event loop.
pub enum PlayerEvent {
    /// Playback finished (autoexit) or the reader died.
    Quit,
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
    Subtitle,
}

/// Pending seek, consumed by the reader. Units: AV_TIME_BASE ticks in
/// time mode, bytes in byte mode.
pub struct SeekRequest {
    pub target:   i64,
    pub rel:      i64,
    pub by_bytes: bool,
}

pub struct Control {
    pub abort:           bool,
    pub paused:          bool,
    pub last_paused:     bool,
    pub step:            bool,
    pub seek:            Option<SeekRequest>,
    pub attachments_req: bool,
    /// Which of `opts.video_filters` the video decoder applies.
    pub vfilter_index:   usize,
}

pub struct StreamSlot {
    pub index:        usize,
    pub time_base:    Rational,
    pub attached_pic: bool,
    /// Serial the decoder finished (codec EOF) at; 0 = still going.
    pub finished:     Arc<AtomicU64>,
    pub join:         Option<JoinHandle<()>>,
}

#[derive(Default)]
pub struct Components {
    pub video:    Option<StreamSlot>,
    pub audio:    Option<StreamSlot>,
    pub subtitle: Option<StreamSlot>,
}

impl Components {
    pub fn get(&self, kind: StreamKind) -> Option<&StreamSlot> {
        match kind {
            StreamKind::Video => self.video.as_ref(),
            StreamKind::Audio => self.audio.as_ref(),
            StreamKind::Subtitle => self.subtitle.as_ref(),
        }
    }

    fn take(&mut self, kind: StreamKind) -> Option<StreamSlot> {
        match kind {
            StreamKind::Video => self.video.take(),
            StreamKind::Audio => self.audio.take(),
            StreamKind::Subtitle => self.subtitle.take(),
        }
    }
}

#[derive(Default)]
pub struct Stats {
    pub frame_drops_early: AtomicU64,
    pub frame_drops_late:  AtomicU64,
}

pub struct Shared {
    pub opts: PlayerOptions,

    pub videoq: PacketQueue<StreamPacket>,
    pub audioq: PacketQueue<StreamPacket>,
    pub subq:   PacketQueue<StreamPacket>,

    pub vframes: FrameQueue<VideoFrame>,
    pub aframes: FrameQueue<AudioFrame>,
    pub sframes: FrameQueue<SubtitleFrame>,

    pub clocks: ClockHub,

    pub ctrl:      Mutex<Control>,
    /// Wakes the reader out of its bounded backpressure wait.
    pub read_wake: Condvar,

    pub comp:  Mutex<Components>,
    pub stats: Stats,

    pub events: Sender<PlayerEvent>,

    /// Wall time the currently displayed frame was scheduled for.
    pub frame_timer: Mutex<f64>,

    pub volume: AtomicI32,
    pub muted:  AtomicBool,

    pub audio_out: Arc<AudioOutput>,

    /// 10 s for containers with timestamp discontinuities, else 3600 s.
    pub max_frame_duration: f64,
    pub realtime:           bool,
    pub duration_secs:      Option<f64>,
    pub start_time_secs:    f64,
    pub byte_len:           i64,
    pub chapters:           Vec<f64>,
    pub title:              String,
}

impl Shared {
    pub(crate) fn queue(&self, kind: StreamKind) -> &PacketQueue<StreamPacket> {
        match kind {
            StreamKind::Video => &self.videoq,
            StreamKind::Audio => &self.audioq,
            StreamKind::Subtitle => &self.subq,
        }
    }

    pub fn wake_reader(&self) {
        self.read_wake.notify_one();
    }

    /// Flip the paused state, folding the pause gap into the frame timer
    /// so resuming does not trigger a catch-up burst.
    pub fn toggle_pause_inner(&self) {
        let mut ctrl = self.ctrl.lock().unwrap();
        if ctrl.paused {
            let gap = wall_time() - self.clocks.vidclk.last_updated();
            *self.frame_timer.lock().unwrap() += gap;
            self.clocks.vidclk.set_paused(false);
            let v = self.clocks.vidclk.get();
            if !v.is_nan() {
                self.clocks.vidclk.set(v, self.clocks.vidclk.serial());
            }
        }
        let e = self.clocks.extclk.get();
        if !e.is_nan() {
            self.clocks.extclk.set(e, self.clocks.extclk.serial());
        }
        ctrl.paused = !ctrl.paused;
        ctrl.step = false;
        let paused = ctrl.paused;
        drop(ctrl);
        self.clocks.set_paused(paused);
        self.wake_reader();
    }

    /// Unpause for exactly one displayed frame; the presenter re-pauses
    /// after showing it.
    pub fn step_to_next_frame(&self) {
        let paused = self.ctrl.lock().unwrap().paused;
        if paused {
            self.toggle_pause_inner();
        }
        self.ctrl.lock().unwrap().step = true;
    }

    pub fn is_paused(&self) -> bool {
        self.ctrl.lock().unwrap().paused
    }

    /// Master-clock position, falling back to the last seek target via
    /// the external clock when undefined.
    pub fn position(&self) -> f64 {
        let pos = self.clocks.master_value();
        if pos.is_nan() {
            self.clocks.extclk.last_pts()
        } else {
            pos
        }
    }

    pub fn request_seek(&self, target: i64, rel: i64, by_bytes: bool) {
        let mut ctrl = self.ctrl.lock().unwrap();
        // One seek at a time; a pending one wins (matches the transaction
        // model — the reader consumes requests, the UI posts them).
        if ctrl.seek.is_none() {
            ctrl.seek = Some(SeekRequest {
                target,
                rel,
                by_bytes,
            });
            drop(ctrl);
            self.wake_reader();
        }
    }
}

// ── Status line ───────────────────────────────────────────────────────────────

/// Snapshot for the UI overlay, assembled on demand.
pub struct StatusSnapshot {
    pub position:     f64,
    pub duration:     Option<f64>,
    pub av_diff:      Option<f64>,
    pub drops_early:  u64,
    pub drops_late:   u64,
    pub audioq_bytes: usize,
    pub videoq_bytes: usize,
    pub subq_bytes:   usize,
    pub paused:       bool,
    pub muted:        bool,
    pub volume:       i32,
}

// ── Session ───────────────────────────────────────────────────────────────────

pub struct Session {
    shared:   Arc<Shared>,
    events:   Receiver<PlayerEvent>,
    backend:  Box<dyn AudioBackend>,
    reader:   Option<JoinHandle<()>>,
    /// Stream indices per medium, for cycling.
    media_streams: MediaStreams,
    /// Per-program stream membership (multi-program transport streams);
    /// single-program containers get one entry or none.
    programs:        Vec<Vec<usize>>,
    current_program: usize,
}

#[derive(Default, Clone)]
struct MediaStreams {
    video:    Vec<usize>,
    audio:    Vec<usize>,
    subtitle: Vec<usize>,
}

impl Session {
    /// Open the container, choose streams, open components (starting
    /// their decoder threads and the audio device), and start the reader.
    pub fn open(opts: PlayerOptions, mut backend: Box<dyn AudioBackend>) -> Result<Session> {
        let mut opts = opts;
        let mut ictx =
            format::input(&opts.input).with_context(|| format!("open {}", opts.input))?;
        if opts.genpts {
            unsafe {
                (*ictx.as_mut_ptr()).flags |= ffi::AVFMT_FLAG_GENPTS as i32;
            }
        }
        if let Some(hw) = &opts.hwaccel {
            // Preference is recorded; decode stays on the software path.
            eprintln!("[session] hwaccel '{hw}' requested, using software decode");
        }

        let (discont, byte_len) = unsafe {
            let fmt_flags = (*(*ictx.as_ptr()).iformat).flags;
            let pb = (*ictx.as_ptr()).pb;
            let len = if pb.is_null() { -1 } else { ffi::avio_size(pb) };
            ((fmt_flags & ffi::AVFMT_TS_DISCONT as i32) != 0, len)
        };
        let max_frame_duration = if discont { 10.0 } else { 3600.0 };
        let realtime = is_realtime(ictx.format().name(), &opts.input);
        if opts.seek_mode == SeekMode::Auto {
            // Byte seeking only where timestamps are unreliable (and the
            // format tolerates it).
            opts.seek_mode = if discont && ictx.format().name() != "ogg" {
                SeekMode::Bytes
            } else {
                SeekMode::Time
            };
        }

        let duration_secs = {
            let d = ictx.duration();
            (d > 0).then(|| d as f64 / ffi::AV_TIME_BASE as f64)
        };
        let start_time_secs = unsafe {
            let s = (*ictx.as_ptr()).start_time;
            if s == ffi::AV_NOPTS_VALUE {
                0.0
            } else {
                s as f64 / ffi::AV_TIME_BASE as f64
            }
        };
        let chapters: Vec<f64> = ictx
            .chapters()
            .map(|ch| ch.start() as f64 * q2d(ch.time_base()))
            .collect();
        let title = ictx
            .metadata()
            .get("title")
            .map(|t| t.to_string())
            .unwrap_or_else(|| opts.input.clone());

        // Queues, frame rings, clocks. Frame rings pair with their packet
        // queue's abort/serial; ring sizes follow the pipeline contract.
        let videoq: PacketQueue<StreamPacket> = PacketQueue::new();
        let audioq: PacketQueue<StreamPacket> = PacketQueue::new();
        let subq: PacketQueue<StreamPacket> = PacketQueue::new();
        let vframes = FrameQueue::new(3, true, videoq.abort_ref(), videoq.serial_ref());
        let aframes = FrameQueue::new(9, true, audioq.abort_ref(), audioq.serial_ref());
        let sframes = FrameQueue::new(16, false, subq.abort_ref(), subq.serial_ref());
        let clocks = ClockHub::new(
            Clock::new(audioq.serial_ref()),
            Clock::new(videoq.serial_ref()),
            opts.sync,
        );

        let (tx, rx) = bounded(16);
        let shared = Arc::new(Shared {
            volume: AtomicI32::new(opts.clamped_volume()),
            muted: AtomicBool::new(opts.mute),
            opts,
            videoq,
            audioq,
            subq,
            vframes,
            aframes,
            sframes,
            clocks,
            ctrl: Mutex::new(Control {
                abort:           false,
                paused:          false,
                last_paused:     false,
                step:            false,
                seek:            None,
                attachments_req: false,
                vfilter_index:   0,
            }),
            read_wake: Condvar::new(),
            comp: Mutex::new(Components::default()),
            stats: Stats::default(),
            events: tx,
            frame_timer: Mutex::new(0.0),
            audio_out: AudioOutput::new(),
            max_frame_duration,
            realtime,
            duration_secs,
            start_time_secs,
            byte_len,
            chapters,
            title,
        });

        // Stream inventory and selection.
        let media_streams = MediaStreams {
            video:    streams_of(&ictx, Type::Video),
            audio:    streams_of(&ictx, Type::Audio),
            subtitle: streams_of(&ictx, Type::Subtitle),
        };
        let programs = program_streams(&ictx);
        let video_idx = choose_stream(&ictx, Type::Video, shared.opts.video_stream)?;
        let audio_idx = choose_stream(&ictx, Type::Audio, shared.opts.audio_stream)?;
        let sub_idx = choose_stream(&ictx, Type::Subtitle, shared.opts.subtitle_stream)?;
        if video_idx.is_none() && audio_idx.is_none() {
            bail!("{}: no audio or video stream", shared.opts.input);
        }

        if let Some(idx) = audio_idx {
            if let Err(e) = open_audio_component(&shared, &ictx, idx, backend.as_mut()) {
                eprintln!("[session] audio component failed: {e:#}");
            }
        }
        if let Some(idx) = video_idx {
            if let Err(e) = open_video_component(&shared, &ictx, idx) {
                eprintln!("[session] video component failed: {e:#}");
            }
        }
        if let Some(idx) = sub_idx {
            if let Err(e) = open_subtitle_component(&shared, &ictx, idx) {
                eprintln!("[session] subtitle component failed: {e:#}");
            }
        }
        {
            let comp = shared.comp.lock().unwrap();
            if comp.video.is_none() && comp.audio.is_none() {
                bail!("failed to open any stream component");
            }
        }

        // Initial seek request, serviced by the reader's first iteration.
        if let Some(start) = shared.opts.start_time {
            let target = ((start + shared.start_time_secs) * ffi::AV_TIME_BASE as f64) as i64;
            shared.ctrl.lock().unwrap().seek = Some(SeekRequest {
                target,
                rel:      0,
                by_bytes: false,
            });
        }

        let reader = {
            let sh = Arc::clone(&shared);
            std::thread::spawn(move || read_loop(sh, ictx))
        };
        eprintln!("[session] opened '{}'", shared.title);

        Ok(Session {
            shared,
            events: rx,
            backend,
            reader: Some(reader),
            media_streams,
            programs,
            current_program: 0,
        })
    }

    pub fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub fn events(&self) -> &Receiver<PlayerEvent> {
        &self.events
    }

    pub fn title(&self) -> &str {
        &self.shared.title
    }

    // ── Transport ────────────────────────────────────────────────────────────

    pub fn toggle_pause(&mut self) {
        self.shared.toggle_pause_inner();
        self.backend.pause(self.shared.is_paused());
    }

    /// Advance exactly one video frame, then hold. The presenter flips
    /// back to paused after the frame displays.
    pub fn step_frame(&mut self) {
        self.shared.step_to_next_frame();
    }

    pub fn toggle_mute(&self) {
        self.shared.muted.fetch_xor(true, Ordering::Relaxed);
    }

    /// Volume step in percent points, clamped to 0..=100.
    pub fn bump_volume(&self, delta: i32) {
        let v = self.shared.volume.load(Ordering::Relaxed);
        self.shared
            .volume
            .store(bumped_volume(v, delta), Ordering::Relaxed);
    }

    // ── Seeking ──────────────────────────────────────────────────────────────

    /// Relative seek by `incr` seconds (arrow keys, chapters fallback).
    pub fn seek_by(&self, incr: f64) {
        let sh = &self.shared;
        if sh.opts.seek_mode == SeekMode::Bytes {
            // Byte-rate estimate from container size, else a CD-rate guess.
            let rate = match (sh.byte_len > 0, sh.duration_secs) {
                (true, Some(d)) if d > 0.0 => sh.byte_len as f64 / d,
                _ => 180_000.0,
            };
            let pos = sh
                .vframes
                .peek_last()
                .map(|f| f.pos as f64)
                .filter(|p| *p >= 0.0)
                .unwrap_or(0.0);
            sh.request_seek((pos + incr * rate) as i64, (incr * rate) as i64, true);
            return;
        }
        let mut pos = sh.position();
        if pos.is_nan() {
            pos = sh.start_time_secs;
        }
        let target = ((pos + incr) * ffi::AV_TIME_BASE as f64) as i64;
        let rel = (incr * ffi::AV_TIME_BASE as f64) as i64;
        sh.request_seek(target.max(0), rel, false);
    }

    /// Absolute seek to a 0..=1 position in the file (mouse drag).
    pub fn seek_to_fraction(&self, frac: f64) {
        let sh = &self.shared;
        let frac = frac.clamp(0.0, 1.0);
        if sh.opts.seek_mode == SeekMode::Bytes && sh.byte_len > 0 {
            sh.request_seek((frac * sh.byte_len as f64) as i64, 0, true);
            return;
        }
        if let Some(d) = sh.duration_secs {
            let target = ((sh.start_time_secs + frac * d) * ffi::AV_TIME_BASE as f64) as i64;
            sh.request_seek(target, 0, false);
        }
    }

    /// Chapter navigation; ±10 minutes when the container has none.
    pub fn seek_chapter(&self, dir: i32) {
        let sh = &self.shared;
        if sh.chapters.is_empty() {
            self.seek_by(dir as f64 * 600.0);
            return;
        }
        let pos = sh.position();
        let current = sh
            .chapters
            .iter()
            .rposition(|&start| pos.is_finite() && pos >= start - 1e-3)
            .unwrap_or(0);
        let next = (current as i64 + dir as i64).clamp(0, sh.chapters.len() as i64 - 1) as usize;
        eprintln!("[session] seeking to chapter {next}");
        let target = (sh.chapters[next] * ffi::AV_TIME_BASE as f64) as i64;
        sh.request_seek(target, 0, false);
    }

    // ── Stream cycling ───────────────────────────────────────────────────────

    /// Close the current component of `kind` and open the next stream of
    /// that medium, wrapping around (the A/V/T keys).
    pub fn cycle_stream(&mut self, kind: StreamKind) {
        let list = match kind {
            StreamKind::Video => self.media_streams.video.clone(),
            StreamKind::Audio => self.media_streams.audio.clone(),
            StreamKind::Subtitle => self.media_streams.subtitle.clone(),
        };
        if list.is_empty() {
            return;
        }
        let current = {
            let comp = self.shared.comp.lock().unwrap();
            comp.get(kind).map(|s| s.index)
        };
        let next = match current {
            None => list[0],
            Some(cur) => {
                let at = list.iter().position(|&i| i == cur).unwrap_or(0);
                list[(at + 1) % list.len()]
            }
        };
        if Some(next) == current && list.len() == 1 {
            // Single stream of this kind: cycling is a no-op for audio and
            // video, an off-toggle would need an explicit disable state we
            // do not carry.
            return;
        }
        eprintln!("[session] cycling {kind:?} stream -> #{next}");

        close_component(&self.shared, kind);
        self.reopen_component(kind, next);
        // Land the new stream at the present position.
        self.seek_by(0.0);
    }

    /// Open a component against a fresh demuxer handle: the reader owns
    /// the live one. Component state (codec, threads) is all that
    /// changes; packet routing picks up the new index from `comp`.
    fn reopen_component(&mut self, kind: StreamKind, index: usize) {
        match format::input(&self.shared.opts.input) {
            Ok(ictx) => {
                let r = match kind {
                    StreamKind::Audio => {
                        open_audio_component(&self.shared, &ictx, index, self.backend.as_mut())
                    }
                    StreamKind::Video => open_video_component(&self.shared, &ictx, index),
                    StreamKind::Subtitle => open_subtitle_component(&self.shared, &ictx, index),
                };
                if let Err(e) = r {
                    eprintln!("[session] reopen {kind:?}: {e:#}");
                }
            }
            Err(e) => eprintln!("[session] reopen input: {e}"),
        }
    }

    /// Switch to the next program (the C key). Multi-program transport
    /// streams re-resolve each component inside the new program's stream
    /// set; anything else is a true no-op.
    pub fn cycle_program(&mut self) {
        if self.programs.len() < 2 {
            eprintln!(
                "[session] container has {} program(s), nothing to cycle",
                self.programs.len()
            );
            return;
        }
        self.current_program = (self.current_program + 1) % self.programs.len();
        let members = self.programs[self.current_program].clone();
        eprintln!("[session] switching to program {}", self.current_program);

        for kind in [StreamKind::Video, StreamKind::Audio, StreamKind::Subtitle] {
            let of_medium = match kind {
                StreamKind::Video => &self.media_streams.video,
                StreamKind::Audio => &self.media_streams.audio,
                StreamKind::Subtitle => &self.media_streams.subtitle,
            };
            let next = members.iter().copied().find(|i| of_medium.contains(i));
            let current = {
                let comp = self.shared.comp.lock().unwrap();
                comp.get(kind).map(|s| s.index)
            };
            if next == current {
                continue;
            }
            close_component(&self.shared, kind);
            if let Some(idx) = next {
                self.reopen_component(kind, idx);
            }
        }
        self.seek_by(0.0);
    }

    /// Cycle the video filter chain (W key).
    pub fn cycle_video_filter(&self) {
        let n = self.shared.opts.video_filters.len();
        if n == 0 {
            return;
        }
        let mut ctrl = self.shared.ctrl.lock().unwrap();
        ctrl.vfilter_index = (ctrl.vfilter_index + 1) % n;
        eprintln!("[session] video filter #{}", ctrl.vfilter_index);
    }

    // ── Status ───────────────────────────────────────────────────────────────

    pub fn status(&self) -> StatusSnapshot {
        let sh = &self.shared;
        let a = sh.clocks.audclk.get();
        let v = sh.clocks.vidclk.get();
        StatusSnapshot {
            position:     sh.position(),
            duration:     sh.duration_secs,
            av_diff:      (!a.is_nan() && !v.is_nan()).then(|| a - v),
            drops_early:  sh.stats.frame_drops_early.load(Ordering::Relaxed),
            drops_late:   sh.stats.frame_drops_late.load(Ordering::Relaxed),
            audioq_bytes: sh.audioq.stats().byte_size,
            videoq_bytes: sh.videoq.stats().byte_size,
            subq_bytes:   sh.subq.stats().byte_size,
            paused:       sh.is_paused(),
            muted:        sh.muted.load(Ordering::Relaxed),
            volume:       sh.volume.load(Ordering::Relaxed),
        }
    }

    // ── Shutdown ─────────────────────────────────────────────────────────────

    pub fn shutdown(&mut self) {
        {
            let mut ctrl = self.shared.ctrl.lock().unwrap();
            if ctrl.abort {
                return;
            }
            ctrl.abort = true;
        }
        self.shared.wake_reader();
        close_component(&self.shared, StreamKind::Audio);
        close_component(&self.shared, StreamKind::Video);
        close_component(&self.shared, StreamKind::Subtitle);
        if let Some(h) = self.reader.take() {
            let _ = h.join();
        }
        self.backend.close();
        eprintln!("[session] shut down");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ── Component plumbing ────────────────────────────────────────────────────────

/// Stream membership per container program (AVProgram), walked through
/// the raw context; the safe surface does not expose programs.
fn program_streams(ictx: &format::context::Input) -> Vec<Vec<usize>> {
    unsafe {
        let ctx = ictx.as_ptr();
        let n = (*ctx).nb_programs as usize;
        (0..n)
            .map(|p| {
                let prog = *(*ctx).programs.add(p);
                let count = (*prog).nb_stream_indexes as usize;
                (0..count)
                    .map(|s| *(*prog).stream_index.add(s) as usize)
                    .collect()
            })
            .collect()
    }
}

fn streams_of(ictx: &format::context::Input, medium: Type) -> Vec<usize> {
    ictx.streams()
        .filter(|s| s.parameters().medium() == medium)
        .map(|s| s.index())
        .collect()
}

/// Explicit index (validated against the medium) or the demuxer's best.
fn choose_stream(
    ictx: &format::context::Input,
    medium: Type,
    wanted: Option<usize>,
) -> Result<Option<usize>> {
    match wanted {
        Some(idx) => {
            let stream = ictx
                .stream(idx)
                .ok_or_else(|| anyhow!("stream #{idx} does not exist"))?;
            if stream.parameters().medium() != medium {
                bail!("stream #{idx} is not {medium:?}");
            }
            Ok(Some(idx))
        }
        None => Ok(ictx.streams().best(medium).map(|s| s.index())),
    }
}

/// Rotation in degrees from the stream's display-matrix side data.
fn stream_rotation(stream: &format::stream::Stream) -> f64 {
    for side in stream.side_data() {
        if side.kind() == ffmpeg::packet::side_data::Type::DisplayMatrix {
            let data = side.data();
            if data.len() >= 36 {
                let theta =
                    unsafe { ffi::av_display_rotation_get(data.as_ptr() as *const i32) };
                if !theta.is_nan() {
                    // Matrix angles are counter-clockwise.
                    return (-theta).rem_euclid(360.0);
                }
            }
        }
    }
    0.0
}

fn open_video_component(sh: &Arc<Shared>, ictx: &format::context::Input, index: usize) -> Result<()> {
    let stream = ictx.stream(index).ok_or_else(|| anyhow!("no stream #{index}"))?;
    let dctx = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
        .context("video codec parameters")?;
    let dec = dctx.decoder().video().context("open video decoder")?;

    let attached_pic = stream
        .disposition()
        .contains(ffmpeg::format::stream::Disposition::ATTACHED_PIC);
    let finished = Arc::new(AtomicU64::new(0));
    sh.videoq.start();

    let ctx = VideoDecoderCtx {
        shared:     Arc::clone(sh),
        finished:   Arc::clone(&finished),
        time_base:  stream.time_base(),
        frame_rate: stream.avg_frame_rate(),
        rotation:   stream_rotation(&stream),
    };
    let join = std::thread::spawn(move || video_decoder_loop(ctx, dec));

    let mut comp = sh.comp.lock().unwrap();
    comp.video = Some(StreamSlot {
        index,
        time_base: stream.time_base(),
        attached_pic,
        finished,
        join: Some(join),
    });
    sh.clocks.set_has_video(true);
    sh.ctrl.lock().unwrap().attachments_req = attached_pic;
    eprintln!("[session] video stream #{index} open");
    Ok(())
}

fn open_audio_component(
    sh: &Arc<Shared>,
    ictx: &format::context::Input,
    index: usize,
    backend: &mut dyn AudioBackend,
) -> Result<()> {
    let stream = ictx.stream(index).ok_or_else(|| anyhow!("no stream #{index}"))?;
    let dctx = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
        .context("audio codec parameters")?;
    let dec = dctx.decoder().audio().context("open audio decoder")?;

    // First negotiation pass: the decoder-side shape is what we ask the
    // device for; the second pass forces the graph to what we got.
    let desired = AudioParams {
        freq:     dec.rate(),
        channels: dec.channels(),
    };
    if desired.freq == 0 || desired.channels == 0 {
        bail!("audio stream #{index} reports no format");
    }
    let opened = backend
        .open(desired, Arc::clone(&sh.audio_out))
        .context("open audio device")?;
    eprintln!(
        "[session] audio device: {} Hz, {} ch, {} byte buffer",
        opened.params.freq, opened.params.channels, opened.buffer_bytes
    );

    let mut graph = AudioFilterGraph::new(sh.opts.audio_filters.clone());
    graph.force_output(opened.params);
    sh.audio_out.install(AudioSource::new(
        Arc::clone(sh),
        opened.params,
        opened.buffer_bytes,
    ));

    let finished = Arc::new(AtomicU64::new(0));
    sh.audioq.start();

    let start_pts = {
        let s = stream.start_time();
        (s != ffi::AV_NOPTS_VALUE).then_some(s)
    };
    let ctx = AudioDecoderCtx {
        shared: Arc::clone(sh),
        finished: Arc::clone(&finished),
        time_base: stream.time_base(),
        graph,
        start_pts,
    };
    let join = std::thread::spawn(move || audio_decoder_loop(ctx, dec));

    let mut comp = sh.comp.lock().unwrap();
    comp.audio = Some(StreamSlot {
        index,
        time_base: stream.time_base(),
        attached_pic: false,
        finished,
        join: Some(join),
    });
    sh.clocks.set_has_audio(true);
    eprintln!("[session] audio stream #{index} open");
    Ok(())
}

fn open_subtitle_component(
    sh: &Arc<Shared>,
    ictx: &format::context::Input,
    index: usize,
) -> Result<()> {
    let stream = ictx.stream(index).ok_or_else(|| anyhow!("no stream #{index}"))?;
    let dctx = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
        .context("subtitle codec parameters")?;
    let dec = dctx.decoder().subtitle().context("open subtitle decoder")?;

    let finished = Arc::new(AtomicU64::new(0));
    sh.subq.start();

    let ctx = SubtitleDecoderCtx {
        shared:    Arc::clone(sh),
        finished:  Arc::clone(&finished),
        time_base: stream.time_base(),
    };
    let join = std::thread::spawn(move || subtitle_decoder_loop(ctx, dec));

    let mut comp = sh.comp.lock().unwrap();
    comp.subtitle = Some(StreamSlot {
        index,
        time_base: stream.time_base(),
        attached_pic: false,
        finished,
        join: Some(join),
    });
    eprintln!("[session] subtitle stream #{index} open");
    Ok(())
}

/// Abort the component's packet queue, wake and join its decoder, drain
/// its frame ring. The queue can be `start`ed again by a later open.
fn close_component(sh: &Arc<Shared>, kind: StreamKind) {
    let slot = sh.comp.lock().unwrap().take(kind);
    let Some(mut slot) = slot else {
        return;
    };
    match kind {
        StreamKind::Video => {
            sh.videoq.abort();
            sh.vframes.wake();
        }
        StreamKind::Audio => {
            sh.audioq.abort();
            sh.aframes.wake();
            sh.audio_out.clear();
        }
        StreamKind::Subtitle => {
            sh.subq.abort();
            sh.sframes.wake();
        }
    }
    if let Some(h) = slot.join.take() {
        let _ = h.join();
    }
    match kind {
        StreamKind::Video => {
            sh.vframes.drain();
            sh.clocks.set_has_video(false);
        }
        StreamKind::Audio => {
            sh.aframes.drain();
            sh.clocks.set_has_audio(false);
        }
        StreamKind::Subtitle => sh.sframes.drain(),
    }
    eprintln!("[session] {kind:?} component closed");
}

fn is_realtime(format_name: &str, url: &str) -> bool {
    if format_name.contains("rtp") || format_name.contains("rtsp") || format_name.contains("sdp")
    {
        return true;
    }
    url.starts_with("rtp:") || url.starts_with("udp:")
}

fn bumped_volume(current: i32, delta: i32) -> i32 {
    (current + delta).clamp(0, 100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn realtime_detection() {
        assert!(is_realtime("rtsp", "rtsp://host/stream"));
        assert!(is_realtime("sdp", "session.sdp"));
        assert!(is_realtime("mpegts", "udp://239.0.0.1:1234"));
        assert!(!is_realtime("matroska,webm", "movie.mkv"));
    }

    #[test]
    fn volume_bumps_clamp() {
        assert_eq!(bumped_volume(100, 10), 100);
        assert_eq!(bumped_volume(95, 10), 100);
        assert_eq!(bumped_volume(5, -10), 0);
        assert_eq!(bumped_volume(50, 10), 60);
    }
}
