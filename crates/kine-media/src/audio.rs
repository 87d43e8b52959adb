// crates/kine-media/src/audio.rs
//
// The audio half of presentation: a pull source drained by the device
// callback. Must produce exactly the requested number of samples every
// time, resample when the wanted sample count diverges from the frame
// (clock compensation goes through the resampler, never truncation),
// and advance the audio clock against the device's playback position.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use ffmpeg_the_third as ffmpeg;

use ffmpeg::ffi;
use ffmpeg::frame;
use ffmpeg::software::resampling;
use ffmpeg::util::format::sample::{Sample, Type};
use ffmpeg::ChannelLayout;

use kine_core::{wall_time, Master, SampleCorrector};

use crate::session::Shared;

/// Hardware-side audio format. Samples are interleaved f32 throughout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioParams {
    pub freq:     u32,
    pub channels: u16,
}

impl AudioParams {
    pub fn bytes_per_sec(&self) -> f64 {
        (self.freq as usize * self.frame_bytes()) as f64
    }

    /// Bytes per interleaved sample frame.
    pub fn frame_bytes(&self) -> usize {
        self.channels as usize * 4
    }
}

/// Result of opening a device: the format actually granted plus the
/// hardware buffer size (bytes) used for latency estimation.
pub struct OpenedAudio {
    pub params:       AudioParams,
    pub buffer_bytes: usize,
}

/// The audio device, as the core consumes it. Implemented over cpal in
/// the UI crate; tests can plug in a silent fake. Lives on the UI task
/// (device streams are not generally Send); only the callback side
/// (`AudioOutput`) crosses threads.
pub trait AudioBackend {
    /// Negotiate a format and start the callback, which drains `output`.
    fn open(&mut self, desired: AudioParams, output: Arc<AudioOutput>) -> Result<OpenedAudio>;
    fn pause(&mut self, paused: bool);
    fn close(&mut self);
}

// ── Callback-side source ──────────────────────────────────────────────────────

/// Slot the device callback drains. Empty (silence) until the session
/// installs a source after the audio component opens, and again after a
/// stream switch tears the old component down.
pub struct AudioOutput {
    inner: Mutex<Option<AudioSource>>,
}

impl AudioOutput {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(None),
        })
    }

    pub fn install(&self, source: AudioSource) {
        *self.inner.lock().unwrap() = Some(source);
    }

    pub fn clear(&self) {
        *self.inner.lock().unwrap() = None;
    }

    /// Device callback entry: always fills `out` completely.
    pub fn fill(&self, out: &mut [f32]) {
        let mut guard = self.inner.lock().unwrap();
        match guard.as_mut() {
            Some(src) => src.fill(out),
            None => out.fill(0.0),
        }
    }
}

pub struct AudioSource {
    shared: Arc<Shared>,
    /// Device format (the filter sink is forced to it, so frames usually
    /// arrive ready to copy).
    params: AudioParams,
    hw_buf_bytes: usize,
    corrector: SampleCorrector,
    swr: Option<resampling::Context>,
    /// Source shape behind the current resampler.
    swr_src: Option<(Sample, u16, u32)>,
    /// Working buffer: interleaved f32 at device format.
    buf: Vec<f32>,
    buf_index: usize,
    /// Pts of the first not-yet-consumed sample's *end* — i.e. the pts of
    /// the next sample to decode. NaN until a timestamped frame arrives.
    audio_clock: f64,
    audio_clock_serial: kine_core::Serial,
}

impl AudioSource {
    pub fn new(shared: Arc<Shared>, params: AudioParams, hw_buf_bytes: usize) -> Self {
        let diff_threshold = hw_buf_bytes as f64 / params.bytes_per_sec();
        Self {
            shared,
            params,
            hw_buf_bytes,
            corrector: SampleCorrector::new(diff_threshold),
            swr: None,
            swr_src: None,
            buf: Vec::new(),
            buf_index: 0,
            audio_clock: f64::NAN,
            audio_clock_serial: 0,
        }
    }

    /// Produce exactly `out.len()` samples, advancing the audio clock at
    /// the device-side timestamp.
    pub fn fill(&mut self, out: &mut [f32]) {
        let callback_time = wall_time();
        let sh = Arc::clone(&self.shared);
        let volume = sh.volume.load(Ordering::Relaxed).clamp(0, 100) as f32 / 100.0;
        let muted = sh.muted.load(Ordering::Relaxed);

        let mut offset = 0usize;
        while offset < out.len() {
            if self.buf_index >= self.buf.len() {
                if !self.refill(&sh, callback_time) {
                    // Underrun or pause: silence for the remainder, clock
                    // untouched.
                    out[offset..].fill(0.0);
                    offset = out.len();
                    break;
                }
            }
            let n = (out.len() - offset).min(self.buf.len() - self.buf_index);
            let gain = if muted { 0.0 } else { volume };
            for (dst, src) in out[offset..offset + n]
                .iter_mut()
                .zip(&self.buf[self.buf_index..self.buf_index + n])
            {
                *dst = src * gain;
            }
            offset += n;
            self.buf_index += n;
        }

        // Clock update: the pts of the sample the hardware will play
        // `latency` from now, where latency covers the device's double
        // buffer plus what we decoded but have not handed over yet.
        if !self.audio_clock.is_nan() {
            let write_buf_bytes = (self.buf.len() - self.buf_index) * 4;
            let latency =
                (2 * self.hw_buf_bytes + write_buf_bytes) as f64 / self.params.bytes_per_sec();
            sh.clocks.audclk.set_at(
                self.audio_clock - latency,
                self.audio_clock_serial,
                callback_time,
            );
            sh.clocks.extclk.sync_to(&sh.clocks.audclk);
        }
    }

    /// Pull the next same-epoch frame, synchronize its sample count, and
    /// land it in the working buffer. False = nothing available in time.
    fn refill(&mut self, sh: &Shared, callback_time: f64) -> bool {
        if sh.ctrl.lock().unwrap().paused {
            return false;
        }

        // The callback may pre-empt the audio decoder; give it a moment,
        // bounded well under the buffer we owe the device.
        let deadline =
            callback_time + self.hw_buf_bytes as f64 / self.params.bytes_per_sec() / 2.0;
        let af = loop {
            if sh.audioq.is_aborted() {
                return false;
            }
            match sh.aframes.peek_current() {
                Some(af) if af.serial != sh.audioq.serial() => {
                    sh.aframes.advance();
                    continue;
                }
                Some(af) => {
                    sh.aframes.advance();
                    break af;
                }
                None => {
                    if wall_time() > deadline {
                        return false;
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        };

        let src_rate = af.frame.rate();
        let src_samples = af.frame.samples();
        let wanted = self.synchronize(&sh.clocks, src_samples, src_rate);

        let matches_device = af.frame.format() == Sample::F32(Type::Packed)
            && af.frame.rate() == self.params.freq
            && af.frame.channels() == self.params.channels;

        if matches_device && wanted == src_samples {
            let n = src_samples * self.params.channels as usize;
            self.buf.clear();
            self.buf.reserve(n);
            let raw = &af.frame.data(0)[..n * 4];
            self.buf.extend(
                raw.chunks_exact(4)
                    .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]])),
            );
        } else if !self.resample(&af.frame, wanted) {
            return false;
        }
        self.buf_index = 0;

        // Next-sample pts from the source frame's own timing.
        if !af.pts.is_nan() {
            self.audio_clock = af.pts + src_samples as f64 / src_rate as f64;
            self.audio_clock_serial = af.serial;
        }
        true
    }

    /// Wanted sample count per the sync model: exact when audio is the
    /// master, corrector-driven otherwise.
    fn synchronize(&mut self, clocks: &kine_core::ClockHub, nb_samples: usize, rate: u32) -> usize {
        if clocks.master() == Master::Audio {
            return nb_samples;
        }
        let diff = clocks.audclk.get() - clocks.master_value();
        self.corrector.wanted_samples(diff, nb_samples, rate)
    }

    /// Convert through swresample into the device format, applying the
    /// wanted-vs-actual delta as resampler compensation.
    fn resample(&mut self, src: &frame::Audio, wanted: usize) -> bool {
        let shape = (src.format(), src.channels(), src.rate());
        if self.swr.is_none() || self.swr_src != Some(shape) {
            let out_layout = ChannelLayout::default(self.params.channels as i32);
            match resampling::Context::get(
                src.format(),
                src.channel_layout(),
                src.rate(),
                Sample::F32(Type::Packed),
                out_layout,
                self.params.freq,
            ) {
                Ok(ctx) => {
                    self.swr = Some(ctx);
                    self.swr_src = Some(shape);
                }
                Err(e) => {
                    eprintln!("[audio] resampler init: {e}");
                    return false;
                }
            }
        }
        let Some(swr) = self.swr.as_mut() else {
            return false;
        };

        let src_samples = src.samples();
        if wanted != src_samples {
            let delta =
                (wanted as i64 - src_samples as i64) * self.params.freq as i64 / src.rate() as i64;
            let distance = wanted as i64 * self.params.freq as i64 / src.rate() as i64;
            let ret = unsafe {
                ffi::swr_set_compensation(swr.as_mut_ptr(), delta as i32, distance as i32)
            };
            if ret < 0 {
                eprintln!("[audio] swr_set_compensation failed ({ret})");
                return false;
            }
        }

        let out_cap =
            (wanted as i64 * self.params.freq as i64 / src.rate() as i64 + 256) as usize;
        let mut converted = frame::Audio::new(
            Sample::F32(Type::Packed),
            out_cap,
            ChannelLayout::default(self.params.channels as i32),
        );
        if let Err(e) = swr.run(src, &mut converted) {
            eprintln!("[audio] resample: {e}");
            return false;
        }
        let out_samples = converted.samples();
        let n = out_samples * self.params.channels as usize;
        self.buf.clear();
        self.buf.reserve(n);
        let raw = &converted.data(0)[..n * 4];
        self.buf.extend(
            raw.chunks_exact(4)
                .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]])),
        );
        true
    }
}
