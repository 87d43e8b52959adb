// crates/kine-ui/src/audio_dev.rs
//
// cpal-backed audio device. Negotiates the desired format against what
// the host grants, degrading channel count and sample rate before
// giving up; the f32 callback drains the session's AudioOutput slot.

use std::sync::Arc;

use anyhow::{anyhow, Context as _, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, StreamConfig};

use kine_media::{AudioBackend, AudioOutput, AudioParams, OpenedAudio};

/// Target callback cadence; the hardware buffer is sized so the device
/// asks for audio about this often.
const CALLBACKS_PER_SEC: u32 = 30;
const MIN_BUFFER_FRAMES: u32 = 512;

fn buffer_frames(freq: u32) -> u32 {
    let wanted = freq / CALLBACKS_PER_SEC;
    wanted.next_power_of_two().max(MIN_BUFFER_FRAMES)
}

pub struct CpalBackend {
    stream: Option<cpal::Stream>,
}

impl CpalBackend {
    pub fn new() -> Self {
        Self { stream: None }
    }

    fn try_open(
        &mut self,
        device: &cpal::Device,
        params: AudioParams,
        output: Arc<AudioOutput>,
    ) -> Result<OpenedAudio> {
        let frames = buffer_frames(params.freq);
        let config = StreamConfig {
            channels:    params.channels,
            sample_rate: SampleRate(params.freq),
            buffer_size: BufferSize::Fixed(frames),
        };
        let out = Arc::clone(&output);
        let stream = device.build_output_stream(
            &config,
            move |data: &mut [f32], _| out.fill(data),
            |e| eprintln!("[audio] device error: {e}"),
            None,
        )?;
        stream.play().context("start audio stream")?;
        self.stream = Some(stream);
        Ok(OpenedAudio {
            params,
            buffer_bytes: frames as usize * params.frame_bytes(),
        })
    }
}

impl AudioBackend for CpalBackend {
    fn open(&mut self, desired: AudioParams, output: Arc<AudioOutput>) -> Result<OpenedAudio> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| anyhow!("no default audio output device"))?;

        // Degradation ladder: desired → stereo at desired rate → the
        // device's own default. Only then fail (fatal upstream).
        let default = device
            .default_output_config()
            .context("query default output config")?;
        let fallback = AudioParams {
            freq:     default.sample_rate().0,
            channels: default.channels().clamp(1, 2),
        };
        let mut candidates = vec![desired];
        if desired.channels > 2 {
            candidates.push(AudioParams {
                channels: 2,
                ..desired
            });
        }
        if !candidates.contains(&fallback) {
            candidates.push(fallback);
        }

        let mut last_err = None;
        for cand in candidates {
            match self.try_open(&device, cand, Arc::clone(&output)) {
                Ok(opened) => return Ok(opened),
                Err(e) => {
                    eprintln!(
                        "[audio] open {} Hz / {} ch failed: {e}",
                        cand.freq, cand.channels
                    );
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("audio device open failed")))
    }

    fn pause(&mut self, paused: bool) {
        if let Some(s) = &self.stream {
            let r = if paused { s.pause() } else { s.play() };
            if let Err(e) = r {
                eprintln!("[audio] pause({paused}): {e}");
            }
        }
    }

    fn close(&mut self) {
        self.stream = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_sizing_tracks_rate() {
        assert_eq!(buffer_frames(48_000), 2048); // 1600 → pow2
        assert_eq!(buffer_frames(8_000), 512); // floor
        assert_eq!(buffer_frames(192_000), 8192);
    }
}
