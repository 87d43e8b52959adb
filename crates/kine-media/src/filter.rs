// crates/kine-media/src/filter.rs
//
// Reconfigurable filter graphs between decoder and frame queue. Rebuilt
// whenever the input shape changes (resolution/pixel format for video,
// rate/layout/sample format for audio), the epoch advances, or the user
// cycles a filter spec. The video sink is forced to RGBA — the format
// the UI uploads; the audio sink is forced to the opened device format
// on the second negotiation pass.

use anyhow::{anyhow, Context as _, Result};
use ffmpeg_the_third as ffmpeg;

use ffmpeg::ffi;
use ffmpeg::filter;
use ffmpeg::frame;
use ffmpeg::util::error::EAGAIN;
use ffmpeg::Rational;

use kine_core::Serial;

use crate::audio::AudioParams;

fn find_filter(name: &str) -> Result<filter::Filter> {
    filter::find(name).ok_or_else(|| anyhow!("filter '{name}' not present in this FFmpeg"))
}

/// Sample-format name for buffer-source args, via the C helper (the safe
/// surface has no name accessor).
fn sample_fmt_name(fmt: ffmpeg::format::Sample) -> &'static str {
    unsafe {
        let p = ffi::av_get_sample_fmt_name(fmt.into());
        if p.is_null() {
            "none"
        } else {
            std::ffi::CStr::from_ptr(p).to_str().unwrap_or("none")
        }
    }
}

/// Channel-layout description understood by abuffer/aformat.
pub(crate) fn layout_desc(channels: u16) -> String {
    match channels {
        1 => "mono".to_string(),
        2 => "stereo".to_string(),
        n => format!("{n}c"),
    }
}

// ── Video ─────────────────────────────────────────────────────────────────────

#[derive(PartialEq, Clone)]
struct VideoShape {
    width:  u32,
    height: u32,
    format: ffmpeg::format::Pixel,
    serial: Serial,
    spec:   Option<String>,
}

pub struct VideoFilterGraph {
    graph: Option<filter::Graph>,
    shape: Option<VideoShape>,
    time_base: Rational,
    /// Rotation (degrees) from the stream display matrix, applied when
    /// autorotate is on.
    rotation: f64,
    sink_time_base: Rational,
}

impl VideoFilterGraph {
    pub fn new(stream_time_base: Rational, rotation: f64) -> Self {
        Self {
            graph: None,
            shape: None,
            time_base: stream_time_base,
            rotation,
            sink_time_base: stream_time_base,
        }
    }

    pub fn sink_time_base(&self) -> Rational {
        self.sink_time_base
    }

    /// Chain inserted between source and sink: user spec, rotation, and
    /// the RGBA force. Assembled left to right.
    fn chain_spec(&self, user: Option<&str>) -> String {
        let mut parts: Vec<String> = Vec::new();
        if let Some(u) = user {
            if !u.is_empty() {
                parts.push(u.to_string());
            }
        }
        let theta = self.rotation.rem_euclid(360.0);
        if (theta - 90.0).abs() < 1.0 {
            parts.push("transpose=clock".to_string());
        } else if (theta - 180.0).abs() < 1.0 {
            parts.push("hflip,vflip".to_string());
        } else if (theta - 270.0).abs() < 1.0 {
            parts.push("transpose=cclock".to_string());
        }
        parts.push("format=rgba".to_string());
        parts.join(",")
    }

    /// Rebuild the graph if the incoming frame no longer matches the
    /// negotiated input. Returns true when a rebuild happened.
    pub fn reconfigure_if_needed(
        &mut self,
        frame: &frame::Video,
        serial: Serial,
        user_spec: Option<&str>,
    ) -> Result<bool> {
        let shape = VideoShape {
            width:  frame.width(),
            height: frame.height(),
            format: frame.format(),
            serial,
            spec:   user_spec.map(|s| s.to_string()),
        };
        if self.graph.is_some() && self.shape.as_ref() == Some(&shape) {
            return Ok(false);
        }

        let sar = frame.aspect_ratio();
        let (sar_num, sar_den) = if sar.denominator() > 0 {
            (sar.numerator(), sar.denominator())
        } else {
            (0, 1)
        };
        let pix_name = shape
            .format
            .descriptor()
            .map(|d| d.name())
            .ok_or_else(|| anyhow!("frame has no pixel format"))?;
        let args = format!(
            "video_size={}x{}:pix_fmt={}:time_base={}/{}:pixel_aspect={}/{}",
            shape.width,
            shape.height,
            pix_name,
            self.time_base.numerator(),
            self.time_base.denominator(),
            sar_num,
            sar_den,
        );

        let mut graph = filter::Graph::new();
        graph
            .add(&find_filter("buffer")?, "in", &args)
            .context("video buffer source")?;
        graph
            .add(&find_filter("buffersink")?, "out", "")
            .context("video buffer sink")?;
        graph
            .output("in", 0)?
            .input("out", 0)?
            .parse(&self.chain_spec(user_spec))
            .context("video filter chain")?;
        graph.validate().context("video filter graph")?;

        // The sink's negotiated time base drives output pts conversion
        // (user chains may retime frames).
        self.sink_time_base = unsafe {
            let mut out = graph.get("out").ok_or_else(|| anyhow!("sink vanished"))?;
            let tb = ffi::av_buffersink_get_time_base(out.as_mut_ptr());
            Rational::new(tb.num, tb.den)
        };

        self.graph = Some(graph);
        self.shape = Some(shape);
        Ok(true)
    }

    pub fn push(&mut self, frame: &frame::Video) -> Result<()> {
        let graph = self.graph.as_mut().ok_or_else(|| anyhow!("graph not configured"))?;
        graph
            .get("in")
            .ok_or_else(|| anyhow!("source vanished"))?
            .source()
            .add(frame)
            .context("push into video graph")?;
        Ok(())
    }

    /// Pull one filtered frame; Ok(false) when the graph needs more input.
    pub fn pull(&mut self, out: &mut frame::Video) -> Result<bool> {
        let graph = self.graph.as_mut().ok_or_else(|| anyhow!("graph not configured"))?;
        match graph
            .get("out")
            .ok_or_else(|| anyhow!("sink vanished"))?
            .sink()
            .frame(out)
        {
            Ok(()) => Ok(true),
            Err(ffmpeg::Error::Eof) => Ok(false),
            Err(ffmpeg::Error::Other { errno: EAGAIN }) => Ok(false),
            Err(e) => Err(e).context("pull from video graph"),
        }
    }
}

// ── Audio ─────────────────────────────────────────────────────────────────────

#[derive(PartialEq, Clone)]
struct AudioShape {
    rate:     u32,
    channels: u16,
    format:   ffmpeg::format::Sample,
    serial:   Serial,
}

pub struct AudioFilterGraph {
    graph: Option<filter::Graph>,
    shape: Option<AudioShape>,
    /// Device format the sink is forced to. None during the first
    /// (unconstrained) negotiation pass used to discover the decoder
    /// side format before the device opens.
    forced_output: Option<AudioParams>,
    user_spec: Option<String>,
}

impl AudioFilterGraph {
    pub fn new(user_spec: Option<String>) -> Self {
        Self {
            graph: None,
            shape: None,
            forced_output: None,
            user_spec,
        }
    }

    /// Second negotiation pass: force the sink to the opened device
    /// format. Drops the current graph so the next frame rebuilds.
    pub fn force_output(&mut self, params: AudioParams) {
        self.forced_output = Some(params);
        self.graph = None;
        self.shape = None;
    }

    fn chain_spec(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        if let Some(u) = &self.user_spec {
            if !u.is_empty() {
                parts.push(u.clone());
            }
        }
        match &self.forced_output {
            Some(p) => parts.push(format!(
                "aformat=sample_fmts=flt:sample_rates={}:channel_layouts={}",
                p.freq,
                layout_desc(p.channels),
            )),
            // Unconstrained pass still normalizes to packed f32 so the
            // discovered shape is what the device will be asked for.
            None => parts.push("aformat=sample_fmts=flt".to_string()),
        }
        parts.join(",")
    }

    pub fn reconfigure_if_needed(&mut self, frame: &frame::Audio, serial: Serial) -> Result<bool> {
        let shape = AudioShape {
            rate:     frame.rate(),
            channels: frame.channels(),
            format:   frame.format(),
            serial,
        };
        if self.graph.is_some() && self.shape.as_ref() == Some(&shape) {
            return Ok(false);
        }

        let args = format!(
            "sample_rate={}:sample_fmt={}:channels={}:channel_layout={}:time_base=1/{}",
            shape.rate,
            sample_fmt_name(shape.format),
            shape.channels,
            layout_desc(shape.channels),
            shape.rate,
        );

        let mut graph = filter::Graph::new();
        graph
            .add(&find_filter("abuffer")?, "in", &args)
            .context("audio buffer source")?;
        graph
            .add(&find_filter("abuffersink")?, "out", "")
            .context("audio buffer sink")?;
        graph
            .output("in", 0)?
            .input("out", 0)?
            .parse(&self.chain_spec())
            .context("audio filter chain")?;
        graph.validate().context("audio filter graph")?;

        self.graph = Some(graph);
        self.shape = Some(shape);
        Ok(true)
    }

    pub fn push(&mut self, frame: &frame::Audio) -> Result<()> {
        let graph = self.graph.as_mut().ok_or_else(|| anyhow!("graph not configured"))?;
        graph
            .get("in")
            .ok_or_else(|| anyhow!("source vanished"))?
            .source()
            .add(frame)
            .context("push into audio graph")?;
        Ok(())
    }

    pub fn pull(&mut self, out: &mut frame::Audio) -> Result<bool> {
        let graph = self.graph.as_mut().ok_or_else(|| anyhow!("graph not configured"))?;
        match graph
            .get("out")
            .ok_or_else(|| anyhow!("sink vanished"))?
            .sink()
            .frame(out)
        {
            Ok(()) => Ok(true),
            Err(ffmpeg::Error::Eof) => Ok(false),
            Err(ffmpeg::Error::Other { errno: EAGAIN }) => Ok(false),
            Err(e) => Err(e).context("pull from audio graph"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_names() {
        assert_eq!(layout_desc(1), "mono");
        assert_eq!(layout_desc(2), "stereo");
        assert_eq!(layout_desc(6), "6c");
    }

    #[test]
    fn video_chain_spec_orders_user_rotation_format() {
        let g = VideoFilterGraph::new(Rational::new(1, 25), 90.0);
        assert_eq!(
            g.chain_spec(Some("hue=s=0")),
            "hue=s=0,transpose=clock,format=rgba"
        );
        let g = VideoFilterGraph::new(Rational::new(1, 25), 0.0);
        assert_eq!(g.chain_spec(None), "format=rgba");
        let g = VideoFilterGraph::new(Rational::new(1, 25), 180.0);
        assert_eq!(g.chain_spec(None), "hflip,vflip,format=rgba");
    }

    #[test]
    fn audio_chain_spec_forces_device_format_after_open() {
        let mut g = AudioFilterGraph::new(None);
        assert_eq!(g.chain_spec(), "aformat=sample_fmts=flt");
        g.force_output(AudioParams {
            freq:     48_000,
            channels: 2,
        });
        assert_eq!(
            g.chain_spec(),
            "aformat=sample_fmts=flt:sample_rates=48000:channel_layouts=stereo"
        );
    }
}
