// crates/kine-media/src/frame.rs
//
// Decoded frame types crossing the frame-queue boundary. Video frames
// are tightly packed RGBA (destriped out of the filter sink) so the UI
// can upload them without touching FFmpeg types; audio frames keep the
// FFmpeg buffer because the device callback resamples from it.

use std::sync::atomic::{AtomicBool, Ordering};

use ffmpeg_the_third as ffmpeg;

use kine_core::Serial;

pub struct VideoFrame {
    /// Packed RGBA, `width * height * 4` bytes, top-down rows.
    pub data:     Vec<u8>,
    pub width:    u32,
    pub height:   u32,
    /// Sample aspect ratio; 1.0 when unknown.
    pub sar:      f64,
    /// Presentation time in seconds; NaN if the stream had none.
    pub pts:      f64,
    /// Estimated display duration in seconds (1/fps from the filter sink).
    pub duration: f64,
    /// Byte position of the producing packet in the container.
    pub pos:      i64,
    pub serial:   Serial,
    /// Rows were stored bottom-up in the decoder (negative stride) and
    /// must be flipped at blit time.
    pub flip_v:   bool,
    /// Texture already synced for this frame; cleared only by being a new
    /// frame. Lets a re-blit (pause, expose) skip the upload.
    uploaded: AtomicBool,
}

impl VideoFrame {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        sar: f64,
        pts: f64,
        duration: f64,
        pos: i64,
        serial: Serial,
        flip_v: bool,
    ) -> Self {
        Self {
            data,
            width,
            height,
            sar: if sar > 0.0 { sar } else { 1.0 },
            pts,
            duration,
            pos,
            serial,
            flip_v,
            uploaded: AtomicBool::new(false),
        }
    }

    /// Display width after aspect-ratio correction.
    pub fn display_width(&self) -> u32 {
        (self.width as f64 * self.sar).round().max(1.0) as u32
    }

    pub fn is_uploaded(&self) -> bool {
        self.uploaded.load(Ordering::Acquire)
    }

    pub fn mark_uploaded(&self) {
        self.uploaded.store(true, Ordering::Release);
    }
}

pub struct AudioFrame {
    pub frame:    ffmpeg::frame::Audio,
    /// Seconds; NaN if unknown (the callback then extrapolates).
    pub pts:      f64,
    pub duration: f64,
    pub pos:      i64,
    pub serial:   Serial,
}

/// One positioned subtitle rectangle. Bitmap subtitles carry geometry
/// only; rasterization is the renderer's concern.
pub struct SubtitleRect {
    pub x:      i32,
    pub y:      i32,
    pub width:  u32,
    pub height: u32,
    pub text:   Option<String>,
}

pub struct SubtitleFrame {
    pub rects:  Vec<SubtitleRect>,
    /// Seconds.
    pub pts:    f64,
    /// Display window, seconds relative to `pts`.
    pub start:  f64,
    pub end:    f64,
    pub serial: Serial,
}

impl SubtitleFrame {
    /// Whether the display window has passed at master time `now`.
    pub fn expired(&self, now: f64) -> bool {
        !now.is_nan() && now > self.pts + self.end
    }

    /// Whether the subtitle should be on screen at master time `now`.
    pub fn visible(&self, now: f64) -> bool {
        !now.is_nan() && now >= self.pts + self.start && now <= self.pts + self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtitle_window() {
        let sf = SubtitleFrame {
            rects:  Vec::new(),
            pts:    10.0,
            start:  0.0,
            end:    2.0,
            serial: 1,
        };
        assert!(!sf.visible(9.9));
        assert!(sf.visible(10.0));
        assert!(sf.visible(11.9));
        assert!(!sf.visible(12.1));
        assert!(sf.expired(12.1));
        assert!(!sf.expired(f64::NAN));
    }

    #[test]
    fn video_frame_sar_defaults_to_square() {
        let f = VideoFrame::new(vec![0; 16], 2, 2, 0.0, 0.0, 0.04, 0, 1, false);
        assert_eq!(f.sar, 1.0);
        assert_eq!(f.display_width(), 2);
        let wide = VideoFrame::new(vec![0; 16], 2, 2, 2.0, 0.0, 0.04, 0, 1, false);
        assert_eq!(wide.display_width(), 4);
    }
}
