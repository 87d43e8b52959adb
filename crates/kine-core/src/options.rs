// crates/kine-core/src/options.rs
//
// User-facing playback options as plain types. CLI attribute decoration
// lives in kine-ui; nothing here is persisted.

/// Which clock the pipeline prefers as master. Falls back by stream
/// presence, see `sync::select_master`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockSource {
    #[default]
    Audio,
    Video,
    External,
}

/// Video frame dropping policy when decode or presentation falls behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framedrop {
    /// Never drop.
    Disabled,
    /// Drop only when video is not the master clock.
    #[default]
    Auto,
    /// Always drop when late.
    Always,
}

impl Framedrop {
    /// Whether dropping applies given the current master.
    pub fn applies(self, video_is_master: bool) -> bool {
        match self {
            Framedrop::Disabled => false,
            Framedrop::Auto => !video_is_master,
            Framedrop::Always => true,
        }
    }
}

/// Seek unit selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeekMode {
    Time,
    Bytes,
    /// Decide per container (byte-seek only where timestamps are
    /// unreliable and the format allows it).
    #[default]
    Auto,
}

/// What the window shows. Waves/Rdft are accepted and currently render
/// as a blank canvas when no video stream is displayable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShowMode {
    #[default]
    Video,
    Waves,
    Rdft,
}

/// Video timestamp policy for reordered codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PtsPolicy {
    /// Codec best-effort estimate.
    #[default]
    BestEffort,
    /// Trust the raw frame pts.
    RawPts,
    /// Use packet dts only.
    Dts,
}

/// Everything the user can configure for one playback session.
#[derive(Debug, Clone)]
pub struct PlayerOptions {
    /// Input URL or path.
    pub input: String,

    pub sync:      ClockSource,
    pub framedrop: Framedrop,
    pub seek_mode: SeekMode,
    pub pts_policy: PtsPolicy,

    /// Disable the 15 MiB / enough-packets backpressure cap.
    /// None = auto (enabled for realtime inputs).
    pub infinite_buffer: Option<bool>,

    /// Play the file this many times; 0 = forever.
    pub loop_count: u32,
    /// Start position in seconds from stream start.
    pub start_time: Option<f64>,
    /// Play at most this many seconds.
    pub play_duration: Option<f64>,

    /// Startup volume, 0..=100.
    pub volume: i32,
    pub mute:   bool,

    /// Exit when playback completes.
    pub autoexit: bool,
    /// Ask the demuxer to synthesize missing pts.
    pub genpts: bool,
    /// Apply display-matrix rotation from stream side data.
    pub autorotate: bool,
    /// Preferred hardware decoder name; recorded and surfaced, decode
    /// stays on the software path.
    pub hwaccel: Option<String>,

    pub show_mode: ShowMode,

    /// Explicit stream selections (indices into the container).
    pub audio_stream:    Option<usize>,
    pub video_stream:    Option<usize>,
    pub subtitle_stream: Option<usize>,

    /// Filter chain specs inserted between decoder and sink
    /// (FFmpeg filter syntax); `W` cycles through the video list.
    pub video_filters: Vec<String>,
    pub audio_filters: Option<String>,
}

impl Default for PlayerOptions {
    fn default() -> Self {
        Self {
            input:           String::new(),
            sync:            ClockSource::default(),
            framedrop:       Framedrop::default(),
            seek_mode:       SeekMode::default(),
            pts_policy:      PtsPolicy::default(),
            infinite_buffer: None,
            loop_count:      1,
            start_time:      None,
            play_duration:   None,
            volume:          100,
            mute:            false,
            autoexit:        false,
            genpts:          false,
            autorotate:      true,
            hwaccel:         None,
            show_mode:       ShowMode::default(),
            audio_stream:    None,
            video_stream:    None,
            subtitle_stream: None,
            video_filters:   Vec::new(),
            audio_filters:   None,
        }
    }
}

impl PlayerOptions {
    /// Clamp to the valid volume range.
    pub fn clamped_volume(&self) -> i32 {
        self.volume.clamp(0, 100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framedrop_policy_vs_master() {
        assert!(!Framedrop::Disabled.applies(false));
        assert!(Framedrop::Auto.applies(false));
        assert!(!Framedrop::Auto.applies(true));
        assert!(Framedrop::Always.applies(true));
    }

    #[test]
    fn defaults_match_contract() {
        let o = PlayerOptions::default();
        assert_eq!(o.sync, ClockSource::Audio);
        assert_eq!(o.loop_count, 1);
        assert_eq!(o.volume, 100);
        assert!(o.autorotate);
        assert!(!o.autoexit);
    }

    #[test]
    fn volume_clamps() {
        let mut o = PlayerOptions::default();
        o.volume = 300;
        assert_eq!(o.clamped_volume(), 100);
        o.volume = -5;
        assert_eq!(o.clamped_volume(), 0);
    }
}
