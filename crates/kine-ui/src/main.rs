// crates/kine-ui/src/main.rs

mod app;
mod audio_dev;
mod video;

use std::sync::atomic::{AtomicBool, Ordering};

use clap::{Parser, ValueEnum};

use kine_core::{ClockSource, Framedrop, PlayerOptions, PtsPolicy, SeekMode, ShowMode};
use kine_media::Session;

use crate::app::KineApp;
use crate::audio_dev::CpalBackend;

#[derive(Clone, Copy, ValueEnum)]
enum SyncArg {
    Audio,
    Video,
    Ext,
}

#[derive(Clone, Copy, ValueEnum)]
enum BytesArg {
    Off,
    On,
    Auto,
}

#[derive(Clone, Copy, ValueEnum)]
enum FramedropArg {
    Off,
    Auto,
    On,
}

#[derive(Clone, Copy, ValueEnum)]
enum ShowModeArg {
    Video,
    Waves,
    Rdft,
}

#[derive(Clone, Copy, ValueEnum)]
enum PtsArg {
    /// Codec best-effort timestamps.
    Auto,
    /// Trust raw frame pts.
    Pts,
    /// Packet dts only.
    Dts,
}

/// kine — a small FFmpeg-based media player.
#[derive(Parser)]
#[command(name = "kine", version)]
struct Cli {
    /// Input file or URL.
    input: String,

    /// Master clock for A/V sync.
    #[arg(long, value_enum, default_value_t = SyncArg::Audio)]
    sync: SyncArg,

    /// Seek by bytes rather than time (auto: per container).
    #[arg(long, value_enum, default_value_t = BytesArg::Auto)]
    bytes: BytesArg,

    /// Drop late video frames: off / only when video is not master / always.
    #[arg(long, value_enum, default_value_t = FramedropArg::Auto)]
    framedrop: FramedropArg,

    /// Ignore the input buffer size cap.
    #[arg(long)]
    infinite_buffer: bool,

    /// Play the input N times (0 = forever).
    #[arg(long = "loop", default_value_t = 1, value_name = "N")]
    loop_count: u32,

    /// Start position in seconds.
    #[arg(long, value_name = "SECS")]
    start: Option<f64>,

    /// Play at most this many seconds.
    #[arg(long, value_name = "SECS")]
    duration: Option<f64>,

    /// Startup volume, 0..=100.
    #[arg(long, default_value_t = 100)]
    volume: i32,

    /// Start muted.
    #[arg(long)]
    mute: bool,

    /// Exit when playback finishes.
    #[arg(long)]
    autoexit: bool,

    /// Ask the demuxer to synthesize missing presentation timestamps.
    #[arg(long)]
    genpts: bool,

    /// Do not apply display-matrix rotation.
    #[arg(long)]
    noautorotate: bool,

    /// Preferred hardware decoder name (recorded; decoding stays on the
    /// software path).
    #[arg(long, value_name = "NAME")]
    hwaccel: Option<String>,

    #[arg(long, value_enum, default_value_t = ShowModeArg::Video)]
    show_mode: ShowModeArg,

    /// Audio / video / subtitle stream indices.
    #[arg(long, value_name = "IDX")]
    ast: Option<usize>,
    #[arg(long, value_name = "IDX")]
    vst: Option<usize>,
    #[arg(long, value_name = "IDX")]
    sst: Option<usize>,

    /// Video filter chain (repeatable; W cycles through them).
    #[arg(long = "vf", value_name = "CHAIN")]
    video_filters: Vec<String>,

    /// Audio filter chain.
    #[arg(long = "af", value_name = "CHAIN")]
    audio_filters: Option<String>,

    /// Video timestamp policy for reordered codecs.
    #[arg(long, value_enum, default_value_t = PtsArg::Auto)]
    drp: PtsArg,
}

impl Cli {
    fn into_options(self) -> PlayerOptions {
        PlayerOptions {
            input: self.input,
            sync: match self.sync {
                SyncArg::Audio => ClockSource::Audio,
                SyncArg::Video => ClockSource::Video,
                SyncArg::Ext => ClockSource::External,
            },
            framedrop: match self.framedrop {
                FramedropArg::Off => Framedrop::Disabled,
                FramedropArg::Auto => Framedrop::Auto,
                FramedropArg::On => Framedrop::Always,
            },
            seek_mode: match self.bytes {
                BytesArg::Off => SeekMode::Time,
                BytesArg::On => SeekMode::Bytes,
                BytesArg::Auto => SeekMode::Auto,
            },
            pts_policy: match self.drp {
                PtsArg::Auto => PtsPolicy::BestEffort,
                PtsArg::Pts => PtsPolicy::RawPts,
                PtsArg::Dts => PtsPolicy::Dts,
            },
            infinite_buffer: self.infinite_buffer.then_some(true),
            loop_count: self.loop_count,
            start_time: self.start,
            play_duration: self.duration,
            volume: self.volume,
            mute: self.mute,
            autoexit: self.autoexit,
            genpts: self.genpts,
            autorotate: !self.noautorotate,
            hwaccel: self.hwaccel,
            show_mode: match self.show_mode {
                ShowModeArg::Video => ShowMode::Video,
                ShowModeArg::Waves => ShowMode::Waves,
                ShowModeArg::Rdft => ShowMode::Rdft,
            },
            audio_stream: self.ast,
            video_stream: self.vst,
            subtitle_stream: self.sst,
            video_filters: self.video_filters,
            audio_filters: self.audio_filters,
        }
    }
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Ctrl-C sets a flag the UI tick polls; the exit itself happens on the
/// UI task so the session tears down normally.
fn install_interrupt_handler() {
    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::SeqCst)) {
        eprintln!("[kine] interrupt handler: {e}");
    }
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = ffmpeg_the_third::init() {
        eprintln!("[kine] FFmpeg init failed: {e}");
        std::process::exit(1);
    }
    install_interrupt_handler();

    let opts = cli.into_options();
    let session = match Session::open(opts, Box::new(CpalBackend::new())) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("[kine] {e:#}");
            std::process::exit(1);
        }
    };

    let title = format!("kine — {}", session.title());
    let native_options = eframe::NativeOptions {
        centered: true,
        viewport: egui::ViewportBuilder::default()
            .with_title(title)
            .with_inner_size([960.0, 540.0])
            .with_min_inner_size([320.0, 200.0]),
        ..Default::default()
    };

    let result = eframe::run_native(
        "kine",
        native_options,
        Box::new(move |_cc| Ok(Box::new(KineApp::new(session, &INTERRUPTED)))),
    );
    if let Err(e) = result {
        eprintln!("[kine] window: {e}");
        std::process::exit(1);
    }
}
