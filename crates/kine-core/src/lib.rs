// crates/kine-core/src/lib.rs
//
// Plain data and synchronization primitives for the playback pipeline.
// No FFmpeg, no GUI — everything here is testable without media files.

pub mod audio_sync;
pub mod clock;
pub mod frame_queue;
pub mod options;
pub mod packet_queue;
pub mod sync;

pub use audio_sync::SampleCorrector;
pub use clock::{wall_time, Clock};
pub use frame_queue::FrameQueue;
pub use options::{ClockSource, Framedrop, PlayerOptions, PtsPolicy, SeekMode, ShowMode};
pub use sync::{ClockHub, Master};
pub use packet_queue::{
    AbortRef, PacketGet, PacketItem, PacketQueue, PacketQueueStats, QueueAborted, Serial,
    SerialRef,
};
