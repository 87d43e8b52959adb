// crates/kine-media/src/lib.rs
//
// The FFmpeg-facing half of the player: container reading, decoding,
// filter graphs, the audio source behind the device callback, and the
// session that owns the pipeline threads.

pub mod audio;
mod decode;
mod demux;
mod filter;
pub mod frame;
pub mod packet;
pub mod session;

pub use audio::{AudioBackend, AudioOutput, AudioParams, OpenedAudio};
pub use frame::{AudioFrame, SubtitleFrame, SubtitleRect, VideoFrame};
pub use packet::StreamPacket;
pub use session::{PlayerEvent, Session, Shared, StatusSnapshot, StreamKind};
