// crates/kine-media/src/packet.rs
//
// What the packet queues carry: a demuxed FFmpeg packet, or the
// end-of-stream terminator the reader injects at EOF so the decoder can
// switch the codec into drain mode.

use ffmpeg_the_third as ffmpeg;

use kine_core::PacketItem;

pub enum StreamPacket {
    Data(ffmpeg::Packet),
    /// Injected once per active stream when the container reports EOF.
    Terminator,
}

impl PacketItem for StreamPacket {
    fn byte_size(&self) -> usize {
        match self {
            StreamPacket::Data(p) => p.size(),
            StreamPacket::Terminator => 0,
        }
    }

    fn duration_units(&self) -> i64 {
        match self {
            StreamPacket::Data(p) => p.duration(),
            StreamPacket::Terminator => 0,
        }
    }
}
