pub mod jitter;
pub mod opus;
pub mod pacer;
pub mod pipeline;
pub mod rtp;
pub mod source;

use std::time::Duration;

/// Opus runs natively at 48 kHz; the RTP clock uses the same rate.
pub const SAMPLE_RATE: u32 = 48_000;
pub const CHANNELS: usize = 2;
pub const FRAME_DURATION: Duration = Duration::from_millis(20);
/// Samples per channel in one 20 ms frame. Also the RTP timestamp step.
pub const SAMPLES_PER_FRAME: usize = 960;
/// Interleaved samples in one stereo frame.
pub const FRAME_LEN: usize = SAMPLES_PER_FRAME * CHANNELS;
/// Largest single-frame Opus packet (RFC 6716).
pub const MAX_PACKET_SIZE: usize = 1275;
/// Pre-encoded Opus silence.
pub const SILENCE_FRAME: [u8; 3] = [0xF8, 0xFF, 0xFE];
/// Silence frames sent after a source ends so the remote decoder flushes.
pub const TRAILING_SILENCE_FRAMES: usize = 5;
/// How often an idle sender pushes a silence frame to keep the UDP path open.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

pub use pipeline::{AudioPlayer, FrameSink, PlaybackHandle};
pub use source::AudioSource;
