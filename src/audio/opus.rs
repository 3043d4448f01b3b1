use audiopus::coder::{Decoder as OpusDecoderInner, Encoder as OpusEncoderInner};
use audiopus::packet::Packet;
use audiopus::{Application, Bitrate, Channels, MutSignals, SampleRate};
use thiserror::Error;

use super::{CHANNELS, FRAME_LEN, MAX_PACKET_SIZE};

#[derive(Debug, Error)]
pub enum OpusError {
    #[error("opus codec error: {0}")]
    Codec(#[from] audiopus::Error),
    #[error("frame size mismatch: expected {expected}, got {actual}")]
    FrameSizeMismatch { expected: usize, actual: usize },
}

/// Turns one 20 ms interleaved stereo frame into a compressed packet.
pub trait FrameEncoder: Send {
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, OpusError>;
}

/// Inverse of [`FrameEncoder`]; `None` asks for loss concealment.
pub trait FrameDecoder: Send {
    fn decode(&mut self, packet: Option<&[u8]>) -> Result<Vec<i16>, OpusError>;
}

/// 48 kHz stereo music-oriented encoder.
pub struct OpusEncoder {
    inner: OpusEncoderInner,
    encode_buf: Vec<u8>,
}

impl OpusEncoder {
    pub fn new() -> Result<Self, OpusError> {
        let mut encoder =
            OpusEncoderInner::new(SampleRate::Hz48000, Channels::Stereo, Application::Audio)?;
        encoder.set_bitrate(Bitrate::BitsPerSecond(128_000))?;
        encoder.set_inband_fec(true)?;
        encoder.set_packet_loss_perc(5u8)?;

        Ok(Self {
            inner: encoder,
            encode_buf: vec![0u8; MAX_PACKET_SIZE],
        })
    }

    pub fn set_bitrate(&mut self, bps: i32) -> Result<(), OpusError> {
        self.inner.set_bitrate(Bitrate::BitsPerSecond(bps))?;
        Ok(())
    }
}

impl FrameEncoder for OpusEncoder {
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, OpusError> {
        if pcm.len() != FRAME_LEN {
            return Err(OpusError::FrameSizeMismatch {
                expected: FRAME_LEN,
                actual: pcm.len(),
            });
        }
        let len = self.inner.encode(pcm, &mut self.encode_buf)?;
        Ok(self.encode_buf[..len].to_vec())
    }
}

/// Decoder for one remote speaker.
pub struct OpusDecoder {
    inner: OpusDecoderInner,
    decode_buf: Vec<i16>,
}

impl OpusDecoder {
    pub fn new() -> Result<Self, OpusError> {
        Ok(Self {
            inner: OpusDecoderInner::new(SampleRate::Hz48000, Channels::Stereo)?,
            decode_buf: vec![0i16; FRAME_LEN],
        })
    }
}

impl FrameDecoder for OpusDecoder {
    fn decode(&mut self, packet: Option<&[u8]>) -> Result<Vec<i16>, OpusError> {
        let packet: Option<Packet<'_>> = match packet {
            Some(data) => Some(data.try_into()?),
            None => None,
        };
        let output: MutSignals<'_, i16> = (&mut self.decode_buf[..]).try_into()?;
        // Returned length is per channel.
        let per_channel = self.inner.decode(packet, output, false)?;
        Ok(self.decode_buf[..per_channel * CHANNELS].to_vec())
    }
}
