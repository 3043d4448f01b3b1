use bytes::Bytes;

pub const RTP_VERSION: u8 = 0x80;
pub const PAYLOAD_TYPE_OPUS: u8 = 0x78;
pub const HEADER_LEN: usize = 12;
/// One-byte header extension profile (RFC 8285).
pub const EXTENSION_PROFILE: u16 = 0xBEDE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = RTP_VERSION;
        buf[1] = PAYLOAD_TYPE_OPUS;
        buf[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        buf[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        buf
    }
}

/// One outbound audio frame before encryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub sequence: u16,
    pub timestamp: u32,
    pub opus_payload: Bytes,
}

/// View over an inbound RTP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpView {
    pub header: RtpHeader,
    pub payload_type: u8,
    /// Bytes authenticated but not encrypted: fixed header, CSRCs and, when
    /// present, the 4-byte extension header.
    pub aad_len: usize,
    /// Extension body length in bytes; it sits at the start of the decrypted
    /// payload and must be stripped.
    pub extension_len: usize,
}

/// Parse the unencrypted part of an RTP packet. Returns `None` for anything
/// that is not RTP version 2 or is truncated.
pub fn parse(packet: &[u8]) -> Option<RtpView> {
    if packet.len() < HEADER_LEN || packet[0] >> 6 != 2 {
        return None;
    }
    let csrc_count = (packet[0] & 0x0F) as usize;
    let has_extension = packet[0] & 0x10 != 0;

    let mut aad_len = HEADER_LEN + 4 * csrc_count;
    let mut extension_len = 0;
    if has_extension {
        let ext = packet.get(aad_len..aad_len + 4)?;
        extension_len = 4 * u16::from_be_bytes([ext[2], ext[3]]) as usize;
        aad_len += 4;
    }
    if packet.len() < aad_len {
        return None;
    }

    Some(RtpView {
        header: RtpHeader {
            sequence: u16::from_be_bytes([packet[2], packet[3]]),
            timestamp: u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]),
            ssrc: u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]),
        },
        payload_type: packet[1] & 0x7F,
        aad_len,
        extension_len,
    })
}
