use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::connection::ConnectionCommand;
use super::crypto::VoiceCipher;
use crate::audio::pipeline::{FrameSink, InboundPacket};
use crate::audio::rtp::{self, AudioFrame, RtpHeader, PAYLOAD_TYPE_OPUS};
use crate::error::{Error, Result};

/// RTCP sender/receiver reports and friends share the socket with RTP.
const RTCP_PACKET_TYPES: std::ops::RangeInclusive<u8> = 200..=204;
const MAX_DATAGRAM: usize = 1500;

/// The encrypted UDP leg of an established voice session.
pub struct VoiceTransport {
    socket: Arc<UdpSocket>,
    ssrc: u32,
    cipher: Mutex<VoiceCipher>,
}

impl VoiceTransport {
    pub fn new(socket: Arc<UdpSocket>, ssrc: u32, cipher: VoiceCipher) -> Self {
        Self {
            socket,
            ssrc,
            cipher: Mutex::new(cipher),
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// RTP header plus encrypted payload, ready for the wire.
    pub fn seal_frame(&self, frame: &AudioFrame) -> Result<Vec<u8>> {
        let header = RtpHeader {
            sequence: frame.sequence,
            timestamp: frame.timestamp,
            ssrc: self.ssrc,
        }
        .to_bytes();
        let mut cipher = self.cipher.lock().unwrap_or_else(|e| e.into_inner());
        Ok(cipher.seal(&header, &frame.opus_payload)?)
    }

    pub async fn send_frame(&self, frame: &AudioFrame) -> Result<()> {
        let packet = self.seal_frame(frame)?;
        self.socket.send(&packet).await?;
        Ok(())
    }

    /// Decrypt one inbound datagram. `Ok(None)` for traffic that is not
    /// Opus RTP (RTCP, keepalives, discovery replies).
    pub fn open_packet(&self, packet: &[u8]) -> Result<Option<InboundPacket>> {
        if packet.len() >= 2 && RTCP_PACKET_TYPES.contains(&packet[1]) {
            return Ok(None);
        }
        let Some(view) = rtp::parse(packet) else {
            return Ok(None);
        };
        if view.payload_type != PAYLOAD_TYPE_OPUS {
            return Ok(None);
        }
        let plain = {
            let cipher = self.cipher.lock().unwrap_or_else(|e| e.into_inner());
            cipher.open(packet, view.aad_len)?
        };
        if plain.len() < view.extension_len {
            return Err(Error::EncodeDecodeFailure(
                "rtp extension longer than payload".into(),
            ));
        }
        Ok(Some(InboundPacket {
            ssrc: view.header.ssrc,
            sequence: view.header.sequence,
            opus: Bytes::from(plain).slice(view.extension_len..),
        }))
    }
}

/// Read the voice socket until cancelled, handing decrypted packets to the
/// receive pipeline. Undecryptable packets are dropped.
pub async fn receive_loop(
    transport: Arc<VoiceTransport>,
    packets: mpsc::Sender<InboundPacket>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            received = transport.socket.recv(&mut buf) => match received {
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(ssrc = transport.ssrc, "voice socket read failed: {e}");
                    break;
                }
            },
        };
        match transport.open_packet(&buf[..n]) {
            Ok(Some(packet)) => {
                if let Err(mpsc::error::TrySendError::Closed(_)) = packets.try_send(packet) {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => tracing::debug!("dropping inbound voice packet: {e}"),
        }
    }
    tracing::debug!("voice receive loop stopped");
}

/// Frame sink for the audio player. Frames go to whichever transport is
/// currently published; while reconnecting there is none and frames are
/// refused.
pub struct TransportSink {
    transport: watch::Receiver<Option<Arc<VoiceTransport>>>,
    commands: mpsc::UnboundedSender<ConnectionCommand>,
}

impl TransportSink {
    pub fn new(
        transport: watch::Receiver<Option<Arc<VoiceTransport>>>,
        commands: mpsc::UnboundedSender<ConnectionCommand>,
    ) -> Self {
        Self {
            transport,
            commands,
        }
    }
}

#[async_trait]
impl FrameSink for TransportSink {
    async fn send_frame(&self, frame: &AudioFrame) -> Result<()> {
        let transport = self.transport.borrow().clone().ok_or(Error::NotConnected)?;
        transport.send_frame(frame).await
    }

    async fn set_speaking(&self, speaking: bool) -> Result<()> {
        self.commands
            .send(ConnectionCommand::Speaking(speaking))
            .map_err(|_| Error::NotConnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::crypto::{EncryptionMode, KEY_LEN};

    const KEY: [u8; KEY_LEN] = [3u8; KEY_LEN];

    async fn transport(ssrc: u32) -> VoiceTransport {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let cipher = VoiceCipher::new(EncryptionMode::AeadAes256GcmRtpSize, &KEY).unwrap();
        VoiceTransport::new(Arc::new(socket), ssrc, cipher)
    }

    #[tokio::test]
    async fn test_sealed_frame_opens_on_the_other_side() {
        let ours = transport(77).await;
        let theirs = transport(1).await;
        let frame = AudioFrame {
            sequence: 9,
            timestamp: 1920,
            opus_payload: Bytes::from_static(b"opus-data"),
        };
        let packet = ours.seal_frame(&frame).unwrap();
        let inbound = theirs.open_packet(&packet).unwrap().unwrap();
        assert_eq!(inbound.ssrc, 77);
        assert_eq!(inbound.sequence, 9);
        assert_eq!(&inbound.opus[..], b"opus-data");
    }

    #[tokio::test]
    async fn test_extension_body_is_stripped() {
        let theirs = transport(1).await;
        let mut sender = VoiceCipher::new(EncryptionMode::AeadAes256GcmRtpSize, &KEY).unwrap();

        let mut aad = RtpHeader {
            sequence: 4,
            timestamp: 0,
            ssrc: 555,
        }
        .to_bytes()
        .to_vec();
        aad[0] |= 0x10;
        aad.extend_from_slice(&[0xBE, 0xDE, 0, 1]);
        let mut body = vec![0x10, 0xAA, 0, 0]; // one extension word
        body.extend_from_slice(b"voice");

        let packet = sender.seal(&aad, &body).unwrap();
        let inbound = theirs.open_packet(&packet).unwrap().unwrap();
        assert_eq!(inbound.ssrc, 555);
        assert_eq!(&inbound.opus[..], b"voice");
    }

    #[tokio::test]
    async fn test_rtcp_and_garbage_ignored() {
        let theirs = transport(1).await;
        assert!(theirs.open_packet(&[0x81, 201, 0, 7]).unwrap().is_none());
        assert!(theirs.open_packet(&[0u8; 4]).unwrap().is_none());
        let forged = RtpHeader {
            sequence: 1,
            timestamp: 1,
            ssrc: 1,
        }
        .to_bytes();
        let mut forged = forged.to_vec();
        forged.extend_from_slice(&[0u8; 24]);
        assert!(theirs.open_packet(&forged).is_err());
    }

    #[tokio::test]
    async fn test_sink_refuses_frames_without_transport() {
        let (_tx, rx) = watch::channel(None);
        let (commands, mut seen) = mpsc::unbounded_channel();
        let sink = TransportSink::new(rx, commands);
        let frame = AudioFrame {
            sequence: 0,
            timestamp: 0,
            opus_payload: Bytes::new(),
        };
        assert!(matches!(sink.send_frame(&frame).await, Err(Error::NotConnected)));

        sink.set_speaking(true).await.unwrap();
        assert!(matches!(seen.recv().await, Some(ConnectionCommand::Speaking(true))));
    }
}
