mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use accordbot::audio::source::IterSource;
use accordbot::audio::FRAME_LEN;
use accordbot::error::{Error, Result};
use accordbot::gateway::DispatchEvent;
use accordbot::voice::connection::VoiceConnectionConfig;
use accordbot::voice::crypto::VoiceCipher;
use accordbot::voice::{
    Call, EncryptionMode, VoiceConfig, VoiceManager, VoicePhase, VoiceStateSender,
};
use common::{FakeConnection, FakeServer, Protocol};
use serde_json::json;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const SSRC: u32 = 4242;
const SECRET: [u8; 32] = [7; 32];
const AES: &str = "aead_aes256_gcm_rtpsize";

type VoiceUpdate = (String, Option<String>);

/// Stands in for the main gateway; records opcode 4 sends.
struct ChannelGateway {
    sent: mpsc::UnboundedSender<VoiceUpdate>,
}

impl VoiceStateSender for ChannelGateway {
    fn update_voice_state(
        &self,
        guild_id: &str,
        channel_id: Option<&str>,
        _self_mute: bool,
        _self_deaf: bool,
    ) -> Result<()> {
        let _ = self
            .sent
            .send((guild_id.to_string(), channel_id.map(str::to_string)));
        Ok(())
    }
}

fn event(name: &str, payload: serde_json::Value) -> DispatchEvent {
    DispatchEvent {
        shard_id: 0,
        sequence: 1,
        name: name.to_string(),
        payload,
    }
}

/// Answers IP discovery and forwards every other datagram to the test.
async fn start_udp() -> (u16, mpsc::UnboundedReceiver<Vec<u8>>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = socket.local_addr().unwrap().port();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let packet = &buf[..n];
            if n == 74 && packet[0..2] == [0, 1] {
                let _ = socket.send_to(&discovery_response(packet, from), from).await;
            } else if tx.send(packet.to_vec()).is_err() {
                break;
            }
        }
    });
    (port, rx)
}

fn discovery_response(request: &[u8], from: SocketAddr) -> Vec<u8> {
    let mut packet = vec![0u8; 74];
    packet[0..2].copy_from_slice(&2u16.to_be_bytes());
    packet[2..4].copy_from_slice(&70u16.to_be_bytes());
    packet[4..8].copy_from_slice(&request[4..8]);
    let ip = from.ip().to_string();
    packet[8..8 + ip.len()].copy_from_slice(ip.as_bytes());
    packet[72..74].copy_from_slice(&from.port().to_be_bytes());
    packet
}

struct Harness {
    manager: Arc<VoiceManager>,
    updates: mpsc::UnboundedReceiver<VoiceUpdate>,
    server: FakeServer,
    udp_port: u16,
    datagrams: mpsc::UnboundedReceiver<Vec<u8>>,
    cancel: CancellationToken,
}

impl Harness {
    async fn new() -> Self {
        let (sent, updates) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let manager = Arc::new(VoiceManager::new(
            Arc::new(ChannelGateway { sent }),
            VoiceConfig {
                negotiation_timeout: Duration::from_secs(5),
                receive: false,
                connection: VoiceConnectionConfig {
                    backoff_base: Duration::from_millis(10),
                    backoff_max: Duration::from_millis(50),
                },
            },
            cancel.clone(),
        ));
        manager.handle_event(&event(
            "READY",
            json!({
                "session_id": "gw",
                "resume_gateway_url": "ws://unused",
                "user": {"id": "100", "username": "accordbot", "bot": true}
            }),
        ));
        let (udp_port, datagrams) = start_udp().await;
        Self {
            manager,
            updates,
            server: FakeServer::start(Protocol::Voice).await,
            udp_port,
            datagrams,
            cancel,
        }
    }

    /// Run a full join against the fake voice server.
    async fn join(&mut self) -> (Call, FakeConnection) {
        let joining = tokio::spawn({
            let manager = self.manager.clone();
            async move { manager.join("600", "700").await }
        });

        let update = self.updates.recv().await.unwrap();
        assert_eq!(update, ("600".to_string(), Some("700".to_string())));
        assert_eq!(self.manager.phase("600"), VoicePhase::AwaitingServerInfo);

        self.manager.handle_event(&event(
            "VOICE_SERVER_UPDATE",
            json!({"guild_id": "600", "token": "voice-token", "endpoint": self.server.url}),
        ));
        self.manager.handle_event(&event(
            "VOICE_STATE_UPDATE",
            json!({"guild_id": "600", "channel_id": "700", "user_id": "100", "session_id": "vs-1"}),
        ));

        let mut conn = self.server.accept().await;
        conn.hello(13_750).await;
        let identify = conn.recv_op(0).await;
        assert_eq!(identify["d"]["server_id"], "600");
        assert_eq!(identify["d"]["user_id"], "100");
        assert_eq!(identify["d"]["session_id"], "vs-1");
        assert_eq!(identify["d"]["token"], "voice-token");

        conn.send_json(json!({
            "op": 2,
            "d": {
                "ssrc": SSRC,
                "ip": "127.0.0.1",
                "port": self.udp_port,
                "modes": ["aead_xchacha20_poly1305_rtpsize", AES, "xsalsa20_poly1305"]
            }
        }))
        .await;

        let select = conn.recv_op(1).await;
        assert_eq!(select["d"]["protocol"], "udp");
        assert_eq!(select["d"]["data"]["mode"], AES);
        assert_eq!(select["d"]["data"]["address"], "127.0.0.1");

        conn.send_json(json!({"op": 4, "d": {"mode": AES, "secret_key": SECRET}}))
            .await;

        let call = tokio::time::timeout(common::TEST_TIMEOUT, joining)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        (call, conn)
    }
}

async fn wait_for_phase(call: &Call, phase: VoicePhase) {
    tokio::time::timeout(common::TEST_TIMEOUT, async {
        while call.phase() != phase {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("call never reached {phase:?}, stuck at {:?}", call.phase()));
}

#[tokio::test]
async fn test_join_negotiates_and_plays_encrypted_audio() {
    let mut harness = Harness::new().await;
    let (call, mut conn) = harness.join().await;
    assert_eq!(call.phase(), VoicePhase::Ready);
    assert_eq!(harness.manager.active_calls(), 1);

    call.play(IterSource::new(vec![1000i16; FRAME_LEN * 3]))
        .await
        .unwrap();

    let speaking = conn.recv_op(5).await;
    assert_eq!(speaking["d"]["speaking"], 1);
    assert_eq!(speaking["d"]["ssrc"], SSRC);

    let packet = tokio::time::timeout(common::TEST_TIMEOUT, harness.datagrams.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(packet[0], 0x80);
    assert_eq!(packet[1] & 0x7F, 0x78);
    assert_eq!(u32::from_be_bytes(packet[8..12].try_into().unwrap()), SSRC);

    let cipher = VoiceCipher::new(EncryptionMode::AeadAes256GcmRtpSize, &SECRET).unwrap();
    let opus = cipher.open(&packet, 12).unwrap();
    assert!(!opus.is_empty());

    harness.manager.leave("600").unwrap();
    assert_eq!(
        harness.updates.recv().await.unwrap(),
        ("600".to_string(), None)
    );
    assert_eq!(conn.recv_close().await, Some(1000));
    assert_eq!(harness.manager.active_calls(), 0);
    harness.cancel.cancel();
}

#[tokio::test]
async fn test_resumable_voice_close_resumes_session() {
    let mut harness = Harness::new().await;
    let (call, mut conn) = harness.join().await;

    conn.close(4015).await;

    let mut conn = harness.server.accept().await;
    conn.hello(13_750).await;
    let resume = conn.recv().await.unwrap();
    assert_eq!(resume["op"], 7, "expected resume, got {resume}");
    assert_eq!(resume["d"]["server_id"], "600");
    assert_eq!(resume["d"]["session_id"], "vs-1");
    assert_eq!(resume["d"]["token"], "voice-token");
    conn.send_json(json!({"op": 9, "d": null})).await;

    wait_for_phase(&call, VoicePhase::Ready).await;
    harness.cancel.cancel();
}

#[tokio::test]
async fn test_fatal_voice_close_ends_call() {
    let mut harness = Harness::new().await;
    let (call, mut conn) = harness.join().await;

    conn.close(4006).await;
    wait_for_phase(&call, VoicePhase::Disconnected).await;
    // no reconnect after an ending close
    assert!(tokio::time::timeout(Duration::from_millis(300), harness.server.next_connection())
        .await
        .is_err());
    harness.cancel.cancel();
}

#[tokio::test]
async fn test_join_without_server_update_times_out() {
    let (sent, mut updates) = mpsc::unbounded_channel();
    let manager = VoiceManager::new(
        Arc::new(ChannelGateway { sent }),
        VoiceConfig {
            negotiation_timeout: Duration::from_millis(200),
            ..VoiceConfig::default()
        },
        CancellationToken::new(),
    );

    let result = manager.join("600", "700").await;
    assert!(matches!(result, Err(Error::VoiceNegotiationTimeout)));
    assert_eq!(updates.recv().await.unwrap().1.as_deref(), Some("700"));
    assert_eq!(updates.recv().await.unwrap().1, None);
    assert_eq!(manager.phase("600"), VoicePhase::Disconnected);
}

#[tokio::test]
async fn test_server_update_during_call_migrates_to_new_endpoint() {
    let mut harness = Harness::new().await;
    let (call, _old) = harness.join().await;
    let mut moved = FakeServer::start(Protocol::Voice).await;

    harness.manager.handle_event(&event(
        "VOICE_SERVER_UPDATE",
        json!({"guild_id": "600", "token": "voice-token-2", "endpoint": moved.url}),
    ));

    let mut conn = moved.accept().await;
    conn.hello(13_750).await;
    // a new server knows nothing of the old session, so identify again
    let identify = conn.recv().await.unwrap();
    assert_eq!(identify["op"], 0, "expected identify, got {identify}");
    assert_eq!(identify["d"]["server_id"], "600");
    assert_eq!(identify["d"]["session_id"], "vs-1");
    assert_eq!(identify["d"]["token"], "voice-token-2");

    conn.send_json(json!({
        "op": 2,
        "d": {"ssrc": SSRC + 1, "ip": "127.0.0.1", "port": harness.udp_port, "modes": [AES]}
    }))
    .await;
    conn.recv_op(1).await;
    conn.send_json(json!({"op": 4, "d": {"mode": AES, "secret_key": SECRET}}))
        .await;

    wait_for_phase(&call, VoicePhase::Ready).await;
    assert_eq!(harness.manager.active_calls(), 1);
    // the call never left the channel
    assert!(harness.updates.try_recv().is_err());
    harness.cancel.cancel();
}
