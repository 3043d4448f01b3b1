mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use accordbot::client::ReplySink;
use accordbot::error::{Error, Result};
use accordbot::gateway::{DispatcherBuilder, GatewaySession, Privilege};
use async_trait::async_trait;
use common::{FakeServer, Protocol};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct RecordingSink {
    sent: Mutex<Vec<(String, String)>>,
    deleted: Mutex<Vec<String>>,
}

#[async_trait]
impl ReplySink for RecordingSink {
    async fn reply(&self, channel_id: &str, content: &str) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((channel_id.to_string(), content.to_string()));
        Ok(())
    }

    async fn delete_message(&self, _channel_id: &str, message_id: &str) -> Result<()> {
        self.deleted.lock().unwrap().push(message_id.to_string());
        Ok(())
    }
}

/// A direct message, or a guild message when `guild_id` is set.
fn command(seq: u64, guild_id: Option<&str>, content: &str) -> (u64, serde_json::Value) {
    let mut payload = json!({
        "id": seq.to_string(),
        "channel_id": "500",
        "author": {"id": "42", "username": "someone"},
        "content": content
    });
    if let Some(guild_id) = guild_id {
        payload["guild_id"] = json!(guild_id);
    }
    (seq, payload)
}

#[tokio::test]
async fn test_privileged_command_over_the_gateway_requires_master_key() {
    let mut server = FakeServer::start(Protocol::Gateway).await;
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let (session, _handle) =
        GatewaySession::new(common::gateway_config(&server.url), events_tx, cancel.clone());
    let task = tokio::spawn(session.run());

    let runs = Arc::new(AtomicUsize::new(0));
    let sink = Arc::new(RecordingSink::default());
    let dispatcher = {
        let runs = runs.clone();
        DispatcherBuilder::new("!")
            .master_key(Some("correct horse"))
            .register("purge", Privilege::Privileged, move |_inv| {
                let runs = runs.clone();
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .build(sink.clone())
    };

    let mut conn = server.accept().await;
    conn.hello(45_000).await;
    conn.recv_op(2).await;
    conn.ready(1, "session-abc", &server.url).await;
    for (seq, payload) in [
        command(2, None, "!purge"),
        command(3, None, "!purge key:wrong"),
        command(4, None, "!purge key:correct horse"),
        command(5, None, "!purge key:correct"),
        command(6, Some("600"), "!purge key:correct"),
    ] {
        conn.dispatch(seq, "MESSAGE_CREATE", payload).await;
    }

    assert_eq!(events_rx.recv().await.unwrap().name, "READY");
    let mut outcomes = Vec::new();
    for _ in 0..5 {
        let event = events_rx.recv().await.unwrap();
        for handle in dispatcher.dispatch(event) {
            outcomes.push(handle.await.unwrap());
        }
    }

    // a key containing a space is split at the whitespace, so every attempt
    // above is denied; the guild one is also deleted
    assert_eq!(outcomes.len(), 6);
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        outcomes
            .iter()
            .filter(|r| matches!(r, Err(Error::AuthorizationDenied)))
            .count(),
        5
    );
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(*sink.deleted.lock().unwrap(), vec!["6".to_string()]);

    let sent = sink.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 5);
    for (channel, content) in &sent {
        assert_eq!(channel, "500");
        assert!(!content.contains("correct"));
    }

    cancel.cancel();
    assert!(task.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_privileged_command_runs_with_master_key() {
    let runs = Arc::new(AtomicUsize::new(0));
    let sink = Arc::new(RecordingSink::default());
    let dispatcher = {
        let runs = runs.clone();
        DispatcherBuilder::new("!")
            .master_key(Some("hunter2"))
            .register("purge", Privilege::Privileged, move |inv| {
                let runs = runs.clone();
                async move {
                    assert_eq!(inv.args, vec!["all".to_string()]);
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .build(sink.clone())
    };

    let (_, payload) = command(7, None, "!purge all key:hunter2");
    let event = accordbot::gateway::DispatchEvent {
        shard_id: 0,
        sequence: 7,
        name: "MESSAGE_CREATE".to_string(),
        payload,
    };
    for handle in dispatcher.dispatch(event) {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(sink.sent.lock().unwrap().is_empty());
    assert!(sink.deleted.lock().unwrap().is_empty());
}
