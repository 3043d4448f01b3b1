use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::task::JoinHandle;

use super::events::{event_name, DispatchEvent, MessageData};
use crate::client::ReplySink;
use crate::error::{Error, Result};

/// Argument prefix carrying the master key on privileged commands.
pub const KEY_ARG_PREFIX: &str = "key:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    Public,
    Privileged,
}

/// What a handler receives. `command` is set when the event was a prefix
/// command addressed to this bot.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub event: Arc<DispatchEvent>,
    pub message: Option<Arc<MessageData>>,
    pub command: Option<String>,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn channel_id(&self) -> Option<&str> {
        self.message.as_deref().map(|m| m.channel_id.as_str())
    }

    pub fn guild_id(&self) -> Option<&str> {
        self.message.as_deref().and_then(|m| m.guild_id.as_deref())
    }

    pub fn author_id(&self) -> Option<&str> {
        self.message.as_deref().map(|m| m.author.id.as_str())
    }
}

pub type HandlerFuture = BoxFuture<'static, Result<()>>;
pub type Handler = Arc<dyn Fn(Invocation) -> HandlerFuture + Send + Sync>;

struct Route {
    privilege: Privilege,
    handler: Handler,
}

/// Digest of the configured master key. The plaintext is not retained.
#[derive(Clone)]
pub struct MasterKey {
    digest: [u8; 32],
}

impl MasterKey {
    pub fn new(key: &str) -> Self {
        Self {
            digest: Sha256::digest(key.as_bytes()).into(),
        }
    }

    /// Constant-time comparison of a supplied key against the configured one.
    pub fn verify(&self, supplied: &str) -> bool {
        let supplied: [u8; 32] = Sha256::digest(supplied.as_bytes()).into();
        supplied[..].ct_eq(&self.digest[..]).into()
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub name: String,
    pub args: Vec<String>,
    pub key: Option<String>,
}

/// Split `!name arg1 key:secret arg2` into its parts. The key argument is
/// pulled out so handlers never see it.
pub fn parse_command(prefix: &str, content: &str) -> Option<ParsedCommand> {
    let rest = content.trim_start().strip_prefix(prefix)?;
    let mut words = rest.split_whitespace();
    let name = words.next()?.to_lowercase();
    let mut args = Vec::new();
    let mut key = None;
    for word in words {
        match word.strip_prefix(KEY_ARG_PREFIX) {
            Some(secret) if key.is_none() => key = Some(secret.to_string()),
            _ => args.push(word.to_string()),
        }
    }
    Some(ParsedCommand { name, args, key })
}

pub struct DispatcherBuilder {
    prefix: String,
    master_key: Option<MasterKey>,
    routes: HashMap<String, Vec<Route>>,
}

impl DispatcherBuilder {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            master_key: None,
            routes: HashMap::new(),
        }
    }

    pub fn master_key(mut self, key: Option<&str>) -> Self {
        self.master_key = key.filter(|k| !k.is_empty()).map(MasterKey::new);
        self
    }

    /// Register a handler under a dispatch event name (`MESSAGE_CREATE`) or a
    /// prefix command name (`ping`).
    pub fn register<F, Fut>(mut self, name: &str, privilege: Privilege, handler: F) -> Self
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |inv| handler(inv).boxed());
        self.routes
            .entry(name.to_string())
            .or_default()
            .push(Route { privilege, handler });
        self
    }

    pub fn build(self, replies: Arc<dyn ReplySink>) -> CommandDispatcher {
        CommandDispatcher {
            inner: Arc::new(Registry {
                prefix: self.prefix,
                master_key: self.master_key,
                routes: self.routes,
                replies,
            }),
        }
    }
}

struct Registry {
    prefix: String,
    master_key: Option<MasterKey>,
    routes: HashMap<String, Vec<Route>>,
    replies: Arc<dyn ReplySink>,
}

/// Routes dispatch events to handlers. The registry is frozen at `build` and
/// shared read-only, so lookups need no locking.
#[derive(Clone)]
pub struct CommandDispatcher {
    inner: Arc<Registry>,
}

impl CommandDispatcher {
    pub fn prefix(&self) -> &str {
        &self.inner.prefix
    }

    /// Every registered event or command name.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.inner.routes.keys().map(String::as_str)
    }

    /// Spawn every matching handler and return immediately. Each handle
    /// resolves to the handler's outcome; denied and panicked invocations
    /// resolve to `AuthorizationDenied` and `HandlerPanic`. A guild message
    /// that carried a key also yields the handle of its deletion, first.
    pub fn dispatch(&self, event: DispatchEvent) -> Vec<JoinHandle<Result<()>>> {
        let event = Arc::new(event);
        let mut spawned = Vec::new();

        if let Some(routes) = self.inner.routes.get(&event.name) {
            let inv = Invocation {
                event: event.clone(),
                message: None,
                command: None,
                args: Vec::new(),
            };
            for route in routes {
                spawned.push(self.spawn_route(route, inv.clone(), None));
            }
        }

        if event.name == event_name::MESSAGE_CREATE {
            if let Some((message, parsed)) = self.parse_message(&event) {
                if parsed.key.is_some() && message.guild_id.is_some() {
                    spawned.push(self.spawn_redaction(message.clone()));
                }
                let Some(routes) = self.inner.routes.get(&parsed.name) else {
                    tracing::debug!(command = %parsed.name, "unknown command");
                    return spawned;
                };
                let inv = Invocation {
                    event: event.clone(),
                    message: Some(message),
                    command: Some(parsed.name.clone()),
                    args: parsed.args.clone(),
                };
                for route in routes {
                    spawned.push(self.spawn_route(route, inv.clone(), parsed.key.as_deref()));
                }
            }
        }

        spawned
    }

    fn parse_message(&self, event: &DispatchEvent) -> Option<(Arc<MessageData>, ParsedCommand)> {
        let message: MessageData = match serde_json::from_value(event.payload.clone()) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(shard = event.shard_id, seq = event.sequence, "unreadable MESSAGE_CREATE: {e}");
                return None;
            }
        };
        if message.author.bot {
            return None;
        }
        let parsed = parse_command(&self.inner.prefix, &message.content)?;
        Some((Arc::new(message), parsed))
    }

    fn authorized(&self, supplied: Option<&str>) -> bool {
        match (&self.inner.master_key, supplied) {
            (Some(key), Some(supplied)) => key.verify(supplied),
            _ => false,
        }
    }

    /// Remove a guild message that showed the master key to the channel.
    fn spawn_redaction(&self, message: Arc<MessageData>) -> JoinHandle<Result<()>> {
        let registry = self.inner.clone();
        tokio::spawn(async move {
            let deleted = registry
                .replies
                .delete_message(&message.channel_id, &message.id)
                .await;
            match &deleted {
                Ok(()) => tracing::info!(
                    channel_id = %message.channel_id,
                    message_id = %message.id,
                    "deleted message carrying a key"
                ),
                Err(e) => tracing::warn!(
                    channel_id = %message.channel_id,
                    message_id = %message.id,
                    "could not delete message carrying a key: {e}"
                ),
            }
            deleted
        })
    }

    fn spawn_route(
        &self,
        route: &Route,
        inv: Invocation,
        supplied_key: Option<&str>,
    ) -> JoinHandle<Result<()>> {
        let registry = self.inner.clone();
        let label = inv.command.clone().unwrap_or_else(|| inv.event.name.clone());

        // privileged commands are only taken from direct messages
        let in_guild = inv.guild_id().is_some();
        if route.privilege == Privilege::Privileged && (in_guild || !self.authorized(supplied_key)) {
            // never log the supplied key
            tracing::warn!(
                handler = %label,
                author = inv.author_id().unwrap_or("-"),
                in_guild,
                "privileged invocation denied"
            );
            return tokio::spawn(async move {
                report(&registry, &inv, &Error::AuthorizationDenied).await;
                Err(Error::AuthorizationDenied)
            });
        }

        let handler = route.handler.clone();
        tokio::spawn(async move {
            let run = {
                let inv = inv.clone();
                AssertUnwindSafe(async move { handler(inv).await }).catch_unwind()
            };
            let result = match run.await {
                Ok(result) => result,
                Err(panic) => {
                    tracing::error!(handler = %label, "handler panicked: {}", panic_message(&*panic));
                    Err(Error::HandlerPanic)
                }
            };
            if let Err(ref e) = result {
                if !matches!(e, Error::HandlerPanic) {
                    tracing::warn!(handler = %label, "handler failed: {e}");
                }
                report(&registry, &inv, e).await;
            }
            result
        })
    }
}

/// Tell the invoking channel that the command failed, without internals.
async fn report(registry: &Registry, inv: &Invocation, error: &Error) {
    let Some(channel_id) = inv.channel_id() else {
        return;
    };
    if let Err(e) = registry.replies.reply(channel_id, error.user_message()).await {
        tracing::warn!(channel_id, "failed to report command error: {e}");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(String, String)>>,
        deleted: Mutex<Vec<(String, String)>>,
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

        async fn delete_message(&self, channel_id: &str, message_id: &str) -> Result<()> {
            self.deleted
                .lock()
                .unwrap()
                .push((channel_id.to_string(), message_id.to_string()));
            Ok(())
        }
    }

    /// A direct message to the bot.
    fn message_event(content: &str) -> DispatchEvent {
        DispatchEvent {
            shard_id: 0,
            sequence: 1,
            name: "MESSAGE_CREATE".into(),
            payload: serde_json::json!({
                "id": "10",
                "channel_id": "20",
                "author": { "id": "40", "username": "alice" },
                "content": content,
            }),
        }
    }

    fn guild_message_event(content: &str) -> DispatchEvent {
        let mut event = message_event(content);
        event.payload["guild_id"] = serde_json::json!("30");
        event
    }

    async fn join_all(handles: Vec<JoinHandle<Result<()>>>) -> Vec<Result<()>> {
        let mut out = Vec::new();
        for h in handles {
            out.push(h.await.unwrap());
        }
        out
    }

    #[test]
    fn test_parse_command_extracts_key() {
        let parsed = parse_command("!", "!Shutdown now key:hunter2 please").unwrap();
        assert_eq!(parsed.name, "shutdown");
        assert_eq!(parsed.args, vec!["now", "please"]);
        assert_eq!(parsed.key.as_deref(), Some("hunter2"));
        assert!(parse_command("!", "hello").is_none());
        assert!(parse_command("!", "!").is_none());
    }

    #[test]
    fn test_master_key_verify() {
        let key = MasterKey::new("correct horse");
        assert!(key.verify("correct horse"));
        assert!(!key.verify("correct hors"));
        assert!(!key.verify(""));
        assert_eq!(format!("{key:?}"), "MasterKey(<redacted>)");
    }

    #[tokio::test]
    async fn test_privileged_wrong_key_is_denied() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sink = Arc::new(RecordingSink::default());
        let counter = calls.clone();
        let dispatcher = DispatcherBuilder::new("!")
            .master_key(Some("right"))
            .register("shutdown", Privilege::Privileged, move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .build(sink.clone());

        for content in ["!shutdown key:wrong", "!shutdown"] {
            let results = join_all(dispatcher.dispatch(message_event(content))).await;
            assert!(matches!(results[..], [Err(Error::AuthorizationDenied)]));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|(_, msg)| !msg.contains("wrong")));
    }

    #[tokio::test]
    async fn test_privileged_right_key_runs() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let dispatcher = DispatcherBuilder::new("!")
            .master_key(Some("right"))
            .register("status", Privilege::Privileged, move |inv| {
                let counter = counter.clone();
                async move {
                    assert!(inv.args.is_empty());
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .build(Arc::new(RecordingSink::default()));

        let results = join_all(dispatcher.dispatch(message_event("!status key:right"))).await;
        assert!(results[0].is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_right_key_in_a_guild_is_denied_and_deleted() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = DispatcherBuilder::new("!")
            .master_key(Some("right"))
            .register("status", Privilege::Privileged, move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .register("ping", Privilege::Public, |_| async { Ok(()) })
            .build(sink.clone());

        let results = join_all(dispatcher.dispatch(guild_message_event("!status key:right"))).await;
        assert!(matches!(results[..], [Ok(()), Err(Error::AuthorizationDenied)]));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            *sink.deleted.lock().unwrap(),
            vec![("20".to_string(), "10".to_string())]
        );

        // any command carrying a key is removed, even an unknown or public one
        for content in ["!ping key:right", "!nope key:right"] {
            join_all(dispatcher.dispatch(guild_message_event(content))).await;
        }
        assert_eq!(sink.deleted.lock().unwrap().len(), 3);

        // without a key there is nothing to hide
        let results = join_all(dispatcher.dispatch(guild_message_event("!ping"))).await;
        assert!(matches!(results[..], [Ok(())]));
        assert_eq!(sink.deleted.lock().unwrap().len(), 3);
        assert!(sink.sent.lock().unwrap().iter().all(|(_, m)| !m.contains("right")));
    }

    #[tokio::test]
    async fn test_no_master_key_configured_denies() {
        let dispatcher = DispatcherBuilder::new("!")
            .master_key(None)
            .register("status", Privilege::Privileged, |_| async { Ok(()) })
            .build(Arc::new(RecordingSink::default()));
        let results = join_all(dispatcher.dispatch(message_event("!status key:"))).await;
        assert!(matches!(results[..], [Err(Error::AuthorizationDenied)]));
    }

    #[tokio::test]
    async fn test_panicking_handler_is_isolated() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = DispatcherBuilder::new("!")
            .register("boom", Privilege::Public, |_| async {
                if true {
                    panic!("kaboom");
                }
                Ok(())
            })
            .register("boom", Privilege::Public, move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .build(sink.clone());

        let results = join_all(dispatcher.dispatch(message_event("!boom"))).await;
        assert!(matches!(results[0], Err(Error::HandlerPanic)));
        assert!(results[1].is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            sink.sent.lock().unwrap()[0].1,
            Error::HandlerPanic.user_message()
        );
    }

    #[tokio::test]
    async fn test_event_handlers_and_bots_ignored() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let dispatcher = DispatcherBuilder::new("!")
            .register("MESSAGE_CREATE", Privilege::Public, move |inv| {
                let counter = counter.clone();
                async move {
                    assert!(inv.command.is_none());
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .register("ping", Privilege::Public, |_| async { Ok(()) })
            .build(Arc::new(RecordingSink::default()));

        let mut event = message_event("!ping");
        event.payload["author"]["bot"] = serde_json::json!(true);
        // event listener still fires, bot-authored command does not
        let results = join_all(dispatcher.dispatch(event)).await;
        assert_eq!(results.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let results = join_all(dispatcher.dispatch(message_event("!ping"))).await;
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn test_handler_error_reported_without_detail() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = DispatcherBuilder::new("!")
            .register("fail", Privilege::Public, |_| async {
                Err(Error::ProtocolViolation("op 99 payload {...}".into()))
            })
            .build(sink.clone());
        let results = join_all(dispatcher.dispatch(message_event("!fail"))).await;
        assert!(results[0].is_err());
        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent[0], ("20".to_string(), "Command failed.".to_string()));
    }
}
