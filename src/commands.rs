use std::path::{Component, Path};
use std::sync::Arc;

use crate::audio::source::PcmReader;
use crate::client::BotContext;
use crate::error::Result;
use crate::gateway::{DispatcherBuilder, Invocation, Privilege};

/// Register the built-in commands.
pub fn register(builder: DispatcherBuilder, ctx: Arc<BotContext>) -> DispatcherBuilder {
    macro_rules! route {
        ($builder:expr, $name:literal, $privilege:expr, $handler:ident) => {{
            let ctx = ctx.clone();
            $builder.register($name, $privilege, move |inv| {
                let ctx = ctx.clone();
                async move { $handler(&ctx, inv).await }
            })
        }};
    }

    let builder = route!(builder, "ping", Privilege::Public, ping);
    let builder = route!(builder, "join", Privilege::Public, join);
    let builder = route!(builder, "leave", Privilege::Public, leave);
    let builder = route!(builder, "play", Privilege::Public, play);
    let builder = route!(builder, "stop", Privilege::Public, stop);
    let builder = route!(builder, "status", Privilege::Privileged, status);
    let builder = route!(builder, "reconnect", Privilege::Privileged, reconnect);
    route!(builder, "shutdown", Privilege::Privileged, shutdown)
}

async fn ping(ctx: &BotContext, inv: Invocation) -> Result<()> {
    let shard = match inv.guild_id() {
        Some(guild_id) => ctx.shards.for_guild(guild_id),
        None => ctx.shards.for_guild("0"),
    };
    let text = match shard.and_then(|s| s.status().latency) {
        Some(latency) => format!("Pong! Gateway latency {} ms.", latency.as_millis()),
        None => "Pong!".to_string(),
    };
    ctx.reply(inv.channel_id(), &text).await
}

async fn join(ctx: &BotContext, inv: Invocation) -> Result<()> {
    let (Some(guild_id), Some(author_id)) = (inv.guild_id(), inv.author_id()) else {
        return ctx.reply(inv.channel_id(), "Voice only works in a server.").await;
    };
    let Some(channel_id) = ctx.voice_states.voice_channel_of(guild_id, author_id) else {
        return ctx.reply(inv.channel_id(), "Join a voice channel first.").await;
    };
    ctx.voice.join(guild_id, &channel_id).await?;
    ctx.reply(inv.channel_id(), &format!("Joined <#{channel_id}>.")).await
}

async fn leave(ctx: &BotContext, inv: Invocation) -> Result<()> {
    let Some(guild_id) = inv.guild_id() else {
        return Ok(());
    };
    ctx.voice.leave(guild_id)?;
    ctx.reply(inv.channel_id(), "Left the voice channel.").await
}

/// Only plain relative paths below the working directory are playable.
fn playable_path(arg: &str) -> Option<&Path> {
    let path = Path::new(arg);
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        .then_some(path)
}

async fn play(ctx: &BotContext, inv: Invocation) -> Result<()> {
    let Some(guild_id) = inv.guild_id() else {
        return Ok(());
    };
    let Some(call) = ctx.voice.call(guild_id) else {
        return ctx.reply(inv.channel_id(), "I'm not in a voice channel.").await;
    };
    let Some(path) = inv.args.first().and_then(|a| playable_path(a)) else {
        return ctx.reply(inv.channel_id(), "Usage: play <file.pcm>").await;
    };
    let source = match PcmReader::open(path) {
        Ok(source) => source,
        Err(e) => {
            tracing::info!(path = %path.display(), "cannot open audio file: {e}");
            return ctx.reply(inv.channel_id(), "Could not open that file.").await;
        }
    };
    call.play(source).await?;
    ctx.reply(inv.channel_id(), "Playing.").await
}

async fn stop(ctx: &BotContext, inv: Invocation) -> Result<()> {
    if let Some(call) = inv.guild_id().and_then(|g| ctx.voice.call(g)) {
        call.stop().await?;
    }
    Ok(())
}

async fn status(ctx: &BotContext, inv: Invocation) -> Result<()> {
    let mut lines = vec![
        format!(
            "accordbot v{} ({})",
            env!("CARGO_PKG_VERSION"),
            option_env!("GIT_SHA").unwrap_or("unknown")
        ),
        format!("uptime {}s", ctx.started.elapsed().as_secs()),
        format!("voice calls {}", ctx.voice.active_calls()),
    ];
    for (shard_id, shard) in ctx.shards.statuses() {
        let latency = shard
            .latency
            .map(|l| format!("{} ms", l.as_millis()))
            .unwrap_or_else(|| "-".to_string());
        lines.push(format!("shard {shard_id}: {:?}, latency {latency}", shard.status));
    }
    ctx.reply(inv.channel_id(), &lines.join("\n")).await
}

/// `reconnect [shard]`: drop one shard's socket and resume it.
async fn reconnect(ctx: &BotContext, inv: Invocation) -> Result<()> {
    let Some(shard_id) = shard_arg(inv.args.first().map(String::as_str)) else {
        return ctx.reply(inv.channel_id(), "Usage: reconnect [shard]").await;
    };
    let Some(shard) = ctx.shards.shard(shard_id) else {
        return ctx
            .reply(inv.channel_id(), &format!("No shard {shard_id}."))
            .await;
    };
    let text = if shard.request_reconnect() {
        tracing::info!(shard = shard_id, by = inv.author_id().unwrap_or("-"), "reconnect requested");
        format!("Reconnecting shard {shard_id}.")
    } else {
        format!("Shard {shard_id} is already reconnecting.")
    };
    ctx.reply(inv.channel_id(), &text).await
}

fn shard_arg(arg: Option<&str>) -> Option<u32> {
    match arg {
        None => Some(0),
        Some(arg) => arg.parse().ok(),
    }
}

async fn shutdown(ctx: &BotContext, inv: Invocation) -> Result<()> {
    tracing::warn!(by = inv.author_id().unwrap_or("-"), "shutdown requested");
    ctx.reply(inv.channel_id(), "Shutting down.").await?;
    ctx.cancel.cancel();
    Ok(())
}
