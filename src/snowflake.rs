pub fn parse(id: &str) -> Option<u64> {
    id.parse().ok()
}

/// Which shard receives a guild's events.
pub fn shard_for_guild(guild_id: u64, shard_count: u32) -> u32 {
    if shard_count == 0 {
        return 0;
    }
    ((guild_id >> 22) % u64::from(shard_count)) as u32
}

/// Like [`shard_for_guild`] for a string id; unparseable ids land on shard 0.
pub fn shard_for_guild_str(guild_id: &str, shard_count: u32) -> u32 {
    parse(guild_id)
        .map(|id| shard_for_guild(id, shard_count))
        .unwrap_or(0)
}
