//! Aggregation Store (§4.B) — ephemeral, TTL-bounded per-correlation-id
//! state: `count`, `data`, `final`.
//!
//! Grounded on `examples/original_source/services/moderation_aggregator/app/events/service.py`'s
//! `LUA_INITIALIZE_AND_DECR` script, which the original unconditionally
//! decrements on every delivery. §4.B/§4.F of the specification redesign
//! this into an *idempotent first-seen* decrement — the script hash-sets
//! `data[service]` and only decrements `count` the first time that field is
//! written — plus a cached `final` key so a retried publish can recover the
//! already-computed event instead of re-folding. The atomic script is, per
//! §9 "Design Notes", the load-bearing primitive: it must ship as one
//! server-side script, not a client-side read-modify-write.

use redis::AsyncCommands;

/// KEYS[1] = count key, KEYS[2] = data key
/// ARGV[1] = expected count (only used if count key is absent)
/// ARGV[2] = TTL in seconds
/// ARGV[3] = service name
/// ARGV[4] = status string
///
/// Returns the remaining count after this call.
const LUA_FIRST_SEEN_DECR: &str = r#"
local count_key = KEYS[1]
local data_key = KEYS[2]
local expected = ARGV[1]
local ttl = ARGV[2]
local service = ARGV[3]
local status = ARGV[4]

if redis.call('exists', count_key) == 0 then
    redis.call('set', count_key, expected)
end
redis.call('expire', count_key, ttl)
redis.call('expire', data_key, ttl)

local is_new = redis.call('hsetnx', data_key, service, status)
if is_new == 1 then
    return redis.call('decr', count_key)
else
    local current = redis.call('get', count_key)
    return tonumber(current)
end
"#;

#[derive(Clone)]
pub struct AggregationStore {
    client: redis::Client,
    ttl_seconds: u64,
}

fn count_key(cid: &str) -> String {
    format!("agg:{cid}:count")
}

fn data_key(cid: &str) -> String {
    format!("agg:{cid}:data")
}

fn final_key(cid: &str) -> String {
    format!("agg:{cid}:final")
}

impl AggregationStore {
    pub fn new(redis_url: &str, ttl_seconds: u64) -> crate::error::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client, ttl_seconds })
    }

    async fn conn(&self) -> redis::RedisResult<redis::aio::MultiplexedConnection> {
        self.client.get_multiplexed_async_connection().await
    }

    /// Apply the first-seen decrement for one inbound result. Returns the
    /// remaining expected-result count after this call (may be <= 0).
    pub async fn record_result(
        &self,
        correlation_id: &str,
        expected: u32,
        service_name: &str,
        status: &str,
    ) -> anyhow::Result<i64> {
        let mut conn = self.conn().await?;
        let remaining: i64 = redis::Script::new(LUA_FIRST_SEEN_DECR)
            .key(count_key(correlation_id))
            .key(data_key(correlation_id))
            .arg(expected.max(1))
            .arg(self.ttl_seconds)
            .arg(service_name)
            .arg(status)
            .invoke_async(&mut conn)
            .await?;
        Ok(remaining)
    }

    /// All per-service statuses recorded so far for a correlation id.
    pub async fn all_statuses(
        &self,
        correlation_id: &str,
    ) -> anyhow::Result<std::collections::HashMap<String, String>> {
        let mut conn = self.conn().await?;
        let map: std::collections::HashMap<String, String> =
            conn.hgetall(data_key(correlation_id)).await?;
        Ok(map)
    }

    /// Read the cached final event body, if one has already been computed
    /// for this correlation id.
    pub async fn read_final(&self, correlation_id: &str) -> anyhow::Result<Option<String>> {
        let mut conn = self.conn().await?;
        let value: Option<String> = conn.get(final_key(correlation_id)).await?;
        Ok(value)
    }

    /// Cache the computed final event so a retried publish path can recover
    /// it idempotently instead of re-folding.
    pub async fn write_final(&self, correlation_id: &str, body: &str) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn
            .set_ex(final_key(correlation_id), body, self.ttl_seconds)
            .await?;
        Ok(())
    }

    /// Delete all three keys for a correlation id. Called only after the
    /// final event has been published and confirmed (§4.F.3).
    pub async fn cleanup(&self, correlation_id: &str) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn
            .del(&[
                count_key(correlation_id),
                data_key(correlation_id),
                final_key(correlation_id),
            ])
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_names_are_namespaced_per_correlation_id() {
        assert_eq!(count_key("abc"), "agg:abc:count");
        assert_eq!(data_key("abc"), "agg:abc:data");
        assert_eq!(final_key("abc"), "agg:abc:final");
    }

    #[test]
    fn lua_script_is_nonempty_and_uses_hsetnx() {
        // A read-modify-write on the client side (GET then SET) would not be
        // atomic under concurrent aggregator replicas; the script must use
        // HSETNX so "is this the first time we've seen this service" and the
        // decrement happen as one atomic operation on the server.
        assert!(LUA_FIRST_SEEN_DECR.contains("hsetnx"));
        assert!(LUA_FIRST_SEEN_DECR.contains("decr"));
    }
}
