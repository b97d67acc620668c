use std::time::Duration;

use async_trait::async_trait;
use redis::{
    Script,
    aio::ConnectionManager,
};

use crate::{
    error::GatewayResult,
    store::SharedStore,
};

const INCREMENT_LUA: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

const COMPARE_AND_SWAP_LUA: &str = r#"
local current = redis.call('GET', KEYS[1])
local has_expected = ARGV[1] == '1'
local expected = ARGV[2]
local ttl_ms = tonumber(ARGV[4])

local matches = false
if has_expected then
  matches = current == expected
else
  matches = not current
end

if not matches then
  return 0
end

if ttl_ms > 0 then
  redis.call('SET', KEYS[1], ARGV[3], 'PX', ttl_ms)
else
  redis.call('SET', KEYS[1], ARGV[3])
end
return 1
"#;

/// Cross-instance store. Read-modify-write operations run as Lua scripts so
/// Redis executes each one atomically.
pub struct RedisStore {
    manager: ConnectionManager,
    key_prefix: String,
}

impl RedisStore {
    pub async fn new(url: String, key_prefix: String) -> GatewayResult<Self> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self {
            manager,
            key_prefix,
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn now_millis(&self) -> GatewayResult<u64> {
        let mut conn = self.manager.clone();
        let (secs, micros): (u64, u64) = redis::cmd("TIME").query_async(&mut conn).await?;
        Ok(secs * 1_000 + micros / 1_000)
    }

    async fn increment(&self, key: &str, ttl: Duration) -> GatewayResult<u64> {
        let mut conn = self.manager.clone();
        let count: i64 = Script::new(INCREMENT_LUA)
            .key(self.key(key))
            .arg(ttl_millis(ttl).max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> GatewayResult<bool> {
        let mut conn = self.manager.clone();
        let swapped: i64 = Script::new(COMPARE_AND_SWAP_LUA)
            .key(self.key(key))
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.unwrap_or_default())
            .arg(new)
            .arg(ttl.map(ttl_millis).unwrap_or(0))
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }

    async fn get(&self, key: &str) -> GatewayResult<Option<String>> {
        let mut conn = self.manager.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> GatewayResult<()> {
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.key(key)).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl).max(1));
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> GatewayResult<()> {
        let mut conn = self.manager.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}
