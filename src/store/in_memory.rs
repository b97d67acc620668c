use std::{
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use dashmap::{
    DashMap,
    mapref::entry::Entry,
};

use crate::{
    clock::{Clock, SystemClock},
    error::{GatewayError, GatewayResult},
    store::SharedStore,
};

/// Single-instance store. Each key lives in one `DashMap` shard and every
/// operation runs under that shard's entry lock, which gives the same
/// atomicity the Redis scripts provide.
pub struct InMemoryStore {
    slots: DashMap<String, Slot>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug)]
struct Slot {
    value: SlotValue,
    expires_at: Option<u64>,
}

#[derive(Debug)]
enum SlotValue {
    Counter(u64),
    Text(String),
}

impl Slot {
    fn new(value: SlotValue, now: u64, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| now.saturating_add(ttl_millis(ttl))),
        }
    }

    fn is_live(&self, now: u64) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }

    fn render(&self) -> String {
        match &self.value {
            SlotValue::Counter(n) => n.to_string(),
            SlotValue::Text(text) => text.clone(),
        }
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: DashMap::new(),
            clock,
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStore for InMemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn now_millis(&self) -> GatewayResult<u64> {
        Ok(self.clock.now_millis())
    }

    async fn increment(&self, key: &str, ttl: Duration) -> GatewayResult<u64> {
        let now = self.clock.now_millis();
        let mut slot = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| Slot::new(SlotValue::Counter(0), now, Some(ttl)));

        if !slot.is_live(now) {
            *slot = Slot::new(SlotValue::Counter(0), now, Some(ttl));
        }

        match &mut slot.value {
            SlotValue::Counter(count) => {
                *count += 1;
                Ok(*count)
            }
            SlotValue::Text(_) => Err(GatewayError::Store(format!(
                "value at {key} is not a counter"
            ))),
        }
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> GatewayResult<bool> {
        let now = self.clock.now_millis();
        let replacement = || Slot::new(SlotValue::Text(new.to_string()), now, ttl);

        match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied
                    .get()
                    .is_live(now)
                    .then(|| occupied.get().render());
                if current.as_deref() == expected {
                    occupied.insert(replacement());
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                if expected.is_none() {
                    vacant.insert(replacement());
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    async fn get(&self, key: &str) -> GatewayResult<Option<String>> {
        let now = self.clock.now_millis();
        Ok(self
            .slots
            .get(key)
            .filter(|slot| slot.is_live(now))
            .map(|slot| slot.render()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> GatewayResult<()> {
        let now = self.clock.now_millis();
        self.slots.insert(
            key.to_string(),
            Slot::new(SlotValue::Text(value.to_string()), now, ttl),
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> GatewayResult<()> {
        self.slots.remove(key);
        Ok(())
    }

    fn purge_expired(&self) {
        let now = self.clock.now_millis();
        self.slots.retain(|_, slot| slot.is_live(now));
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}
