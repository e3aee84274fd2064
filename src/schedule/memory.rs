use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{ScheduleBackend, ScheduleEntry};

struct Slot {
    entry: ScheduleEntry,
    next_fire: Instant,
}

/// In-process schedule backend. Schedules live only as long as the process,
/// which is what `reconcile_schedules` exists to repair.
#[derive(Default)]
pub struct MemoryScheduleBackend {
    slots: Mutex<HashMap<String, Slot>>,
}

impl MemoryScheduleBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of the schedules due at `now`, in name order. Each returned
    /// schedule is advanced to `now + every`; missed fires are not replayed.
    pub async fn due(&self, now: Instant) -> Vec<String> {
        let mut slots = self.slots.lock().await;
        let mut names: Vec<String> = slots
            .iter_mut()
            .filter(|(_, slot)| slot.next_fire <= now)
            .map(|(name, slot)| {
                slot.next_fire = now + slot.entry.every;
                name.clone()
            })
            .collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.lock().await.is_empty()
    }
}

#[async_trait]
impl ScheduleBackend for MemoryScheduleBackend {
    async fn schedule(&self, name: &str, every: Duration, first_in: Option<Duration>) -> Result<()> {
        let next_fire = Instant::now() + first_in.unwrap_or(every);
        let entry = ScheduleEntry {
            name: name.to_string(),
            every,
            first_in,
        };
        self.slots
            .lock()
            .await
            .insert(name.to_string(), Slot { entry, next_fire });
        Ok(())
    }

    async fn unschedule(&self, name: &str) -> Result<bool> {
        Ok(self.slots.lock().await.remove(name).is_some())
    }

    async fn lookup(&self, name: &str) -> Result<Option<ScheduleEntry>> {
        Ok(self.slots.lock().await.get(name).map(|slot| slot.entry.clone()))
    }
}
