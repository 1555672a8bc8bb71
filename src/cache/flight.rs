use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::domain::types::ResourceId;

/// Per-resource single-flight guard around render and write.
///
/// Callers for the same id queue behind one async mutex; the first holder
/// renders and stores, later holders re-check the store before rendering.
#[derive(Default, Clone)]
pub struct FlightGroup {
    flights: Arc<DashMap<ResourceId, Arc<Mutex<()>>>>,
}

impl FlightGroup {
    pub fn new() -> Self {
        Self {
            flights: Arc::new(DashMap::new()),
        }
    }

    /// Wait for exclusive access to `id`.
    pub async fn acquire(&self, id: ResourceId) -> FlightGuard {
        let lock = self
            .flights
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;
        FlightGuard {
            id,
            guard: Some(guard),
            flights: Arc::clone(&self.flights),
        }
    }

    /// Ids with a live or queued flight.
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }
}

pub struct FlightGuard {
    id: ResourceId,
    guard: Option<OwnedMutexGuard<()>>,
    flights: Arc<DashMap<ResourceId, Arc<Mutex<()>>>>,
}

impl FlightGuard {
    pub fn id(&self) -> ResourceId {
        self.id
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        // Release before inspecting the count; the guard holds one reference.
        drop(self.guard.take());
        // One reference in the map; anything above that is a queued waiter.
        self.flights
            .remove_if(&self.id, |_, lock| Arc::strong_count(lock) <= 1);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn id(value: u64) -> ResourceId {
        ResourceId::new(value).expect("non-zero id")
    }

    #[tokio::test]
    async fn entry_is_removed_after_last_guard() {
        let group = FlightGroup::new();
        {
            let guard = group.acquire(id(42)).await;
            assert_eq!(guard.id(), id(42));
            assert_eq!(group.in_flight(), 1);
        }
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test]
    async fn second_caller_waits_for_first() {
        let group = FlightGroup::new();
        let first = group.acquire(id(7)).await;

        let contender = group.clone();
        let waiter = tokio::spawn(async move {
            let _guard = contender.acquire(id(7)).await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(first);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter acquires after release")
            .expect("waiter task");
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test]
    async fn distinct_ids_do_not_block() {
        let group = FlightGroup::new();
        let _a = group.acquire(id(1)).await;
        let _b = tokio::time::timeout(Duration::from_millis(100), group.acquire(id(2)))
            .await
            .expect("independent id");
        assert_eq!(group.in_flight(), 2);
    }
}
