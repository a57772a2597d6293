use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::common::timeutils::now_monotonic;

/// Maximum number of instance events stored in memory
const MAX_EVENT_QUEUE_LENGTH: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceEventKind {
    /// An instance of the type was launched and joined the cluster.
    Available,
    /// The cloud provider had no capacity for the instance type.
    Insufficient,
    /// The instance could not be launched or did not initialize in time.
    Failing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceEvent {
    pub kind: InstanceEventKind,
    pub instance_type: String,
    pub date: Instant,
}

impl InstanceEvent {
    pub fn new(kind: InstanceEventKind, instance_type: impl Into<String>) -> Self {
        Self {
            kind,
            instance_type: instance_type.into(),
            date: now_monotonic(),
        }
    }

    pub fn available(instance_type: impl Into<String>) -> Self {
        Self::new(InstanceEventKind::Available, instance_type)
    }

    pub fn insufficient(instance_type: impl Into<String>) -> Self {
        Self::new(InstanceEventKind::Insufficient, instance_type)
    }

    pub fn failing(instance_type: impl Into<String>) -> Self {
        Self::new(InstanceEventKind::Failing, instance_type)
    }
}

/// Time-windowed log of instance provisioning events.
///
/// Events are never removed eagerly, expired events are pruned when the events are read.
pub struct EventManager {
    ttl: Duration,
    events: Mutex<VecDeque<InstanceEvent>>,
}

impl EventManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            events: Default::default(),
        }
    }

    pub fn register(&self, event: InstanceEvent) {
        log::debug!(
            "Registering {:?} event for instance type {}",
            event.kind,
            event.instance_type
        );
        let mut events = self.lock();
        events.push_back(event);
        if events.len() > MAX_EVENT_QUEUE_LENGTH {
            events.pop_front();
        }
    }

    /// Returns all events that are not older than `ttl`, in registration order.
    pub fn get(&self) -> Vec<InstanceEvent> {
        let now = now_monotonic();
        let mut events = self.lock();
        events.retain(|event| now.saturating_duration_since(event.date) <= self.ttl);
        events.iter().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<InstanceEvent>> {
        // A panic while holding the lock cannot leave the queue in an inconsistent state.
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::{EventManager, InstanceEvent, InstanceEventKind};
    use crate::common::timeutils::mock_time::MockTime;
    use std::time::{Duration, Instant};

    #[test]
    fn get_returns_events_in_order() {
        let manager = EventManager::new(Duration::from_secs(60));
        manager.register(InstanceEvent::available("m5.large"));
        manager.register(InstanceEvent::failing("m5.xlarge"));

        let events = manager.get();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, InstanceEventKind::Available);
        assert_eq!(events[1].instance_type, "m5.xlarge");
    }

    #[test]
    fn expired_events_are_pruned_on_read() {
        let time = MockTime::mock(Instant::now());
        let manager = EventManager::new(Duration::from_secs(60));
        manager.register(InstanceEvent::failing("m5.large"));
        time.advance(Duration::from_secs(30));
        manager.register(InstanceEvent::insufficient("m5.large"));

        time.advance(Duration::from_secs(31));
        let events = manager.get();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, InstanceEventKind::Insufficient);

        time.advance(Duration::from_secs(60));
        assert!(manager.get().is_empty());
    }
}
