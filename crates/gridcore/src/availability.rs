use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::common::Map;
use crate::common::timeutils::now_monotonic;
use crate::event::{EventManager, InstanceEvent, InstanceEventKind};

#[derive(Debug, Clone)]
pub struct AvailabilityConfig {
    /// How many failures in a row make an instance type unavailable.
    pub unavail_count_failure: u32,
    /// How many insufficient capacity errors in a row make an instance type unavailable.
    pub unavail_count_insufficient: u32,
    /// For how long is an instance type unavailable.
    pub unavail_delay: Duration,
}

impl Default for AvailabilityConfig {
    fn default() -> Self {
        Self {
            unavail_count_failure: 3,
            unavail_count_insufficient: 1,
            unavail_delay: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Default)]
struct InstanceTypeCounters {
    failures: u32,
    insufficient: u32,
    unavailable_since: Option<Instant>,
}

/// Temporarily excludes instance types that repeatedly failed to launch.
///
/// Each instance type is tracked separately. An `Available` event resets its counters.
/// Once the failure or insufficient capacity counter reaches its threshold, the instance type
/// becomes unavailable for `unavail_delay`, starting at the latest event of the streak.
pub struct InstanceAvailabilityManager {
    events: Rc<EventManager>,
    config: AvailabilityConfig,
}

impl InstanceAvailabilityManager {
    pub fn new(events: Rc<EventManager>, config: AvailabilityConfig) -> Self {
        Self { events, config }
    }

    /// Instance types that should not be launched at the moment.
    pub fn get_unavailable(&self) -> Vec<String> {
        let now = now_monotonic();
        let mut counters: Map<String, InstanceTypeCounters> = Map::default();
        // Registration order of the events is chronological
        for event in self.events.get() {
            let entry = counters.entry(event.instance_type.clone()).or_default();
            self.apply_event(entry, &event);
        }

        let mut unavailable: Vec<String> = counters
            .into_iter()
            .filter_map(|(instance_type, counters)| {
                let since = counters.unavailable_since?;
                (now.saturating_duration_since(since) < self.config.unavail_delay)
                    .then_some(instance_type)
            })
            .collect();
        unavailable.sort_unstable();
        unavailable
    }

    fn apply_event(&self, counters: &mut InstanceTypeCounters, event: &InstanceEvent) {
        match event.kind {
            InstanceEventKind::Available => {
                *counters = InstanceTypeCounters::default();
            }
            InstanceEventKind::Insufficient => counters.insufficient += 1,
            InstanceEventKind::Failing => counters.failures += 1,
        }
        if counters.failures >= self.config.unavail_count_failure
            || counters.insufficient >= self.config.unavail_count_insufficient
        {
            log::debug!(
                "Instance type {} reached unavailability threshold ({} failure(s), {} insufficient capacity error(s))",
                event.instance_type,
                counters.failures,
                counters.insufficient
            );
            counters.unavailable_since = Some(event.date);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AvailabilityConfig, InstanceAvailabilityManager};
    use crate::common::timeutils::mock_time::MockTime;
    use crate::event::{EventManager, InstanceEvent};
    use std::rc::Rc;
    use std::time::{Duration, Instant};

    fn create_manager(failures: u32, insufficient: u32) -> (Rc<EventManager>, InstanceAvailabilityManager) {
        let events = Rc::new(EventManager::new(Duration::from_secs(3600)));
        let manager = InstanceAvailabilityManager::new(
            events.clone(),
            AvailabilityConfig {
                unavail_count_failure: failures,
                unavail_count_insufficient: insufficient,
                unavail_delay: Duration::from_secs(600),
            },
        );
        (events, manager)
    }

    #[test]
    fn no_events_everything_available() {
        let (_, manager) = create_manager(3, 1);
        assert!(manager.get_unavailable().is_empty());
    }

    #[test]
    fn consecutive_failures_make_type_unavailable() {
        let _time = MockTime::mock(Instant::now());
        let (events, manager) = create_manager(3, 1);
        events.register(InstanceEvent::failing("m5.large"));
        events.register(InstanceEvent::failing("m5.large"));
        assert!(manager.get_unavailable().is_empty());

        events.register(InstanceEvent::failing("m5.large"));
        assert_eq!(manager.get_unavailable(), vec!["m5.large".to_string()]);
    }

    #[test]
    fn available_event_resets_failures() {
        let _time = MockTime::mock(Instant::now());
        let (events, manager) = create_manager(3, 5);
        events.register(InstanceEvent::failing("m5.large"));
        events.register(InstanceEvent::failing("m5.large"));
        events.register(InstanceEvent::available("m5.large"));
        events.register(InstanceEvent::failing("m5.large"));
        events.register(InstanceEvent::insufficient("m5.large"));
        assert!(manager.get_unavailable().is_empty());
    }

    #[test]
    fn insufficient_capacity_threshold() {
        let _time = MockTime::mock(Instant::now());
        let (events, manager) = create_manager(3, 1);
        events.register(InstanceEvent::insufficient("c5.24xlarge"));
        events.register(InstanceEvent::available("m5.large"));
        assert_eq!(manager.get_unavailable(), vec!["c5.24xlarge".to_string()]);
    }

    #[test]
    fn type_is_available_again_after_delay() {
        let time = MockTime::mock(Instant::now());
        let (events, manager) = create_manager(2, 1);
        events.register(InstanceEvent::failing("m5.large"));
        time.advance(Duration::from_secs(100));
        events.register(InstanceEvent::failing("m5.large"));

        time.advance(Duration::from_secs(599));
        assert_eq!(manager.get_unavailable(), vec!["m5.large".to_string()]);

        time.advance(Duration::from_secs(1));
        assert!(manager.get_unavailable().is_empty());
    }

    #[test]
    fn types_are_tracked_independently() {
        let _time = MockTime::mock(Instant::now());
        let (events, manager) = create_manager(2, 1);
        events.register(InstanceEvent::failing("m5.large"));
        events.register(InstanceEvent::failing("m5.xlarge"));
        assert!(manager.get_unavailable().is_empty());
        events.register(InstanceEvent::failing("m5.xlarge"));
        assert_eq!(manager.get_unavailable(), vec!["m5.xlarge".to_string()]);
    }

    #[test]
    fn failures_after_threshold_extend_unavailability() {
        let time = MockTime::mock(Instant::now());
        let (events, manager) = create_manager(2, 1);
        events.register(InstanceEvent::failing("m5.large"));
        time.advance(Duration::from_secs(100));
        events.register(InstanceEvent::failing("m5.large"));
        time.advance(Duration::from_secs(300));
        events.register(InstanceEvent::failing("m5.large"));

        time.advance(Duration::from_secs(310));
        assert_eq!(manager.get_unavailable(), vec!["m5.large".to_string()]);

        time.advance(Duration::from_secs(290));
        assert!(manager.get_unavailable().is_empty());
    }
}
