//! Concurrency strategies: how many requests a window takes and when it
//! may be scaled down.

use std::time::Duration;

use strata_entity::schema::{AppVersion, Concurrency};

/// Requests per instance when auto mode is chosen without a value.
pub const DEFAULT_REQUESTS_PER_INSTANCE: u32 = 10;

/// Idle time before an auto-mode window is retired.
pub const DEFAULT_SCALE_DOWN_DELAY: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Slot-based capacity, scaling to zero when idle.
    Auto {
        requests_per_instance: u32,
        scale_down_delay: Duration,
    },
    /// N always-on instances taking any number of requests.
    Fixed { instances: u32 },
}

impl Strategy {
    /// Strategy for a version. Without any concurrency config a window
    /// serves one request at a time.
    pub fn for_version(version: &AppVersion, default_delay: Duration) -> Self {
        match &version.concurrency {
            None => Self::Auto {
                requests_per_instance: 1,
                scale_down_delay: default_delay,
            },
            Some(Concurrency::Auto {
                requests_per_instance,
                scale_down_delay,
            }) => Self::Auto {
                requests_per_instance: requests_per_instance
                    .filter(|n| *n > 0)
                    .unwrap_or(DEFAULT_REQUESTS_PER_INSTANCE),
                scale_down_delay: scale_down_delay.unwrap_or(default_delay),
            },
            Some(Concurrency::Fixed { instances }) => Self::Fixed {
                instances: *instances,
            },
        }
    }

    /// Slots one lease takes. Auto leases batch 20% of a window.
    pub fn lease_size(&self) -> u32 {
        match self {
            Self::Auto {
                requests_per_instance,
                ..
            } => (requests_per_instance * 20 / 100).max(1),
            Self::Fixed { .. } => 1,
        }
    }

    /// Slots a fresh window offers.
    pub fn max_slots(&self) -> u32 {
        match self {
            Self::Auto {
                requests_per_instance,
                ..
            } => *requests_per_instance,
            Self::Fixed { .. } => 1,
        }
    }

    /// Whether a window with `used` slots can take another lease.
    pub fn has_capacity(&self, used: u32, max_slots: u32) -> bool {
        match self {
            Self::Auto { .. } => used + self.lease_size() <= max_slots,
            Self::Fixed { .. } => true,
        }
    }

    /// Idle time before retirement; `None` never retires.
    pub fn scale_down_delay(&self) -> Option<Duration> {
        match self {
            Self::Auto {
                scale_down_delay, ..
            } => Some(*scale_down_delay),
            Self::Fixed { .. } => None,
        }
    }

    /// Instances that should always run.
    pub fn desired_instances(&self) -> u32 {
        match self {
            Self::Auto { .. } => 0,
            Self::Fixed { instances } => *instances,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_entity::EntityId;

    fn version(concurrency: Option<Concurrency>) -> AppVersion {
        let mut v = AppVersion::new(EntityId::parse("app/web").unwrap(), "v1");
        v.concurrency = concurrency;
        v
    }

    #[test]
    fn unset_concurrency_is_one_request_per_window() {
        let s = Strategy::for_version(&version(None), DEFAULT_SCALE_DOWN_DELAY);
        assert_eq!(s.max_slots(), 1);
        assert_eq!(s.lease_size(), 1);
        assert!(s.has_capacity(0, 1));
        assert!(!s.has_capacity(1, 1));
        assert_eq!(s.desired_instances(), 0);
    }

    #[test]
    fn auto_without_value_uses_default_and_batches_leases() {
        let s = Strategy::for_version(
            &version(Some(Concurrency::Auto {
                requests_per_instance: None,
                scale_down_delay: None,
            })),
            DEFAULT_SCALE_DOWN_DELAY,
        );
        assert_eq!(s.max_slots(), 10);
        assert_eq!(s.lease_size(), 2);
        assert!(s.has_capacity(8, 10));
        assert!(!s.has_capacity(9, 10));
        assert_eq!(s.scale_down_delay(), Some(Duration::from_secs(120)));
    }

    #[test]
    fn auto_lease_size_is_twenty_percent() {
        let s = Strategy::Auto {
            requests_per_instance: 50,
            scale_down_delay: Duration::ZERO,
        };
        assert_eq!(s.lease_size(), 10);
        let small = Strategy::Auto {
            requests_per_instance: 3,
            scale_down_delay: Duration::ZERO,
        };
        assert_eq!(small.lease_size(), 1);
    }

    #[test]
    fn fixed_always_has_capacity_and_never_retires() {
        let s = Strategy::for_version(
            &version(Some(Concurrency::Fixed { instances: 3 })),
            DEFAULT_SCALE_DOWN_DELAY,
        );
        assert!(s.has_capacity(1_000, 1));
        assert_eq!(s.scale_down_delay(), None);
        assert_eq!(s.desired_instances(), 3);
    }
}
