//! One loader's claim against a shared byte budget.

use std::ops::{AddAssign, SubAssign};

/// Budget bookkeeping for a single loader, or the aggregate of many.
///
/// - `limit`: hard cap granted by the resource manager
/// - `used`: bytes already consumed (finished requests)
/// - `using`: bytes reserved by in-flight requests
/// - `estimated_limit`: what the loader would like its cap to be
/// - `unit_size`: grants are made in multiples of this (the part size)
///
/// `used + using <= limit` holds at all times.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceState {
    limit: i64,
    used: i64,
    using: i64,
    estimated_limit: i64,
    unit_size: i64,
}

impl Default for ResourceState {
    fn default() -> Self {
        Self {
            limit: 0,
            used: 0,
            using: 0,
            estimated_limit: 0,
            unit_size: 1,
        }
    }
}

impl ResourceState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves `x` bytes for an in-flight request.
    pub fn start_use(&mut self, x: i64) {
        assert!(x >= 0, "negative reservation {x}");
        self.using += x;
        assert!(
            self.used + self.using <= self.limit,
            "budget overrun: used {} + using {} > limit {}",
            self.used,
            self.using,
            self.limit
        );
    }

    /// Moves `x` bytes from in-flight to consumed.
    pub fn stop_use(&mut self, x: i64) {
        assert!(
            x >= 0 && x <= self.using,
            "releasing {x} bytes with only {} in use",
            self.using
        );
        self.using -= x;
        self.used += x;
    }

    /// Grows the hard cap by `extra`.
    pub fn update_limit(&mut self, extra: i64) {
        self.limit += extra;
    }

    /// Recomputes the wanted cap as consumed + in flight + `extra` still needed.
    ///
    /// In-flight bytes are assumed to cover part of `extra`. If the estimate
    /// falls below the granted cap the surplus is burned into `used`, which
    /// hands it back to the manager. Returns true if the estimate changed.
    pub fn update_estimated_limit(&mut self, extra: i64) -> bool {
        let using_and_extra_intersection = self.using.min(extra);
        let mut new_estimated_limit =
            self.used + self.using + extra - using_and_extra_intersection;

        if new_estimated_limit < self.limit {
            let extra_limit = self.limit - new_estimated_limit;
            self.used += extra_limit;
            new_estimated_limit += extra_limit;
        }

        if new_estimated_limit == self.estimated_limit {
            return false;
        }
        self.estimated_limit = new_estimated_limit;
        true
    }

    pub fn set_unit_size(&mut self, unit_size: i64) {
        assert!(unit_size > 0, "unit size must be positive");
        self.unit_size = unit_size;
    }

    pub fn unit_size(&self) -> i64 {
        self.unit_size
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    pub fn used(&self) -> i64 {
        self.used
    }

    pub fn using(&self) -> i64 {
        self.using
    }

    pub fn estimated_limit(&self) -> i64 {
        self.estimated_limit
    }

    /// Cap not yet consumed: `limit - used`.
    pub fn active_limit(&self) -> i64 {
        self.limit - self.used
    }

    /// Cap free for new requests: `limit - using - used`.
    pub fn unused(&self) -> i64 {
        self.limit - self.using - self.used
    }

    /// Additional cap wanted, rounded up to whole units.
    pub fn estimated_extra(&self) -> i64 {
        let unit = self.unit_size;
        let new_unused = self.limit.max(self.estimated_limit) - self.using - self.used;
        let new_unused = (new_unused + unit - 1).div_euclid(unit) * unit;
        new_unused + self.using + self.used - self.limit
    }

    /// Copies the loader-owned fields (demand and consumption).
    pub fn update_master(&mut self, other: &ResourceState) {
        self.estimated_limit = other.estimated_limit;
        self.used = other.used;
        self.using = other.using;
        self.unit_size = other.unit_size;
    }

    /// Copies the manager-owned field (the granted cap).
    pub fn update_slave(&mut self, other: &ResourceState) {
        self.limit = other.limit;
    }
}

/// Aggregation: a node's active limit counts as `using` in the aggregate.
impl AddAssign<&ResourceState> for ResourceState {
    fn add_assign(&mut self, other: &ResourceState) {
        self.using += other.active_limit();
        self.used += other.used;
    }
}

impl SubAssign<&ResourceState> for ResourceState {
    fn sub_assign(&mut self, other: &ResourceState) {
        self.using -= other.active_limit();
        self.used -= other.used;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_limit(limit: i64) -> ResourceState {
        let mut state = ResourceState::new();
        state.update_limit(limit);
        state
    }

    #[test]
    fn test_start_stop_use() {
        let mut state = with_limit(100);
        state.start_use(60);
        assert_eq!(state.unused(), 40);
        assert_eq!(state.active_limit(), 100);
        state.stop_use(60);
        assert_eq!(state.used(), 60);
        assert_eq!(state.using(), 0);
        assert_eq!(state.active_limit(), 40);
    }

    #[test]
    #[should_panic(expected = "budget overrun")]
    fn test_start_use_over_limit_panics() {
        let mut state = with_limit(10);
        state.start_use(11);
    }

    #[test]
    fn test_estimated_extra_from_scratch() {
        let mut state = ResourceState::new();
        assert!(state.update_estimated_limit(700));
        assert_eq!(state.estimated_extra(), 700);
        assert!(!state.update_estimated_limit(700));
    }

    #[test]
    fn test_estimated_extra_rounds_to_units() {
        let mut state = ResourceState::new();
        state.set_unit_size(64);
        state.update_estimated_limit(100);
        assert_eq!(state.estimated_extra(), 128);
    }

    #[test]
    fn test_estimate_below_limit_burns_surplus() {
        let mut state = with_limit(1000);
        state.start_use(200);
        state.update_estimated_limit(100);
        // 200 in flight already cover the remaining 100.
        assert_eq!(state.estimated_limit(), 1000);
        assert_eq!(state.used(), 800);
        assert_eq!(state.active_limit(), 200);
        assert_eq!(state.estimated_extra(), 0);
        assert!(state.used() + state.using() <= state.limit());
    }

    #[test]
    fn test_master_slave_split() {
        let mut worker = with_limit(50);
        worker.set_unit_size(10);
        worker.start_use(20);
        worker.update_estimated_limit(300);

        let mut manager_view = ResourceState::new();
        manager_view.update_master(&worker);
        assert_eq!(manager_view.limit(), 0);
        assert_eq!(manager_view.using(), 20);
        manager_view.update_limit(120);

        worker.update_slave(&manager_view);
        assert_eq!(worker.limit(), 120);
        assert_eq!(worker.using(), 20);
    }

    #[test]
    fn test_aggregate_add_sub() {
        let mut node = with_limit(100);
        node.start_use(30);
        node.stop_use(30);
        let mut total = ResourceState::new();
        total += &node;
        assert_eq!(total.using(), 70);
        assert_eq!(total.used(), 30);
        total -= &node;
        assert_eq!(total, ResourceState::new());
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn test_conservation(
                limit in 0i64..10_000,
                amounts in proptest::collection::vec(0i64..2_000, 0..50)
            ) {
                let mut state = with_limit(limit);
                let mut in_flight = Vec::new();
                let mut stopped = 0;
                for (i, amount) in amounts.into_iter().enumerate() {
                    if i % 3 == 2 {
                        if let Some(x) = in_flight.pop() {
                            state.stop_use(x);
                            stopped += x;
                        }
                    } else {
                        let x = amount.min(state.unused());
                        state.start_use(x);
                        in_flight.push(x);
                    }
                    prop_assert!(state.used() + state.using() <= state.limit());
                }
                for x in in_flight {
                    state.stop_use(x);
                    stopped += x;
                }
                prop_assert_eq!(state.used(), stopped);
                prop_assert_eq!(state.using(), 0);
            }
        }
    }
}
