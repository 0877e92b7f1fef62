//! Self reachability inferred from unsolicited traffic.
//!
//! Requests from peers we never contacted ("aliens") can only reach us if we
//! are publicly routable.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::common::NodeStatus;

/// Number of stats periods averaged over.
pub const STATS_WINDOW: usize = 10;

const ALIEN_AVERAGE_THRESHOLD: f64 = 3.0;

/// Average over the last `window` samples, missing samples count as zero.
#[derive(Debug)]
pub(crate) struct Average {
    samples: VecDeque<u64>,
    window: usize,
}

impl Average {
    pub fn new(window: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(window),
            window: window.max(1),
        }
    }

    pub fn add(&mut self, value: u64) {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    pub fn average(&self) -> f64 {
        self.samples.iter().sum::<u64>() as f64 / self.window as f64
    }
}

#[derive(Debug)]
pub(crate) struct Reachability {
    started: Instant,
    init_period: Duration,

    alien_average: Average,
    alien_fv_average: Average,
    last_alien_count: u64,
    last_alien_fv_count: u64,

    reachable: bool,
    accurate: bool,
}

impl Reachability {
    /// Starts out as `initial_reachable`, node status stays unknown until `init_period` passed.
    pub fn new(init_period: Duration, initial_reachable: bool) -> Self {
        Self {
            started: Instant::now(),
            init_period,
            alien_average: Average::new(STATS_WINDOW),
            alien_fv_average: Average::new(STATS_WINDOW),
            last_alien_count: 0,
            last_alien_fv_count: 0,
            reachable: initial_reachable,
            accurate: false,
        }
    }

    /// Feed the cumulative alien counters, once per `period`.
    ///
    /// Returns the new reachability if it changed.
    pub fn sample(
        &mut self,
        alien_count: u64,
        alien_fv_count: u64,
        period: Duration,
    ) -> Option<bool> {
        let period_secs = period.as_secs().max(1);

        self.alien_average
            .add(alien_count.saturating_sub(self.last_alien_count) * period_secs);
        self.alien_fv_average
            .add(alien_fv_count.saturating_sub(self.last_alien_fv_count) * period_secs);

        self.last_alien_count = alien_count;
        self.last_alien_fv_count = alien_fv_count;

        if self.started.elapsed() <= self.init_period {
            return None;
        }

        self.accurate = true;

        let old_reachable = self.reachable;
        self.reachable = self.alien_fv_average.average() > 0.0
            || self.alien_average.average() > ALIEN_AVERAGE_THRESHOLD;

        (old_reachable != self.reachable).then_some(self.reachable)
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable
    }

    /// Status advertised to others in find-node replies.
    pub fn node_status(&self, bootstrap_node: bool) -> NodeStatus {
        if bootstrap_node {
            NodeStatus::None
        } else if !self.accurate {
            NodeStatus::Unknown
        } else if self.reachable {
            NodeStatus::Routable
        } else {
            NodeStatus::None
        }
    }
}
