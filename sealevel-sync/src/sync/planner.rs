use sensorthings_core::TimeOrder;

use super::timestamp::CanonicalTimestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    FilteredIncremental,
    FullFallback,
}

/// Oldest phenomenon time a sync run is interested in. Explicit start times
/// are inclusive; watermark resumes are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LowerBound {
    pub at: CanonicalTimestamp,
    pub inclusive: bool,
}

impl LowerBound {
    pub fn admits(&self, ts: CanonicalTimestamp) -> bool {
        if self.inclusive {
            ts >= self.at
        } else {
            ts > self.at
        }
    }

    pub fn filter_clause(&self) -> String {
        let op = if self.inclusive { "ge" } else { "gt" };
        format!("phenomenonTime {op} {}", self.at)
    }
}

#[derive(Debug, Clone)]
pub struct SyncPlan {
    pub mode: FetchMode,
    pub order: TimeOrder,
    pub lower_bound: Option<LowerBound>,
    pub max_records: Option<u64>,
    pub filter: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlannerState {
    Uninitialized,
    FilteredProbe,
    FullFallback,
    Complete,
}

/// Per-stream fetch strategy machine. A bounded run is first attempted as a
/// server-side filtered query; `fall_back` switches to client-side paging
/// when the probe shows the server rejecting or quietly mishandling the
/// filter. Each strategy plan is handed out exactly once.
#[derive(Debug)]
pub struct SyncPlanner {
    state: PlannerState,
    lower_bound: Option<LowerBound>,
    max_records: Option<u64>,
    fallback_pending: bool,
}

impl SyncPlanner {
    pub fn resume_from(
        watermark: Option<CanonicalTimestamp>,
        start: Option<CanonicalTimestamp>,
        max_records: Option<u64>,
    ) -> Self {
        let lower_bound = match (start, watermark) {
            (Some(at), _) => Some(LowerBound {
                at,
                inclusive: true,
            }),
            (None, Some(at)) => Some(LowerBound {
                at,
                inclusive: false,
            }),
            (None, None) => None,
        };
        Self {
            state: PlannerState::Uninitialized,
            lower_bound,
            max_records,
            fallback_pending: false,
        }
    }

    pub fn state(&self) -> PlannerState {
        self.state
    }

    pub fn next_plan(&mut self) -> Option<SyncPlan> {
        match self.state {
            PlannerState::Uninitialized => match self.lower_bound {
                Some(bound) => {
                    self.state = PlannerState::FilteredProbe;
                    Some(SyncPlan {
                        mode: FetchMode::FilteredIncremental,
                        order: TimeOrder::Ascending,
                        lower_bound: Some(bound),
                        max_records: self.max_records,
                        filter: Some(bound.filter_clause()),
                    })
                }
                None => {
                    // Full backfill: the whole collection, oldest first.
                    self.state = PlannerState::FullFallback;
                    Some(SyncPlan {
                        mode: FetchMode::FullFallback,
                        order: TimeOrder::Ascending,
                        lower_bound: None,
                        max_records: self.max_records,
                        filter: None,
                    })
                }
            },
            PlannerState::FullFallback if self.fallback_pending => {
                self.fallback_pending = false;
                // With a known bound, walk newest-first so the bound doubles
                // as an early exit instead of a full-collection scan.
                Some(SyncPlan {
                    mode: FetchMode::FullFallback,
                    order: TimeOrder::Descending,
                    lower_bound: self.lower_bound,
                    max_records: self.max_records,
                    filter: None,
                })
            }
            _ => None,
        }
    }

    pub fn fall_back(&mut self) {
        if self.state == PlannerState::FilteredProbe {
            self.state = PlannerState::FullFallback;
            self.fallback_pending = true;
        }
    }

    pub fn complete(&mut self) {
        self.state = PlannerState::Complete;
    }
}
