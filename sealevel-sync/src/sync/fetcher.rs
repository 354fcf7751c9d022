use sensorthings_core::{
    Observation, ObservationQuery, SensorThingsClient, SensorThingsError, TimeOrder,
};
use thiserror::Error;

use super::planner::SyncPlan;
use super::timestamp::{CanonicalTimestamp, TimestampError, phenomenon_interval};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("api error: {0}")]
    Api(#[from] SensorThingsError),
    #[error("timestamp error: {0}")]
    Timestamp(#[from] TimestampError),
}

/// One-shot, non-restartable walk over a datastream's observations under an
/// active sync plan. `$skip` advances by the number of records the server
/// actually returned, since short pages are common; an empty page, the
/// `max_records` cap, and (newest-first with a bound) the first record
/// strictly older than the bound each end the walk.
pub struct PageWalk<'a> {
    client: &'a SensorThingsClient,
    datastream_id: i64,
    plan: &'a SyncPlan,
    page_size: u32,
    skip: u64,
    yielded: u64,
    finished: bool,
    first_page: bool,
    short_first_page: bool,
}

impl<'a> PageWalk<'a> {
    pub fn new(
        client: &'a SensorThingsClient,
        datastream_id: i64,
        plan: &'a SyncPlan,
        page_size: u32,
    ) -> Self {
        Self {
            client,
            datastream_id,
            plan,
            page_size: page_size.max(1),
            skip: 0,
            yielded: 0,
            finished: false,
            first_page: true,
            short_first_page: false,
        }
    }

    /// True once the very first page came back shorter than requested — the
    /// signal that the server is silently capping page size and may not be
    /// honoring the filter either.
    pub fn short_first_page(&self) -> bool {
        self.short_first_page
    }

    /// The next chunk of in-bound records, or `None` when the walk is over.
    /// A returned chunk may be empty when every record of the underlying
    /// page fell outside the bound.
    pub async fn next_page(&mut self) -> Result<Option<Vec<Observation>>, FetchError> {
        if self.finished {
            return Ok(None);
        }

        let query = ObservationQuery {
            top: self.page_size,
            skip: self.skip,
            order: self.plan.order,
            filter: self.plan.filter.clone(),
        };
        let page = self
            .client
            .observations_page(self.datastream_id, &query)
            .await?;

        let returned = page.len() as u64;
        self.skip += returned;
        if self.first_page {
            self.first_page = false;
            if returned < u64::from(self.page_size) {
                self.short_first_page = true;
            }
        }
        if returned == 0 {
            self.finished = true;
            return Ok(None);
        }

        let mut kept = Vec::with_capacity(page.len());
        for obs in page {
            let (start, _) = phenomenon_interval(&obs.phenomenon_time);
            let at = CanonicalTimestamp::parse(start)?;
            if let Some(bound) = self.plan.lower_bound {
                if at < bound.at && self.plan.order == TimeOrder::Descending {
                    // Everything further down this order is older still.
                    self.finished = true;
                    break;
                }
                if !bound.admits(at) {
                    continue;
                }
            }
            kept.push(obs);
            self.yielded += 1;
            if self.plan.max_records.is_some_and(|max| self.yielded >= max) {
                self.finished = true;
                break;
            }
        }
        Ok(Some(kept))
    }
}
