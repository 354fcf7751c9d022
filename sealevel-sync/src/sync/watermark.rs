use crate::store::{SensorStore, StoreError};

use super::timestamp::CanonicalTimestamp;

/// Derives per-stream resume points from the persisted observations. `None`
/// means the stream has no rows yet; store failures propagate instead of
/// being folded into that state.
pub struct WatermarkTracker<'a> {
    store: &'a SensorStore,
}

impl<'a> WatermarkTracker<'a> {
    pub fn new(store: &'a SensorStore) -> Self {
        Self { store }
    }

    pub async fn latest(
        &self,
        datastream_id: i64,
    ) -> Result<Option<CanonicalTimestamp>, StoreError> {
        Ok(self
            .store
            .latest_observed(datastream_id)
            .await?
            .map(CanonicalTimestamp::from_unix))
    }

    pub async fn earliest(
        &self,
        datastream_id: i64,
    ) -> Result<Option<CanonicalTimestamp>, StoreError> {
        Ok(self
            .store
            .earliest_observed(datastream_id)
            .await?
            .map(CanonicalTimestamp::from_unix))
    }
}
