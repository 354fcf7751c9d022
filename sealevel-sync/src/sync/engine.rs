use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use sensorthings_core::{
    Datastream, FeatureOfInterest, Observation, SensorThingsClient, SensorThingsError, TimeOrder,
};
use thiserror::Error;

use crate::store::{DatastreamRow, FeatureRow, ObservationRow, SensorStore, StoreError};

use super::fetcher::{FetchError, PageWalk};
use super::planner::{FetchMode, SyncPlanner};
use super::timestamp::{CanonicalTimestamp, TimestampError, phenomenon_interval};
use super::watermark::WatermarkTracker;

const DEFAULT_PAGE_SIZE: u32 = 100;
const DEFAULT_BATCH_SIZE: usize = 1000;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Store failures are fatal to the whole run; the local database cannot
    /// be trusted afterwards.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("api error: {0}")]
    Api(#[from] SensorThingsError),
    #[error("timestamp error: {0}")]
    Timestamp(#[from] TimestampError),
    #[error("observation {0} carries no feature of interest")]
    MissingFeature(i64),
}

impl From<FetchError> for EngineError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Api(err) => EngineError::Api(err),
            FetchError::Timestamp(err) => EngineError::Timestamp(err),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// Inclusive historical start; overrides the persisted watermark.
    pub start_time: Option<CanonicalTimestamp>,
    pub max_records: Option<u64>,
}

/// What `check_stream` reports to the operator.
#[derive(Debug, Clone, Copy)]
pub struct StreamStatus {
    pub oldest_remote: Option<CanonicalTimestamp>,
    pub newest_remote: Option<CanonicalTimestamp>,
    pub oldest_local: Option<CanonicalTimestamp>,
    pub newest_local: Option<CanonicalTimestamp>,
    pub up_to_date: bool,
    /// Observations believed missing locally; -1 when the server will not say.
    pub new_count: i64,
}

#[derive(Debug)]
pub struct StreamOutcome {
    pub datastream_id: i64,
    pub result: Result<u64, EngineError>,
}

pub struct SyncEngine {
    client: SensorThingsClient,
    store: SensorStore,
    page_size: u32,
    batch_size: usize,
    stop: Arc<AtomicBool>,
}

impl SyncEngine {
    pub fn new(client: SensorThingsClient, store: SensorStore) -> Self {
        Self {
            client,
            store,
            page_size: DEFAULT_PAGE_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Shared flag for cooperative cancellation; checked between batches.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub async fn check_stream(&self, datastream_id: i64) -> Result<StreamStatus, EngineError> {
        let newest_remote = self.boundary(datastream_id, TimeOrder::Descending).await?;
        let oldest_remote = self.boundary(datastream_id, TimeOrder::Ascending).await?;

        let tracker = WatermarkTracker::new(&self.store);
        let newest_local = tracker.latest(datastream_id).await?;
        let oldest_local = tracker.earliest(datastream_id).await?;

        // Whole-second comparison: a remote stamp in the same second as the
        // watermark counts as already seen, even though a different id in
        // that second could still be missing. Known approximation.
        let up_to_date = match (newest_remote, newest_local) {
            (None, _) => true,
            (Some(remote), Some(local)) => remote <= local,
            (Some(_), None) => false,
        };

        let new_count = if up_to_date {
            0
        } else {
            self.pending_count(datastream_id, newest_local).await?
        };

        Ok(StreamStatus {
            oldest_remote,
            newest_remote,
            oldest_local,
            newest_local,
            up_to_date,
            new_count,
        })
    }

    /// Brings one stream up to date and returns the number of observation
    /// rows written. Re-running against unchanged upstream data writes zero.
    pub async fn sync_stream(
        &self,
        datastream_id: i64,
        options: &SyncOptions,
    ) -> Result<u64, EngineError> {
        let datastream = self.client.get_datastream(datastream_id).await?;
        self.store
            .upsert_datastream(&datastream_row(&datastream, None))
            .await?;

        let tracker = WatermarkTracker::new(&self.store);
        let watermark = tracker.latest(datastream_id).await?;

        if options.start_time.is_none() {
            if let Some(local) = watermark {
                match self.boundary(datastream_id, TimeOrder::Descending).await? {
                    None => return Ok(0),
                    Some(remote) if remote <= local => {
                        eprintln!(
                            "[sealevel-sync] stream {datastream_id}: up to date at {local}"
                        );
                        return Ok(0);
                    }
                    Some(_) => {}
                }
            }
        }

        let mut planner = SyncPlanner::resume_from(watermark, options.start_time, options.max_records);
        let mut written = 0u64;
        let mut seen_features: HashSet<i64> = HashSet::new();

        'plans: while let Some(plan) = planner.next_plan() {
            let mut walk = PageWalk::new(&self.client, datastream_id, &plan, self.page_size);
            let mut pending: Vec<Observation> = Vec::new();
            loop {
                if self.stop.load(Ordering::Relaxed) {
                    eprintln!(
                        "[sealevel-sync] stream {datastream_id}: stop requested, keeping committed batches"
                    );
                    planner.complete();
                    break 'plans;
                }
                match walk.next_page().await {
                    Ok(Some(page)) => {
                        if plan.mode == FetchMode::FilteredIncremental && walk.short_first_page() {
                            // The server is capping page size; assume the
                            // filter is equally unreliable. The probe page is
                            // discarded and the range re-walked unfiltered.
                            planner.fall_back();
                            continue 'plans;
                        }
                        pending.extend(page);
                        while pending.len() >= self.batch_size {
                            let batch: Vec<Observation> =
                                pending.drain(..self.batch_size).collect();
                            written += self
                                .flush(datastream_id, &batch, &mut seen_features, written)
                                .await?;
                        }
                    }
                    Ok(None) => {
                        if plan.mode == FetchMode::FilteredIncremental && walk.short_first_page() {
                            // An empty filtered page with a newer remote
                            // boundary already confirmed: the filter is not
                            // being honored. Treat it like a rejection.
                            planner.fall_back();
                            continue 'plans;
                        }
                        if !pending.is_empty() {
                            written += self
                                .flush(datastream_id, &pending, &mut seen_features, written)
                                .await?;
                        }
                        planner.complete();
                        break 'plans;
                    }
                    Err(FetchError::Api(err))
                        if plan.mode == FetchMode::FilteredIncremental
                            && err.is_permanent_request() =>
                    {
                        // This server build rejects the constructed filter.
                        planner.fall_back();
                        continue 'plans;
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }

        eprintln!("[sealevel-sync] stream {datastream_id}: wrote {written} new observations");
        Ok(written)
    }

    /// Discovers streams through Things and syncs each one. A failing stream
    /// is reported and skipped; sibling streams keep going. Store failures
    /// abort the run.
    pub async fn sync_all(&self, options: &SyncOptions) -> Result<Vec<StreamOutcome>, EngineError> {
        let things = self.client.list_things().await?;
        let mut outcomes = Vec::new();

        'things: for thing in &things {
            let datastreams = match self.client.list_datastreams(thing.id).await {
                Ok(list) => list,
                Err(err) => {
                    eprintln!(
                        "[sealevel-sync] thing {}: listing datastreams failed: {err}",
                        thing.id
                    );
                    continue;
                }
            };
            for datastream in datastreams {
                if self.stop.load(Ordering::Relaxed) {
                    break 'things;
                }
                self.store
                    .upsert_datastream(&datastream_row(&datastream, Some(thing.id)))
                    .await?;
                match self.sync_stream(datastream.id, options).await {
                    Ok(count) => outcomes.push(StreamOutcome {
                        datastream_id: datastream.id,
                        result: Ok(count),
                    }),
                    Err(err @ EngineError::Store(_)) => return Err(err),
                    Err(err) => {
                        eprintln!("[sealevel-sync] stream {} failed: {err}", datastream.id);
                        outcomes.push(StreamOutcome {
                            datastream_id: datastream.id,
                            result: Err(err),
                        });
                    }
                }
            }
        }

        Ok(outcomes)
    }

    async fn boundary(
        &self,
        datastream_id: i64,
        order: TimeOrder,
    ) -> Result<Option<CanonicalTimestamp>, EngineError> {
        match self.client.boundary_observation(datastream_id, order).await? {
            Some(obs) => {
                let (start, _) = phenomenon_interval(&obs.phenomenon_time);
                Ok(Some(CanonicalTimestamp::parse(start)?))
            }
            None => Ok(None),
        }
    }

    async fn pending_count(
        &self,
        datastream_id: i64,
        newest_local: Option<CanonicalTimestamp>,
    ) -> Result<i64, EngineError> {
        let Some(local) = newest_local else {
            return Ok(self.client.observation_count(datastream_id, None).await?);
        };
        let filter = format!("phenomenonTime gt {local}");
        match self
            .client
            .observation_count(datastream_id, Some(&filter))
            .await
        {
            Ok(count) => Ok(count),
            Err(err) if err.is_permanent_request() => {
                // Filter rejected; estimate from the totals instead.
                let remote = self.client.observation_count(datastream_id, None).await?;
                if remote < 0 {
                    return Ok(-1);
                }
                let local_rows = self.store.observation_count(datastream_id).await?;
                Ok((remote - local_rows).max(0))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn flush(
        &self,
        datastream_id: i64,
        batch: &[Observation],
        seen_features: &mut HashSet<i64>,
        written_so_far: u64,
    ) -> Result<u64, EngineError> {
        let mut features = Vec::new();
        let mut rows = Vec::with_capacity(batch.len());
        for obs in batch {
            let feature = self.resolve_feature(obs).await?;
            if seen_features.insert(feature.id) {
                features.push(feature_row(&feature));
            }
            rows.push(observation_row(datastream_id, obs, feature.id)?);
        }
        let written = self.store.write_batch(&features, &rows).await?;
        eprintln!(
            "[sealevel-sync] stream {datastream_id}: committed {} records ({} new, {} total new)",
            rows.len(),
            written,
            written_so_far + written
        );
        Ok(written)
    }

    async fn resolve_feature(&self, obs: &Observation) -> Result<FeatureOfInterest, EngineError> {
        if let Some(feature) = &obs.feature_of_interest {
            return Ok(feature.clone());
        }
        let link = obs
            .feature_link
            .as_deref()
            .ok_or(EngineError::MissingFeature(obs.id))?;
        Ok(self.client.fetch_feature_of_interest(link).await?)
    }
}

fn datastream_row(datastream: &Datastream, thing_id: Option<i64>) -> DatastreamRow {
    let (span_start, span_end) = match datastream.phenomenon_time.as_deref() {
        Some(raw) => {
            let (start, end) = phenomenon_interval(raw);
            (Some(start.to_string()), end.map(str::to_string))
        }
        None => (None, None),
    };
    DatastreamRow {
        id: datastream.id,
        name: datastream.name.clone(),
        thing_id,
        observed_property_id: datastream.observed_property.as_ref().map(|e| e.id),
        sensor_id: datastream.sensor.as_ref().map(|e| e.id),
        unit_name: datastream
            .unit_of_measurement
            .as_ref()
            .and_then(|unit| unit.name.clone()),
        unit_symbol: datastream
            .unit_of_measurement
            .as_ref()
            .and_then(|unit| unit.symbol.clone()),
        phenomenon_time_start: span_start,
        phenomenon_time_end: span_end,
    }
}

fn feature_row(feature: &FeatureOfInterest) -> FeatureRow {
    FeatureRow {
        id: feature.id,
        name: feature.name.clone(),
        description: feature.description.clone(),
        encoding_type: feature.encoding_type.clone(),
        feature: feature.feature.as_ref().map(|value| value.to_string()),
    }
}

fn observation_row(
    datastream_id: i64,
    obs: &Observation,
    feature_id: i64,
) -> Result<ObservationRow, TimestampError> {
    let (start, end) = phenomenon_interval(&obs.phenomenon_time);
    let at = CanonicalTimestamp::parse(start)?;
    Ok(ObservationRow {
        id: obs.id,
        datastream_id,
        phenomenon_time: start.to_string(),
        phenomenon_time_end: end.map(str::to_string),
        phenomenon_unix: at.unix(),
        result_time: obs.result_time.clone(),
        result: obs.result.as_ref().map(|value| value.to_string()),
        result_quality: obs.result_quality.as_ref().map(|value| value.to_string()),
        parameters: obs.parameters.as_ref().map(|value| value.to_string()),
        feature_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const T0: &str = "2023-12-31T00:00:00Z";
    const T1: &str = "2024-01-01T00:00:00Z";
    const T2: &str = "2024-01-01T01:00:00Z";
    const T3: &str = "2024-01-01T02:00:00Z";

    async fn make_engine(server: &MockServer) -> SyncEngine {
        let client = SensorThingsClient::new(&server.uri()).unwrap();
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SensorStore::from_pool(pool);
        store.init().await.unwrap();
        SyncEngine::new(client, store)
            .with_page_size(2)
            .with_batch_size(2)
    }

    fn obs(id: i64, at: &str) -> serde_json::Value {
        json!({
            "@iot.id": id,
            "phenomenonTime": at,
            "result": 1.0 + (id as f64) / 100.0,
            "FeatureOfInterest": { "@iot.id": 17, "name": "Pier 4" }
        })
    }

    fn page(entries: Vec<serde_json::Value>) -> serde_json::Value {
        json!({ "value": entries })
    }

    async fn mount_datastream(server: &MockServer, id: i64) {
        Mock::given(method("GET"))
            .and(path(format!("/Datastreams({id})")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "@iot.id": id,
                "name": "Water Level",
                "unitOfMeasurement": { "name": "meter", "symbol": "m" }
            })))
            .mount(server)
            .await;
    }

    async fn mount_page(
        server: &MockServer,
        stream: i64,
        order: &str,
        skip: &str,
        entries: Vec<serde_json::Value>,
    ) {
        Mock::given(method("GET"))
            .and(path(format!("/Datastreams({stream})/Observations")))
            .and(query_param("$top", "2"))
            .and(query_param("$skip", skip))
            .and(query_param("$orderby", format!("phenomenonTime {order}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(entries)))
            .mount(server)
            .await;
    }

    async fn mount_newest(server: &MockServer, stream: i64, entries: Vec<serde_json::Value>) {
        Mock::given(method("GET"))
            .and(path(format!("/Datastreams({stream})/Observations")))
            .and(query_param("$top", "1"))
            .and(query_param("$orderby", "phenomenonTime desc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(entries)))
            .mount(server)
            .await;
    }

    async fn seed_observation(engine: &SyncEngine, id: i64, at: &str) {
        let ts = CanonicalTimestamp::parse(at).unwrap();
        engine
            .store
            .upsert_datastream(&DatastreamRow {
                id: 42,
                name: "Water Level".into(),
                thing_id: None,
                observed_property_id: None,
                sensor_id: None,
                unit_name: None,
                unit_symbol: None,
                phenomenon_time_start: None,
                phenomenon_time_end: None,
            })
            .await
            .unwrap();
        engine
            .store
            .write_batch(
                &[FeatureRow {
                    id: 17,
                    name: None,
                    description: None,
                    encoding_type: None,
                    feature: None,
                }],
                &[ObservationRow {
                    id,
                    datastream_id: 42,
                    phenomenon_time: at.into(),
                    phenomenon_time_end: None,
                    phenomenon_unix: ts.unix(),
                    result_time: None,
                    result: None,
                    result_quality: None,
                    parameters: None,
                    feature_id: 17,
                }],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn full_backfill_walks_everything_ascending() {
        let server = MockServer::start().await;
        mount_datastream(&server, 42).await;
        mount_page(&server, 42, "asc", "0", vec![obs(1, T1), obs(2, T2)]).await;
        mount_page(&server, 42, "asc", "2", vec![obs(3, T3)]).await;
        mount_page(&server, 42, "asc", "3", vec![]).await;

        let engine = make_engine(&server).await;
        let written = engine
            .sync_stream(42, &SyncOptions::default())
            .await
            .unwrap();

        assert_eq!(written, 3);
        assert_eq!(engine.store.observation_count(42).await.unwrap(), 3);
        assert_eq!(
            engine.store.latest_observed(42).await.unwrap(),
            Some(CanonicalTimestamp::parse(T3).unwrap().unix())
        );
        let row = engine.store.get_datastream(42).await.unwrap().unwrap();
        assert_eq!(row.unit_symbol.as_deref(), Some("m"));
    }

    #[tokio::test]
    async fn second_run_with_no_new_data_writes_nothing() {
        let server = MockServer::start().await;
        mount_datastream(&server, 42).await;
        mount_page(&server, 42, "asc", "0", vec![obs(1, T1), obs(2, T2)]).await;
        mount_page(&server, 42, "asc", "2", vec![]).await;
        mount_newest(&server, 42, vec![obs(2, T2)]).await;

        let engine = make_engine(&server).await;
        assert_eq!(
            engine
                .sync_stream(42, &SyncOptions::default())
                .await
                .unwrap(),
            2
        );
        assert_eq!(
            engine
                .sync_stream(42, &SyncOptions::default())
                .await
                .unwrap(),
            0
        );
        assert_eq!(engine.store.observation_count(42).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn subsecond_difference_counts_as_up_to_date() {
        let server = MockServer::start().await;
        let engine = make_engine(&server).await;
        seed_observation(&engine, 1, T1).await;

        mount_newest(
            &server,
            42,
            vec![obs(9, "2024-01-01T00:00:00.500000")],
        )
        .await;
        Mock::given(method("GET"))
            .and(path("/Datastreams(42)/Observations"))
            .and(query_param("$top", "1"))
            .and(query_param("$orderby", "phenomenonTime asc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(vec![obs(1, T1)])))
            .mount(&server)
            .await;

        let status = engine.check_stream(42).await.unwrap();
        assert!(status.up_to_date);
        assert_eq!(status.new_count, 0);
        assert_eq!(status.newest_remote, status.newest_local);
    }

    #[tokio::test]
    async fn rejected_filter_falls_back_to_full_paging() {
        let server = MockServer::start().await;
        let engine = make_engine(&server).await;
        seed_observation(&engine, 1, T1).await;

        mount_datastream(&server, 42).await;
        mount_newest(&server, 42, vec![obs(3, T3)]).await;
        Mock::given(method("GET"))
            .and(path("/Datastreams(42)/Observations"))
            .and(query_param("$filter", format!("phenomenonTime gt {T1}")))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad $filter"))
            .expect(1)
            .mount(&server)
            .await;
        mount_page(&server, 42, "desc", "0", vec![obs(3, T3), obs(2, T2)]).await;
        mount_page(&server, 42, "desc", "2", vec![obs(1, T1)]).await;
        mount_page(&server, 42, "desc", "3", vec![]).await;

        let written = engine
            .sync_stream(42, &SyncOptions::default())
            .await
            .unwrap();

        assert_eq!(written, 2);
        assert_eq!(engine.store.observation_count(42).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn short_probe_page_triggers_fallback() {
        let server = MockServer::start().await;
        let engine = make_engine(&server).await;
        seed_observation(&engine, 1, T1).await;

        mount_datastream(&server, 42).await;
        mount_newest(&server, 42, vec![obs(3, T3)]).await;
        // Filtered probe answers 200 but caps the page at one record.
        Mock::given(method("GET"))
            .and(path("/Datastreams(42)/Observations"))
            .and(query_param("$filter", format!("phenomenonTime gt {T1}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(vec![obs(3, T3)])))
            .expect(1)
            .mount(&server)
            .await;
        mount_page(&server, 42, "desc", "0", vec![obs(3, T3), obs(2, T2)]).await;
        mount_page(&server, 42, "desc", "2", vec![obs(1, T1)]).await;
        mount_page(&server, 42, "desc", "3", vec![]).await;

        let written = engine
            .sync_stream(42, &SyncOptions::default())
            .await
            .unwrap();

        assert_eq!(written, 2);
        assert_eq!(engine.store.observation_count(42).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn empty_filtered_page_triggers_fallback() {
        let server = MockServer::start().await;
        let engine = make_engine(&server).await;
        seed_observation(&engine, 1, T1).await;

        mount_datastream(&server, 42).await;
        mount_newest(&server, 42, vec![obs(3, T3)]).await;
        // The filter matches nothing even though the boundary probe just
        // saw newer data.
        Mock::given(method("GET"))
            .and(path("/Datastreams(42)/Observations"))
            .and(query_param("$filter", format!("phenomenonTime gt {T1}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(vec![])))
            .expect(1)
            .mount(&server)
            .await;
        mount_page(&server, 42, "desc", "0", vec![obs(3, T3), obs(2, T2)]).await;
        mount_page(&server, 42, "desc", "2", vec![obs(1, T1)]).await;
        mount_page(&server, 42, "desc", "3", vec![]).await;

        let written = engine
            .sync_stream(42, &SyncOptions::default())
            .await
            .unwrap();

        assert_eq!(written, 2);
        assert_eq!(engine.store.observation_count(42).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn max_records_limits_rows_written() {
        let server = MockServer::start().await;
        mount_datastream(&server, 42).await;
        mount_page(&server, 42, "asc", "0", vec![obs(1, T0), obs(2, T1)]).await;
        mount_page(&server, 42, "asc", "2", vec![obs(3, T2), obs(4, T3)]).await;
        Mock::given(method("GET"))
            .and(path("/Datastreams(42)/Observations"))
            .and(query_param("$skip", "4"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(vec![])))
            .expect(0)
            .mount(&server)
            .await;

        let engine = make_engine(&server).await;
        let options = SyncOptions {
            start_time: None,
            max_records: Some(3),
        };
        assert_eq!(engine.sync_stream(42, &options).await.unwrap(), 3);
        assert_eq!(engine.store.observation_count(42).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn descending_fallback_stops_at_the_lower_bound() {
        let server = MockServer::start().await;
        mount_datastream(&server, 42).await;
        Mock::given(method("GET"))
            .and(path("/Datastreams(42)/Observations"))
            .and(query_param("$filter", format!("phenomenonTime ge {T1}")))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&server)
            .await;
        mount_page(&server, 42, "desc", "0", vec![obs(5, T3), obs(4, T2)]).await;
        mount_page(&server, 42, "desc", "2", vec![obs(3, T1), obs(2, T0)]).await;
        Mock::given(method("GET"))
            .and(path("/Datastreams(42)/Observations"))
            .and(query_param("$skip", "4"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(vec![])))
            .expect(0)
            .mount(&server)
            .await;

        let engine = make_engine(&server).await;
        let options = SyncOptions {
            start_time: Some(CanonicalTimestamp::parse(T1).unwrap()),
            max_records: None,
        };
        assert_eq!(engine.sync_stream(42, &options).await.unwrap(), 3);
        // The record below the bound was never written.
        assert_eq!(
            engine.store.earliest_observed(42).await.unwrap(),
            Some(CanonicalTimestamp::parse(T1).unwrap().unix())
        );
    }

    #[tokio::test]
    async fn feature_links_are_followed_when_nothing_is_inline() {
        let server = MockServer::start().await;
        mount_datastream(&server, 42).await;
        mount_page(
            &server,
            42,
            "asc",
            "0",
            vec![json!({
                "@iot.id": 1,
                "phenomenonTime": T1,
                "result": 1.5,
                "FeatureOfInterest@iot.navigationLink": "/Observations(1)/FeatureOfInterest"
            })],
        )
        .await;
        mount_page(&server, 42, "asc", "1", vec![]).await;
        Mock::given(method("GET"))
            .and(path("/Observations(1)/FeatureOfInterest"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "@iot.id": 17,
                "name": "Pier 4"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let engine = make_engine(&server).await;
        assert_eq!(
            engine
                .sync_stream(42, &SyncOptions::default())
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn pending_count_uses_the_server_side_filter() {
        let server = MockServer::start().await;
        let engine = make_engine(&server).await;
        seed_observation(&engine, 1, T1).await;

        mount_newest(&server, 42, vec![obs(9, T3)]).await;
        Mock::given(method("GET"))
            .and(path("/Datastreams(42)/Observations"))
            .and(query_param("$top", "1"))
            .and(query_param("$orderby", "phenomenonTime asc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page(vec![obs(1, T0)])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/Datastreams(42)/Observations"))
            .and(query_param("$top", "0"))
            .and(query_param("$count", "true"))
            .and(query_param("$filter", format!("phenomenonTime gt {T1}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "@iot.count": 7,
                "value": []
            })))
            .mount(&server)
            .await;

        let status = engine.check_stream(42).await.unwrap();
        assert!(!status.up_to_date);
        assert_eq!(status.new_count, 7);
    }

    #[tokio::test]
    async fn sync_all_keeps_going_past_a_failing_stream() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/Things"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [{ "@iot.id": 3, "name": "Fort Pulaski Gauge" }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/Things(3)/Datastreams"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [
                    { "@iot.id": 7, "name": "Broken" },
                    { "@iot.id": 8, "name": "Water Level" }
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/Datastreams(7)"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        mount_datastream(&server, 8).await;
        mount_page(&server, 8, "asc", "0", vec![obs(21, T1)]).await;
        mount_page(&server, 8, "asc", "1", vec![]).await;

        let engine = make_engine(&server).await;
        let outcomes = engine.sync_all(&SyncOptions::default()).await.unwrap();

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].datastream_id, 7);
        assert!(outcomes[0].result.is_err());
        assert_eq!(outcomes[1].datastream_id, 8);
        assert_eq!(*outcomes[1].result.as_ref().unwrap(), 1);
        assert_eq!(engine.store.observation_count(8).await.unwrap(), 1);
    }
}
