use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::backoff::RetryPolicy;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const LIST_PAGE_SIZE: u32 = 100;

#[derive(Debug, Error)]
pub enum SensorThingsError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    RateLimit,
    Transient,
    Permanent,
}

impl SensorThingsError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            SensorThingsError::Api { status, .. } => Some(classify_api_status(*status)),
            SensorThingsError::Request(err) if err.is_timeout() || err.is_connect() => {
                Some(ApiErrorClass::Transient)
            }
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }

    /// A request the server understood and rejected. Retrying it as-is
    /// cannot succeed; the caller has to change the request instead.
    pub fn is_permanent_request(&self) -> bool {
        matches!(self.classification(), Some(ApiErrorClass::Permanent))
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ClientConfig {
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

/// Ordering of observation results along phenomenonTime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeOrder {
    #[default]
    Ascending,
    Descending,
}

impl TimeOrder {
    fn orderby_clause(self) -> &'static str {
        match self {
            TimeOrder::Ascending => "phenomenonTime asc",
            TimeOrder::Descending => "phenomenonTime desc",
        }
    }
}

/// Explicit paging parameters for one observations request. The client keeps
/// no cursor state; callers own `skip` advancement.
#[derive(Debug, Clone, Default)]
pub struct ObservationQuery {
    pub top: u32,
    pub skip: u64,
    pub order: TimeOrder,
    pub filter: Option<String>,
}

#[derive(Clone)]
pub struct SensorThingsClient {
    http: Client,
    base_url: Url,
    retry: RetryPolicy,
}

impl SensorThingsClient {
    pub fn new(base_url: &str) -> Result<Self, SensorThingsError> {
        Self::with_config(base_url, ClientConfig::default())
    }

    pub fn with_config(base_url: &str, config: ClientConfig) -> Result<Self, SensorThingsError> {
        let http = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            http,
            base_url: Url::parse(base_url)?,
            retry: config.retry,
        })
    }

    pub async fn list_things(&self) -> Result<Vec<Thing>, SensorThingsError> {
        self.list_collection("Things").await
    }

    pub async fn list_datastreams(&self, thing_id: i64) -> Result<Vec<Datastream>, SensorThingsError> {
        self.list_collection(&format!("Things({thing_id})/Datastreams"))
            .await
    }

    pub async fn get_datastream(&self, id: i64) -> Result<Datastream, SensorThingsError> {
        // Ask for the related entity ids inline; older server builds reject
        // $expand, in which case the plain entity still carries everything
        // except those ids.
        let mut url = self.endpoint(&format!("Datastreams({id})"))?;
        url.query_pairs_mut().append_pair(
            "$expand",
            "ObservedProperty($select=@iot.id),Sensor($select=@iot.id)",
        );
        match self.get_json(url).await {
            Ok(datastream) => Ok(datastream),
            Err(err) if err.is_permanent_request() => {
                let url = self.endpoint(&format!("Datastreams({id})"))?;
                self.get_json(url).await
            }
            Err(err) => Err(err),
        }
    }

    /// One page of observations for a datastream, exactly as requested. The
    /// server may return fewer rows than `$top`; that is surfaced as-is.
    pub async fn observations_page(
        &self,
        datastream_id: i64,
        query: &ObservationQuery,
    ) -> Result<Vec<Observation>, SensorThingsError> {
        let mut url = self.endpoint(&format!("Datastreams({datastream_id})/Observations"))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("$top", &query.top.to_string());
            pairs.append_pair("$skip", &query.skip.to_string());
            pairs.append_pair("$orderby", query.order.orderby_clause());
            if let Some(filter) = &query.filter {
                pairs.append_pair("$filter", filter);
            }
        }
        let page: ListResponse<Observation> = self.get_json(url).await?;
        page.value.ok_or_else(missing_value)
    }

    /// Zero-row count query. Returns -1 when the server leaves out
    /// `@iot.count` instead of treating that as an error.
    pub async fn observation_count(
        &self,
        datastream_id: i64,
        filter: Option<&str>,
    ) -> Result<i64, SensorThingsError> {
        let mut url = self.endpoint(&format!("Datastreams({datastream_id})/Observations"))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("$top", "0");
            pairs.append_pair("$count", "true");
            if let Some(filter) = filter {
                pairs.append_pair("$filter", filter);
            }
        }
        let page: ListResponse<Observation> = self.get_json(url).await?;
        Ok(page.count.unwrap_or(-1))
    }

    /// The newest or oldest observation of a datastream, if any.
    pub async fn boundary_observation(
        &self,
        datastream_id: i64,
        order: TimeOrder,
    ) -> Result<Option<Observation>, SensorThingsError> {
        let query = ObservationQuery {
            top: 1,
            skip: 0,
            order,
            filter: None,
        };
        let page = self.observations_page(datastream_id, &query).await?;
        Ok(page.into_iter().next())
    }

    /// Fetches a FeatureOfInterest through a navigation link, which the API
    /// delivers either absolute or relative to the base URL.
    pub async fn fetch_feature_of_interest(
        &self,
        link: &str,
    ) -> Result<FeatureOfInterest, SensorThingsError> {
        let url = self.base_url.join(link)?;
        self.get_json(url).await
    }

    async fn list_collection<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<Vec<T>, SensorThingsError> {
        let mut skip = 0u64;
        let mut items = Vec::new();
        loop {
            let mut url = self.endpoint(path)?;
            {
                let mut pairs = url.query_pairs_mut();
                pairs.append_pair("$top", &LIST_PAGE_SIZE.to_string());
                pairs.append_pair("$skip", &skip.to_string());
            }
            let page: ListResponse<T> = self.get_json(url).await?;
            let page = page.value.ok_or_else(missing_value)?;
            let returned = page.len();
            skip += returned as u64;
            items.extend(page);
            if returned < LIST_PAGE_SIZE as usize {
                break;
            }
        }
        Ok(items)
    }

    fn endpoint(&self, path: &str) -> Result<Url, SensorThingsError> {
        let mut url = self.base_url.clone();
        let prefix = self.base_url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{prefix}/{path}"));
        Ok(url)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: Url,
    ) -> Result<T, SensorThingsError> {
        let mut attempt = 0u32;
        loop {
            match self.try_get_json(url.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt + 1 < self.retry.max_attempts => {
                    tokio::time::sleep(self.retry.delay(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn try_get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: Url,
    ) -> Result<T, SensorThingsError> {
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SensorThingsError::Api { status, body });
        }
        let body = response.text().await?;
        serde_json::from_str(&body)
            .map_err(|err| SensorThingsError::MalformedResponse(err.to_string()))
    }
}

fn missing_value() -> SensorThingsError {
    SensorThingsError::MalformedResponse("response missing value array".to_string())
}

/// Collection envelope: a `value` array plus an optional `@iot.count`.
#[derive(Debug, Deserialize)]
pub struct ListResponse<T> {
    pub value: Option<Vec<T>>,
    #[serde(rename = "@iot.count")]
    pub count: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Thing {
    #[serde(rename = "@iot.id")]
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntityRef {
    #[serde(rename = "@iot.id")]
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnitOfMeasurement {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub definition: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Datastream {
    #[serde(rename = "@iot.id")]
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "unitOfMeasurement", default)]
    pub unit_of_measurement: Option<UnitOfMeasurement>,
    /// Declared span, possibly an open `start/end` interval string.
    #[serde(rename = "phenomenonTime", default)]
    pub phenomenon_time: Option<String>,
    #[serde(rename = "resultTime", default)]
    pub result_time: Option<String>,
    #[serde(rename = "ObservedProperty", default)]
    pub observed_property: Option<EntityRef>,
    #[serde(rename = "Sensor", default)]
    pub sensor: Option<EntityRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Observation {
    #[serde(rename = "@iot.id")]
    pub id: i64,
    /// Point or `start/end` interval, raw as delivered. Precision and zone
    /// markers are inconsistent across server builds; normalization is the
    /// caller's job.
    #[serde(rename = "phenomenonTime")]
    pub phenomenon_time: String,
    #[serde(rename = "resultTime", default)]
    pub result_time: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(rename = "resultQuality", default)]
    pub result_quality: Option<Value>,
    #[serde(default)]
    pub parameters: Option<Value>,
    #[serde(rename = "FeatureOfInterest", default)]
    pub feature_of_interest: Option<FeatureOfInterest>,
    #[serde(rename = "FeatureOfInterest@iot.navigationLink", default)]
    pub feature_link: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeatureOfInterest {
    #[serde(rename = "@iot.id")]
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "encodingType", default)]
    pub encoding_type: Option<String>,
    #[serde(default)]
    pub feature: Option<Value>,
}
