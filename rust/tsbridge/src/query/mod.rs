mod binder;
mod frame;
mod health;

pub use binder::{
    bind_arguments, BoundArguments, ARG_FROM, ARG_INTERVAL_MS, ARG_MAX_DATA_POINTS, ARG_TO,
};
pub use frame::{long_to_wide, Field, FieldType, Frame, LongEntry, LongTable, ShapeOptions};
pub use health::{probe, HealthResult, HealthStatus, PROBE_QUERY};

use crate::{
    config::AppConfig,
    datasource::SourceSettings,
    engine::Session,
    error::{ErrorBody, QueryError},
    instance::InstanceManager,
    models,
    value::Value,
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize, Serializer};
use std::{collections::BTreeMap, sync::Arc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// One query of a batch. Everything except `refId` is the opaque payload.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataQuery {
    pub ref_id: String,
    #[serde(flatten)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryDataRequest {
    pub datasource: SourceSettings,
    pub range: TimeRange,
    pub queries: Vec<DataQuery>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckHealthRequest {
    pub datasource: SourceSettings,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Format {
    #[default]
    #[serde(alias = "timeseries", alias = "time-series")]
    TimeSeries,
    Table,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawQueryModel {
    query_text: String,
    #[serde(default)]
    interval_ms: i64,
    #[serde(default)]
    max_data_points: i64,
    #[serde(default)]
    format: Option<Format>,
    #[serde(default)]
    args: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Decoded query payload.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryModel {
    pub query_text: String,
    pub interval_ms: i64,
    pub max_data_points: i64,
    pub format: Format,
    pub args: BTreeMap<String, Value>,
}

impl QueryModel {
    pub fn decode(payload: &serde_json::Map<String, serde_json::Value>) -> Result<Self, QueryError> {
        let raw: RawQueryModel = serde_json::from_value(serde_json::Value::Object(payload.clone()))
            .map_err(|err| QueryError::MalformedRequest(err.to_string()))?;

        let format = raw.format.unwrap_or_else(|| {
            debug!("format is empty, defaulting to time series");
            Format::TimeSeries
        });

        let args = raw
            .args
            .unwrap_or_default()
            .iter()
            .map(|(name, value)| {
                Value::from_json(value)
                    .map(|value| (name.clone(), value))
                    .map_err(|err| QueryError::MalformedRequest(format!("argument '{name}': {err}")))
            })
            .collect::<Result<_, _>>()?;

        Ok(Self {
            query_text: raw.query_text,
            interval_ms: raw.interval_ms.max(0),
            max_data_points: raw.max_data_points.max(0),
            format,
            args,
        })
    }
}

/// Result for a single query: frames, an error, or both when shaping fell
/// back to the long table.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DataResponse {
    pub frames: Vec<Frame>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_error"
    )]
    pub error: Option<QueryError>,
}

impl DataResponse {
    fn frame(frame: Frame) -> Self {
        Self {
            frames: vec![frame],
            error: None,
        }
    }

    fn failed(error: QueryError) -> Self {
        Self {
            frames: Vec::new(),
            error: Some(error),
        }
    }
}

fn serialize_error<S: Serializer>(error: &Option<QueryError>, serializer: S) -> Result<S::Ok, S::Error> {
    error.as_ref().map(ErrorBody::from).serialize(serializer)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryDataResponse {
    pub results: BTreeMap<String, DataResponse>,
}

#[derive(Clone)]
pub struct QueryEngine {
    instances: Arc<InstanceManager>,
    config: Arc<AppConfig>,
}

impl QueryEngine {
    pub fn new(instances: Arc<InstanceManager>, config: Arc<AppConfig>) -> Self {
        Self { instances, config }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Runs every query of the batch against the source's live session.
    ///
    /// Only a failure to obtain the session fails the batch; everything else
    /// is reported per `refId`.
    pub async fn query_data(
        &self,
        request: QueryDataRequest,
        cancel: CancellationToken,
    ) -> Result<QueryDataResponse, QueryError> {
        let span = info_span!(
            "query_batch",
            request_id = %Uuid::new_v4(),
            source = %request.datasource.uid,
            queries = request.queries.len()
        );

        async move {
            let generation = self.instances.get(&request.datasource).await?;
            let lease = generation.acquire().await?;
            let session = lease.session();

            let deadline = Instant::now() + self.config.request_timeout;
            let options = ShapeOptions {
                strict_duplicates: self.config.strict_duplicates,
            };
            let range = request.range;

            let responses: Vec<(String, DataResponse)> = futures::stream::iter(request.queries)
                .map(|query| {
                    let cancel = cancel.clone();
                    async move {
                        let response =
                            execute_query(session.as_ref(), &query, &range, options, &cancel, deadline)
                                .await;
                        (query.ref_id, response)
                    }
                })
                .buffer_unordered(self.config.max_concurrent_queries.max(1))
                .collect()
                .await;

            let mut results = BTreeMap::new();
            for (ref_id, response) in responses {
                if results.insert(ref_id.clone(), response).is_some() {
                    warn!(ref_id = %ref_id, "duplicate refId in batch, keeping the later result");
                }
            }

            Ok(QueryDataResponse { results })
        }
        .instrument(span)
        .await
    }

    /// Probes the source's session with a trivial query.
    pub async fn check_health(&self, settings: &SourceSettings) -> HealthResult {
        let checked = async {
            let generation = self.instances.get(settings).await?;
            let lease = generation.acquire().await?;
            Ok::<_, QueryError>(health::probe(lease.session().as_ref()).await)
        };

        match tokio::time::timeout(self.config.request_timeout, checked).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => HealthResult::error(err.to_string()),
            Err(_) => HealthResult::error(format!(
                "health check timed out after {:?}",
                self.config.request_timeout
            )),
        }
    }

    /// Disposes every source's session.
    pub async fn shutdown(&self) {
        self.instances.dispose_all().await;
    }
}

async fn execute_query(
    session: &dyn Session,
    query: &DataQuery,
    range: &TimeRange,
    options: ShapeOptions,
    cancel: &CancellationToken,
    deadline: Instant,
) -> DataResponse {
    let model = match QueryModel::decode(&query.payload) {
        Ok(model) => model,
        Err(err) => {
            warn!(ref_id = %query.ref_id, error = %err, "could not decode query");
            return DataResponse::failed(err);
        }
    };

    let args = bind_arguments(&model, range);

    let set = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            return DataResponse::failed(QueryError::Cancelled("batch was cancelled".into()));
        }
        _ = tokio::time::sleep_until(deadline) => {
            return DataResponse::failed(QueryError::Cancelled("request deadline exceeded".into()));
        }
        result = session.query(&model.query_text, &args) => match result {
            Ok(set) => set,
            Err(err) => {
                warn!(ref_id = %query.ref_id, error = %err, "query failed");
                return DataResponse::failed(QueryError::BackingEngine(err.message));
            }
        },
    };

    let rows = match models::decode_rows(set) {
        Ok(rows) => rows,
        Err(message) => {
            warn!(ref_id = %query.ref_id, error = %message, "could not decode result rows");
            return DataResponse::failed(QueryError::BackingEngine(message));
        }
    };

    shape(LongTable::from_rows(rows), model.format, options)
}

/// Turns the long table into the requested frame. A failed pivot degrades
/// to the long table with the error attached.
pub fn shape(long: LongTable, format: Format, options: ShapeOptions) -> DataResponse {
    match format {
        Format::Table => DataResponse::frame(long.to_frame()),
        Format::TimeSeries => match long_to_wide(&long, options) {
            Ok(wide) => DataResponse::frame(wide),
            Err(err) => {
                warn!(error = %err, "falling back to long table");
                DataResponse {
                    frames: vec![long.to_frame()],
                    error: Some(err),
                }
            }
        },
    }
}
