// BigQuery REST client: load jobs and streaming inserts.
//
// A load job is submitted with a deterministic job id (derived from the
// staged object key) so a retried submission lands in the job system's
// dedup window: a 409 on insert means the job already exists and we
// fall through to polling it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use gps2bq_config::WarehouseConfig;
use gps2bq_core::{InsertResult, LoadClient, LoadError, LoadRequest, LoadResult, StreamType};

use crate::token::TokenProvider;

const DEFAULT_ENDPOINT: &str = "https://bigquery.googleapis.com";
const QUOTA_RETRY_AFTER: Duration = Duration::from_secs(60);

pub struct BigQueryClient {
    http: reqwest::Client,
    endpoint: String,
    project: String,
    dataset: String,
    gps_table: String,
    mobile_table: String,
    poll_interval: Duration,
    poll_timeout: Duration,
    token_provider: Arc<dyn TokenProvider>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobResponse {
    #[serde(default)]
    status: Option<JobStatus>,
    #[serde(default)]
    statistics: Option<JobStatistics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    #[serde(default)]
    state: String,
    #[serde(default)]
    error_result: Option<JobError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobError {
    #[serde(default)]
    reason: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatistics {
    #[serde(default)]
    load: Option<LoadStatistics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadStatistics {
    #[serde(default)]
    output_rows: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InsertAllResponse {
    #[serde(default)]
    insert_errors: Vec<Value>,
}

impl BigQueryClient {
    pub fn new(config: &WarehouseConfig, token_provider: Arc<dyn TokenProvider>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: config
                .endpoint
                .clone()
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            project: config.project.clone(),
            dataset: config.dataset.clone(),
            gps_table: config.gps_table.clone(),
            mobile_table: config.mobile_table.clone(),
            poll_interval: config.poll_interval(),
            poll_timeout: config.poll_timeout(),
            token_provider,
        }
    }

    fn table(&self, stream: StreamType) -> &str {
        match stream {
            StreamType::Gps => &self.gps_table,
            StreamType::Mobile => &self.mobile_table,
        }
    }

    async fn authorized(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder, LoadError> {
        match self.token_provider.token().await? {
            Some(token) => Ok(builder.bearer_auth(token)),
            None => Ok(builder),
        }
    }

    async fn submit_job(&self, request: &LoadRequest) -> Result<(), LoadError> {
        let url = format!(
            "{}/bigquery/v2/projects/{}/jobs",
            self.endpoint, self.project
        );
        let body = json!({
            "jobReference": {
                "projectId": self.project,
                "jobId": request.job_id,
            },
            "configuration": {
                "load": {
                    "sourceUris": [request.source_uri],
                    "destinationTable": {
                        "projectId": self.project,
                        "datasetId": self.dataset,
                        "tableId": self.table(request.stream),
                    },
                    "sourceFormat": "NEWLINE_DELIMITED_JSON",
                    "writeDisposition": "WRITE_APPEND",
                    "ignoreUnknownValues": true,
                }
            }
        });

        let response = self
            .authorized(self.http.post(&url))
            .await?
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            status if status.is_success() => Ok(()),
            // The job id is the idempotency key: a conflict means this
            // exact load was already submitted. Poll it instead.
            StatusCode::CONFLICT => {
                debug!(job_id = %request.job_id, "load job already submitted");
                Ok(())
            }
            status => Err(classify_http(status, &read_error_body(response).await)),
        }
    }

    async fn poll_job(&self, job_id: &str) -> Result<usize, LoadError> {
        let url = format!(
            "{}/bigquery/v2/projects/{}/jobs/{}",
            self.endpoint, self.project, job_id
        );
        let deadline = Instant::now() + self.poll_timeout;

        loop {
            let response = self
                .authorized(self.http.get(&url))
                .await?
                .send()
                .await
                .map_err(transport_error)?;

            if !response.status().is_success() {
                let status = response.status();
                return Err(classify_http(status, &read_error_body(response).await));
            }

            let job: JobResponse = response
                .json()
                .await
                .map_err(|e| LoadError::TransientJob(format!("malformed job response: {}", e)))?;

            if let Some(status) = &job.status {
                if status.state == "DONE" {
                    if let Some(error) = &status.error_result {
                        return Err(classify_job_error(error));
                    }
                    let rows = job
                        .statistics
                        .and_then(|s| s.load)
                        .and_then(|l| l.output_rows)
                        .and_then(|r| r.parse::<usize>().ok())
                        .unwrap_or(0);
                    return Ok(rows);
                }
            }

            if Instant::now() + self.poll_interval > deadline {
                return Err(LoadError::TransientJob(format!(
                    "load job {} did not finish within {:?}",
                    job_id, self.poll_timeout
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[async_trait]
impl LoadClient for BigQueryClient {
    async fn load(&self, request: &LoadRequest) -> Result<LoadResult, LoadError> {
        self.submit_job(request).await?;
        let records_loaded = self.poll_job(&request.job_id).await?;

        info!(
            job_id = %request.job_id,
            stream = request.stream.as_str(),
            records_loaded,
            "load job completed"
        );
        Ok(LoadResult {
            job_id: request.job_id.clone(),
            records_loaded,
        })
    }

    async fn insert_rows(
        &self,
        stream: StreamType,
        rows: &[Value],
    ) -> Result<InsertResult, LoadError> {
        if rows.is_empty() {
            return Ok(InsertResult { rows_inserted: 0 });
        }

        let url = format!(
            "{}/bigquery/v2/projects/{}/datasets/{}/tables/{}/insertAll",
            self.endpoint,
            self.project,
            self.dataset,
            self.table(stream)
        );
        let body = json!({
            "rows": rows
                .iter()
                .map(|row| {
                    json!({
                        "insertId": row.get("recordId").cloned().unwrap_or(Value::Null),
                        "json": row,
                    })
                })
                .collect::<Vec<_>>(),
        });

        let response = self
            .authorized(self.http.post(&url))
            .await?
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(classify_http(status, &read_error_body(response).await));
        }

        let parsed: InsertAllResponse = response
            .json()
            .await
            .map_err(|e| LoadError::TransientJob(format!("malformed insert response: {}", e)))?;

        if !parsed.insert_errors.is_empty() {
            warn!(
                stream = stream.as_str(),
                errors = parsed.insert_errors.len(),
                "insertAll rejected rows"
            );
            return Err(LoadError::Schema(format!(
                "{} rows rejected by streaming insert",
                parsed.insert_errors.len()
            )));
        }

        Ok(InsertResult {
            rows_inserted: rows.len(),
        })
    }
}

fn transport_error(err: reqwest::Error) -> LoadError {
    LoadError::TransientJob(err.to_string())
}

async fn read_error_body(response: reqwest::Response) -> String {
    response.text().await.unwrap_or_default()
}

fn classify_http(status: StatusCode, body: &str) -> LoadError {
    let detail = format!("{}: {}", status, truncate(body, 200));
    if status == StatusCode::TOO_MANY_REQUESTS {
        return LoadError::Quota {
            message: detail,
            retry_after: QUOTA_RETRY_AFTER,
        };
    }
    if status.is_server_error() {
        return LoadError::TransientJob(detail);
    }
    LoadError::Schema(detail)
}

fn classify_job_error(error: &JobError) -> LoadError {
    let detail = format!("{}: {}", error.reason, error.message);
    match error.reason.as_str() {
        "rateLimitExceeded" | "quotaExceeded" => LoadError::Quota {
            message: detail,
            retry_after: QUOTA_RETRY_AFTER,
        },
        "backendError" | "internalError" | "jobBackendError" => LoadError::TransientJob(detail),
        _ => LoadError::Schema(detail),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_classification() {
        assert!(matches!(
            classify_http(StatusCode::TOO_MANY_REQUESTS, ""),
            LoadError::Quota { .. }
        ));
        assert!(matches!(
            classify_http(StatusCode::BAD_GATEWAY, ""),
            LoadError::TransientJob(_)
        ));
        assert!(matches!(
            classify_http(StatusCode::BAD_REQUEST, ""),
            LoadError::Schema(_)
        ));
    }

    #[test]
    fn test_job_error_classification() {
        let quota = JobError {
            reason: "quotaExceeded".into(),
            message: "too many load jobs".into(),
        };
        assert!(matches!(classify_job_error(&quota), LoadError::Quota { .. }));

        let backend = JobError {
            reason: "backendError".into(),
            message: "retry".into(),
        };
        assert!(matches!(
            classify_job_error(&backend),
            LoadError::TransientJob(_)
        ));

        let schema = JobError {
            reason: "invalid".into(),
            message: "field mismatch".into(),
        };
        assert!(matches!(classify_job_error(&schema), LoadError::Schema(_)));
    }

    #[test]
    fn test_job_response_parsing() {
        let raw = r#"{
            "status": {"state": "DONE"},
            "statistics": {"load": {"outputRows": "42"}}
        }"#;
        let job: JobResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(job.status.unwrap().state, "DONE");
        assert_eq!(
            job.statistics.unwrap().load.unwrap().output_rows.as_deref(),
            Some("42")
        );
    }
}
