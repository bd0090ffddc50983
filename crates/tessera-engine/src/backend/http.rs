//! REST client for the ingest service
//!
//! Endpoints, relative to `{protocol}://{host}/{api_version}`:
//!
//! | Method | Path                    | Success |
//! |--------|-------------------------|---------|
//! | POST   | `/ingest/`              | 201 `{"id": ..}` |
//! | GET    | `/ingest/{id}`          | 200 job, credentials, bucket |
//! | DELETE | `/ingest/{id}`          | 204 |
//! | POST   | `/ingest/{id}/complete` | 204 or 200 |
//! | GET    | `/ingest/{id}/status`   | 200 counts |

use super::Backend;
use crate::config::{BackendConfig, JobConfig};
use crate::error::{IngestError, Result};
use crate::types::{
    AxisRange, ChunkSize, CollectionRef, Credentials, Extent, IngestJob, IngestType, JobId,
    JobSession, JobStatus, QueueHandles,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

/// Timeouts and polling for the REST client
#[derive(Debug, Clone, Copy)]
pub struct HttpBackendOptions {
    pub request_timeout: Duration,
    /// Pause between polls while a job is still being prepared
    pub join_poll: Duration,
    /// Give up on a job that stays in preparation this long
    pub join_wait: Duration,
}

impl Default for HttpBackendOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            join_poll: Duration::from_secs(5),
            join_wait: Duration::from_secs(600),
        }
    }
}

pub struct HttpBackend {
    client: Client,
    api_root: String,
    token: String,
    options: HttpBackendOptions,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig, api_token: &str, options: HttpBackendOptions) -> Result<Self> {
        if api_token.trim().is_empty() {
            return Err(IngestError::configuration("an API token is required to reach the backend"));
        }
        let client = Client::builder()
            .timeout(options.request_timeout)
            .build()
            .map_err(|e| IngestError::configuration(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_root: format!("{}/{}", config.base_url(), config.api_version.trim_matches('/')),
            token: api_token.trim().to_string(),
            options,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/ingest/{}", self.api_root, path)
    }

    fn auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("Authorization", format!("Token {}", self.token))
            .header("Accept", "application/json")
    }

    async fn fetch_job(&self, job_id: &JobId) -> Result<JobResponse> {
        let response = self
            .auth(self.client.get(self.url(&format!("{}", job_id))))
            .send()
            .await
            .map_err(transport_error)?;
        let response = expect_status(response, &[StatusCode::OK], job_id).await?;
        response
            .json::<JobResponse>()
            .await
            .map_err(|e| IngestError::backend(format!("unreadable job record: {e}")))
    }

    async fn fetch_status(&self, job_id: &JobId) -> Result<StatusResponse> {
        let response = self
            .auth(self.client.get(self.url(&format!("{}/status", job_id))))
            .send()
            .await
            .map_err(transport_error)?;
        let response = expect_status(response, &[StatusCode::OK], job_id).await?;
        response
            .json::<StatusResponse>()
            .await
            .map_err(|e| IngestError::backend(format!("unreadable job status: {e}")))
    }
}

#[async_trait]
impl Backend for HttpBackend {
    #[instrument(skip(self, config))]
    async fn create_job(&self, config: &JobConfig) -> Result<JobSession> {
        let payload = config.to_payload()?;
        let response = self
            .auth(self.client.post(self.url("")))
            .json(&payload)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status != StatusCode::CREATED {
            let detail = error_detail(response).await;
            return Err(match status {
                StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => IngestError::configuration(
                    format!("backend rejected the job configuration: {detail}"),
                ),
                _ => classify_status(status, detail, None),
            });
        }

        let created: CreatedResponse = response
            .json()
            .await
            .map_err(|e| IngestError::backend(format!("unreadable create response: {e}")))?;
        let job_id = created.id.into_job_id()?;
        info!(job_id = %job_id, "Ingest job created");
        self.join_job(&job_id).await
    }

    #[instrument(skip(self))]
    async fn join_job(&self, job_id: &JobId) -> Result<JobSession> {
        let deadline = Instant::now() + self.options.join_wait;
        loop {
            let record = self.fetch_job(job_id).await?;
            let status = record.ingest_job.status()?;

            let ready = status != JobStatus::Created
                && record.credentials.as_ref().is_some_and(|c| !c.is_empty());
            if ready || status.is_terminal() {
                return record.into_session(job_id);
            }

            if Instant::now() >= deadline {
                return Err(IngestError::backend(format!(
                    "job {job_id} still preparing after {:?}",
                    self.options.join_wait
                )));
            }
            debug!(job_id = %job_id, status = %status, "Waiting for ingest job to be ready");
            tokio::time::sleep(self.options.join_poll).await;
        }
    }

    #[instrument(skip(self))]
    async fn cancel_job(&self, job_id: &JobId) -> Result<()> {
        let response = self
            .auth(self.client.delete(self.url(&format!("{}", job_id))))
            .send()
            .await
            .map_err(transport_error)?;
        expect_status(response, &[StatusCode::NO_CONTENT, StatusCode::OK], job_id).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn complete_job(&self, job_id: &JobId) -> Result<()> {
        let response = self
            .auth(self.client.post(self.url(&format!("{}/complete", job_id))))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if matches!(status, StatusCode::BAD_REQUEST | StatusCode::CONFLICT) {
            return Err(IngestError::PrematureCompletion {
                job_id: job_id.clone(),
                reason: error_detail(response).await,
            });
        }
        expect_status(response, &[StatusCode::NO_CONTENT, StatusCode::OK], job_id).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_credentials(&self, job_id: &JobId) -> Result<Credentials> {
        let record = self.fetch_job(job_id).await?;
        match record.credentials {
            Some(creds) if !creds.is_empty() => Ok(creds.into()),
            _ => Err(IngestError::backend(format!("no credentials issued for job {job_id}"))),
        }
    }

    async fn get_uploaded_count(&self, job_id: &JobId) -> Result<u64> {
        Ok(self.fetch_status(job_id).await?.uploaded_count)
    }

    async fn get_expected_count(&self, job_id: &JobId) -> Result<u64> {
        Ok(self.fetch_status(job_id).await?.total_message_count)
    }
}

fn transport_error(err: reqwest::Error) -> IngestError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        IngestError::transient(format!("backend request failed: {err}"))
    } else {
        IngestError::backend(err.to_string())
    }
}

/// Pull `detail` or `message` out of an error body, falling back to the raw text
async fn error_detail(response: Response) -> String {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|v| {
            v.get("detail")
                .or_else(|| v.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| if text.is_empty() { status.to_string() } else { text })
}

fn classify_status(status: StatusCode, detail: String, job_id: Option<&JobId>) -> IngestError {
    match status {
        StatusCode::NOT_FOUND => match job_id {
            Some(id) => IngestError::JobNotFound(id.clone()),
            None => IngestError::backend(format!("404 Not Found: {detail}")),
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => IngestError::Unauthorized(detail),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            IngestError::backend(format!("{status}: {detail}"))
        },
        s if s.is_server_error() => IngestError::backend(format!("{status}: {detail}")),
        _ => IngestError::configuration(format!("unexpected backend response {status}: {detail}")),
    }
}

async fn expect_status(response: Response, ok: &[StatusCode], job_id: &JobId) -> Result<Response> {
    let status = response.status();
    if ok.contains(&status) {
        return Ok(response);
    }
    let detail = error_detail(response).await;
    Err(classify_status(status, detail, Some(job_id)))
}

// ============================================================================
// Wire types
// ============================================================================

/// Ids arrive as numbers from some deployments and strings from others
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireId {
    Number(u64),
    Text(String),
}

impl WireId {
    fn into_job_id(self) -> Result<JobId> {
        match self {
            WireId::Number(n) => Ok(JobId::from(n)),
            WireId::Text(s) if !s.is_empty() => Ok(JobId::from(s)),
            WireId::Text(_) => Err(IngestError::backend("backend returned an empty job id")),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreatedResponse {
    id: WireId,
}

#[derive(Debug, Deserialize)]
struct WireCredentials {
    #[serde(alias = "AccessKeyId", default)]
    access_key: String,
    #[serde(alias = "SecretAccessKey", default)]
    secret_key: String,
    #[serde(alias = "SessionToken", default)]
    session_token: Option<String>,
    #[serde(alias = "Expiration", default)]
    expiration: Option<DateTime<Utc>>,
}

impl WireCredentials {
    fn is_empty(&self) -> bool {
        self.access_key.is_empty() || self.secret_key.is_empty()
    }
}

impl From<WireCredentials> for Credentials {
    fn from(wire: WireCredentials) -> Self {
        Credentials {
            access_key: wire.access_key,
            secret_key: wire.secret_key,
            session_token: wire.session_token,
            expires_at: wire.expiration,
        }
    }
}

fn default_one() -> u64 {
    1
}

#[derive(Debug, Deserialize)]
struct WireJob {
    status: i64,
    #[serde(default)]
    upload_queue: Option<String>,
    #[serde(default)]
    ingest_queue: Option<String>,
    #[serde(default)]
    tile_index_queue: Option<String>,
    #[serde(default)]
    tile_count: u64,
    #[serde(default)]
    ingest_type: Option<Value>,
    #[serde(default)]
    resolution: u32,
    #[serde(default)]
    collection: String,
    #[serde(default)]
    experiment: String,
    #[serde(default)]
    channel: String,
    #[serde(default)]
    x_start: u64,
    #[serde(default)]
    x_stop: u64,
    #[serde(default)]
    y_start: u64,
    #[serde(default)]
    y_stop: u64,
    #[serde(default)]
    z_start: u64,
    #[serde(default)]
    z_stop: u64,
    #[serde(default)]
    t_start: u64,
    #[serde(default = "default_one")]
    t_stop: u64,
    #[serde(default = "default_one")]
    tile_size_x: u64,
    #[serde(default = "default_one")]
    tile_size_y: u64,
    #[serde(default = "default_one")]
    tile_size_z: u64,
    #[serde(default = "default_one")]
    tile_size_t: u64,
}

impl WireJob {
    fn status(&self) -> Result<JobStatus> {
        JobStatus::from_backend_code(self.status)
            .ok_or_else(|| IngestError::backend(format!("unknown job status code {}", self.status)))
    }

    fn ingest_type(&self) -> IngestType {
        match &self.ingest_type {
            Some(Value::Number(n)) if n.as_u64() == Some(1) => IngestType::Volumetric,
            Some(Value::String(s)) if s.eq_ignore_ascii_case("volumetric") => IngestType::Volumetric,
            _ => IngestType::Tile,
        }
    }
}

#[derive(Debug, Deserialize)]
struct JobResponse {
    ingest_job: WireJob,
    #[serde(default)]
    credentials: Option<WireCredentials>,
    #[serde(default)]
    tile_bucket_name: String,
    /// Deployment settings echoed back to storage in upload metadata
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl JobResponse {
    fn into_session(self, job_id: &JobId) -> Result<JobSession> {
        let job = &self.ingest_job;
        let status = job.status()?;
        let job_record = IngestJob {
            id: job_id.clone(),
            status,
            ingest_type: job.ingest_type(),
            resolution: job.resolution,
            extent: Extent {
                x: AxisRange::new(job.x_start, job.x_stop),
                y: AxisRange::new(job.y_start, job.y_stop),
                z: AxisRange::new(job.z_start, job.z_stop),
                t: AxisRange::new(job.t_start, job.t_stop),
            },
            unit_size: ChunkSize::new(
                job.tile_size_x,
                job.tile_size_y,
                job.tile_size_z,
                job.tile_size_t,
            ),
            target: CollectionRef {
                collection: job.collection.clone(),
                experiment: job.experiment.clone(),
                channel: job.channel.clone(),
            },
            expected_units: job.tile_count,
        };

        let mut parameters = self.extra;
        if let Some(queue) = &job.upload_queue {
            parameters.insert("upload_queue".into(), Value::String(queue.clone()));
        }
        if let Some(queue) = &job.ingest_queue {
            parameters.insert("ingest_queue".into(), Value::String(queue.clone()));
        }

        let queues = QueueHandles {
            upload: job.upload_queue.clone().unwrap_or_default(),
            ingest: job.ingest_queue.clone(),
            tile_index: job.tile_index_queue.clone(),
        };
        let credentials = self
            .credentials
            .map(Credentials::from)
            .unwrap_or_else(|| Credentials {
                access_key: String::new(),
                secret_key: String::new(),
                session_token: None,
                expires_at: None,
            });

        Ok(JobSession {
            job: job_record,
            queues,
            bucket: self.tile_bucket_name,
            credentials,
            parameters: Value::Object(parameters),
        })
    }
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    #[serde(alias = "tile_count")]
    total_message_count: u64,
    #[serde(alias = "uploaded_tile_count")]
    uploaded_count: u64,
}
