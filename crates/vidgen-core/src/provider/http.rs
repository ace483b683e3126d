//! JSON-over-HTTPS provider client, one endpoint per provider group.
//!
//! * `POST {base_url}/videos/generations` → `{id | task_id, request_id}`
//! * `GET  {base_url}/async-result/{task_id}` →
//!   `{task_status, progress?, video_result?: [{url, cover_image_url}], error?}`

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, info};

use super::{CreatedTask, ProviderClient, ProviderError, ProviderStatus};
use crate::config::{GenerationConfig, ModelSpec};
use crate::runtime::types::codes;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct Endpoint {
    base_url: String,
    api_key: Option<String>,
}

/// [`ProviderClient`] over the provider's REST API.
#[derive(Debug, Clone)]
pub struct HttpProviderClient {
    client: Client,
    endpoints: HashMap<String, Endpoint>,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    #[serde(alias = "task_id")]
    id: Option<String>,
    request_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    code: Option<serde_json::Value>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct VideoResult {
    url: Option<String>,
    cover_image_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    task_status: String,
    #[serde(default)]
    progress: Option<f64>,
    #[serde(default)]
    video_result: Vec<VideoResult>,
    #[serde(default)]
    error: Option<ErrorDetail>,
}

impl StatusResponse {
    /// Validate the loose wire shape into a closed [`ProviderStatus`].
    fn into_status(self) -> Result<ProviderStatus, ProviderError> {
        match self.task_status.to_ascii_uppercase().as_str() {
            "PROCESSING" | "QUEUED" | "RUNNING" => Ok(ProviderStatus::Processing {
                progress: self.progress.map(clamp_progress).unwrap_or(0),
            }),
            "SUCCESS" | "FINISH" => {
                let first = self.video_result.into_iter().next();
                let media_url = first
                    .as_ref()
                    .and_then(|v| v.url.clone())
                    .filter(|u| !u.is_empty())
                    .ok_or_else(|| {
                        ProviderError::InvalidResponse("finished task without media url".into())
                    })?;
                Ok(ProviderStatus::Finish {
                    media_url,
                    cover_url: first.and_then(|v| v.cover_image_url).filter(|u| !u.is_empty()),
                })
            }
            "FAIL" | "FAILED" => {
                let detail = self.error.unwrap_or_default();
                Ok(ProviderStatus::Fail {
                    code: detail
                        .code
                        .as_ref()
                        .map(code_to_string)
                        .unwrap_or_else(|| codes::PROVIDER_ERROR.to_owned()),
                    message: detail
                        .message
                        .unwrap_or_else(|| "provider reported failure".to_owned()),
                })
            }
            other => Err(ProviderError::InvalidResponse(format!(
                "unknown task_status '{other}'"
            ))),
        }
    }
}

fn clamp_progress(p: f64) -> u8 {
    p.round().clamp(0.0, 100.0) as u8
}

fn code_to_string(code: &serde_json::Value) -> String {
    match code {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl HttpProviderClient {
    /// Build a client with one endpoint per configured group.
    pub fn new(config: &GenerationConfig) -> Self {
        let client = Client::builder()
            .user_agent(concat!("vidgen/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();

        let endpoints = config
            .groups
            .iter()
            .map(|(name, group)| {
                (
                    name.clone(),
                    Endpoint {
                        base_url: group.endpoint.base_url.trim_end_matches('/').to_owned(),
                        api_key: group.endpoint.resolve_api_key(),
                    },
                )
            })
            .collect();

        Self { client, endpoints }
    }

    fn endpoint(&self, model: &ModelSpec) -> Result<&Endpoint, ProviderError> {
        self.endpoints
            .get(&model.group)
            .ok_or_else(|| ProviderError::Rejected {
                code: codes::UNKNOWN_GROUP.to_owned(),
                message: format!("no endpoint configured for group '{}'", model.group),
            })
    }

    fn authorized(&self, builder: reqwest::RequestBuilder, endpoint: &Endpoint) -> reqwest::RequestBuilder {
        match &endpoint.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

/// Map a non-2xx response onto the error taxonomy.
async fn error_from_response(resp: Response) -> ProviderError {
    let status = resp.status();
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return ProviderError::Unavailable {
            status: status.as_u16(),
        };
    }
    let body = resp.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<ErrorBody>(&body)
        .ok()
        .and_then(|b| b.error)
        .unwrap_or_default();
    ProviderError::Rejected {
        code: detail
            .code
            .as_ref()
            .map(code_to_string)
            .unwrap_or_else(|| format!("HTTP_{}", status.as_u16())),
        message: detail.message.unwrap_or(body),
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    async fn create_task(
        &self,
        model: &ModelSpec,
        prompt: &str,
        input: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<CreatedTask, ProviderError> {
        let endpoint = self.endpoint(model)?;
        let mut body = input.clone();
        body.insert("model".into(), model.remote_name().into());
        body.insert("prompt".into(), prompt.into());

        let url = format!("{}/videos/generations", endpoint.base_url);
        let resp = self
            .authorized(self.client.post(&url), endpoint)
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }

        let created: CreateResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        let task_id = created
            .id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ProviderError::InvalidResponse("missing task id".into()))?;

        info!(model = %model.id, task_id = %task_id, "provider task created");
        Ok(CreatedTask {
            task_id,
            request_id: created.request_id,
        })
    }

    async fn get_task_status(&self, task_id: &str, model: &ModelSpec) -> Result<ProviderStatus, ProviderError> {
        let endpoint = self.endpoint(model)?;
        let url = format!("{}/async-result/{}", endpoint.base_url, task_id);
        let resp = self.authorized(self.client.get(&url), endpoint).send().await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }

        let raw: StatusResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        let status = raw.into_status()?;
        debug!(task_id, ?status, "provider status");
        Ok(status)
    }
}
