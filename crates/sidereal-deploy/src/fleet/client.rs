//! HTTP client for the fleet API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::config::FleetConfig;
use crate::error::{DeployError, DeployResult};
use crate::types::{
    CreateVolumeRequest, LaunchInput, Lease, Machine, MachineId, MachineState, ReleaseStatus,
    Volume,
};

use super::FleetApi;

const LEASE_NONCE_HEADER: &str = "x-lease-nonce";

/// Error code the fleet API uses for placement failures.
const PLACEMENT_ERROR_CODE: &str = "insufficient_capacity";
const PLACEMENT_ERROR_MESSAGE: &str = "could not reserve resource for machine";

/// Error body returned by the fleet API.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    code: Option<String>,
}

#[derive(Serialize)]
struct LeaseRequest {
    ttl: u64,
}

#[derive(Serialize)]
struct MetadataRequest<'a> {
    value: &'a str,
}

#[derive(Serialize)]
struct ReleaseStatusRequest {
    status: ReleaseStatus,
}

#[derive(Deserialize)]
struct LogsResponse {
    #[serde(default)]
    lines: Vec<String>,
}

/// HTTP client for the fleet API.
#[derive(Debug, Clone)]
pub struct FleetClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl FleetClient {
    /// Create a new fleet client from configuration.
    pub fn new(config: &FleetConfig) -> DeployResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(DeployError::Http)?;

        let base = config.url.trim_end_matches('/');
        let base_url = if config.app.is_empty() {
            base.to_owned()
        } else {
            format!("{base}/apps/{}", config.app)
        };

        Ok(Self {
            client,
            base_url,
            token: config.token.clone(),
        })
    }

    /// Create a new fleet client with a custom base URL.
    pub fn with_url(url: impl Into<String>) -> DeployResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(90))
            .build()
            .map_err(DeployError::Http)?;

        Ok(Self {
            client,
            base_url: url.into().trim_end_matches('/').to_owned(),
            token: None,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorise(&self, request: RequestBuilder, nonce: Option<&str>) -> RequestBuilder {
        let request = match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        match nonce {
            Some(nonce) if !nonce.is_empty() => request.header(LEASE_NONCE_HEADER, nonce),
            _ => request,
        }
    }

    async fn send(
        &self,
        request: RequestBuilder,
        nonce: Option<&str>,
        machine_id: Option<&MachineId>,
    ) -> DeployResult<Response> {
        let response = self
            .authorise(request, nonce)
            .send()
            .await
            .map_err(classify_transport)?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let body: ErrorBody = response.json().await.unwrap_or_default();
        Err(classify_status(status, body, machine_id))
    }

    async fn send_empty(
        &self,
        request: RequestBuilder,
        nonce: Option<&str>,
        machine_id: &MachineId,
    ) -> DeployResult<()> {
        self.send(request, nonce, Some(machine_id)).await.map(drop)
    }
}

fn classify_transport(err: reqwest::Error) -> DeployError {
    if err.is_timeout() || err.is_connect() {
        DeployError::transient(err.to_string())
    } else {
        DeployError::Http(err)
    }
}

fn classify_status(
    status: StatusCode,
    body: ErrorBody,
    machine_id: Option<&MachineId>,
) -> DeployError {
    let message = if body.error.is_empty() {
        status.to_string()
    } else {
        body.error
    };

    // A structured code wins; older API versions only carry the message.
    if body.code.as_deref() == Some(PLACEMENT_ERROR_CODE)
        || message.contains(PLACEMENT_ERROR_MESSAGE)
    {
        return DeployError::Placement(message);
    }

    match status {
        StatusCode::NOT_FOUND => DeployError::NotFound(message),
        StatusCode::CONFLICT => match machine_id {
            Some(id) => DeployError::LeaseConflict {
                machine_id: id.clone(),
                message,
            },
            None => DeployError::Api {
                status: status.as_u16(),
                message,
            },
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => DeployError::Api {
            status: status.as_u16(),
            message,
        }
        .unrecoverable(),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => DeployError::Transient {
            status: Some(status.as_u16()),
            message,
        },
        s if s.is_server_error() => DeployError::Transient {
            status: Some(s.as_u16()),
            message,
        },
        s => DeployError::Api {
            status: s.as_u16(),
            message,
        },
    }
}

#[async_trait]
impl FleetApi for FleetClient {
    async fn launch(&self, input: &LaunchInput) -> DeployResult<Machine> {
        let request = self.client.post(self.url("/machines")).json(input);
        let response = self.send(request, None, None).await?;
        response.json().await.map_err(DeployError::Http)
    }

    async fn update(&self, input: &LaunchInput, nonce: Option<&str>) -> DeployResult<Machine> {
        let id = input
            .id
            .as_ref()
            .ok_or_else(|| DeployError::internal("update requires a machine ID"))?;
        let request = self
            .client
            .post(self.url(&format!("/machines/{id}")))
            .json(input);
        let response = self.send(request, nonce, Some(id)).await?;
        response.json().await.map_err(DeployError::Http)
    }

    async fn start(&self, id: &MachineId, nonce: Option<&str>) -> DeployResult<()> {
        let request = self.client.post(self.url(&format!("/machines/{id}/start")));
        self.send_empty(request, nonce, id).await
    }

    async fn stop(&self, id: &MachineId, nonce: Option<&str>) -> DeployResult<()> {
        let request = self.client.post(self.url(&format!("/machines/{id}/stop")));
        self.send_empty(request, nonce, id).await
    }

    async fn cordon(&self, id: &MachineId, nonce: Option<&str>) -> DeployResult<()> {
        let request = self.client.post(self.url(&format!("/machines/{id}/cordon")));
        self.send_empty(request, nonce, id).await
    }

    async fn uncordon(&self, id: &MachineId, nonce: Option<&str>) -> DeployResult<()> {
        let request = self
            .client
            .post(self.url(&format!("/machines/{id}/uncordon")));
        self.send_empty(request, nonce, id).await
    }

    async fn destroy(&self, id: &MachineId, kill: bool, nonce: Option<&str>) -> DeployResult<()> {
        let request = self
            .client
            .delete(self.url(&format!("/machines/{id}")))
            .query(&[("kill", kill)]);
        self.send_empty(request, nonce, id).await
    }

    async fn list(&self, states: &[MachineState]) -> DeployResult<Vec<Machine>> {
        let mut request = self.client.get(self.url("/machines"));
        if !states.is_empty() {
            let filter: Vec<&str> = states.iter().map(MachineState::as_str).collect();
            request = request.query(&[("state", filter.join(","))]);
        }
        let response = self.send(request, None, None).await?;
        response.json().await.map_err(DeployError::Http)
    }

    async fn get(&self, id: &MachineId) -> DeployResult<Machine> {
        let request = self.client.get(self.url(&format!("/machines/{id}")));
        let response = self.send(request, None, Some(id)).await?;
        response.json().await.map_err(DeployError::Http)
    }

    async fn acquire_lease(&self, id: &MachineId, ttl_secs: u64) -> DeployResult<Lease> {
        let request = self
            .client
            .post(self.url(&format!("/machines/{id}/lease")))
            .json(&LeaseRequest { ttl: ttl_secs });
        let response = self.send(request, None, Some(id)).await?;
        response.json().await.map_err(DeployError::Http)
    }

    async fn refresh_lease(
        &self,
        id: &MachineId,
        ttl_secs: u64,
        nonce: &str,
    ) -> DeployResult<Lease> {
        let request = self
            .client
            .post(self.url(&format!("/machines/{id}/lease")))
            .json(&LeaseRequest { ttl: ttl_secs });
        let response = self.send(request, Some(nonce), Some(id)).await?;
        response.json().await.map_err(DeployError::Http)
    }

    async fn release_lease(&self, id: &MachineId, nonce: &str) -> DeployResult<()> {
        let request = self
            .client
            .delete(self.url(&format!("/machines/{id}/lease")));
        self.send_empty(request, Some(nonce), id).await
    }

    async fn wait(
        &self,
        id: &MachineId,
        state: MachineState,
        timeout: Duration,
    ) -> DeployResult<()> {
        let request = self
            .client
            .get(self.url(&format!("/machines/{id}/wait")))
            .query(&[
                ("state", state.as_str().to_owned()),
                ("timeout", timeout.as_secs().max(1).to_string()),
            ]);
        self.send_empty(request, None, id).await
    }

    async fn set_metadata(
        &self,
        id: &MachineId,
        key: &str,
        value: &str,
        nonce: Option<&str>,
    ) -> DeployResult<()> {
        let request = self
            .client
            .post(self.url(&format!("/machines/{id}/metadata/{key}")))
            .json(&MetadataRequest { value });
        self.send_empty(request, nonce, id).await
    }

    async fn list_volumes(&self) -> DeployResult<Vec<Volume>> {
        let request = self.client.get(self.url("/volumes"));
        let response = self.send(request, None, None).await?;
        response.json().await.map_err(DeployError::Http)
    }

    async fn create_volume(&self, request: &CreateVolumeRequest) -> DeployResult<Volume> {
        let builder = self.client.post(self.url("/volumes")).json(request);
        let response = self.send(builder, None, None).await?;
        response.json().await.map_err(DeployError::Http)
    }

    async fn logs(&self, id: &MachineId, limit: usize) -> DeployResult<Vec<String>> {
        let request = self
            .client
            .get(self.url(&format!("/machines/{id}/logs")))
            .query(&[("limit", limit)]);
        let response = self.send(request, None, Some(id)).await?;
        let logs: LogsResponse = response.json().await.map_err(DeployError::Http)?;
        Ok(logs.lines)
    }

    async fn update_release_status(
        &self,
        release_id: &str,
        status: ReleaseStatus,
    ) -> DeployResult<()> {
        let request = self
            .client
            .patch(self.url(&format!("/releases/{release_id}")))
            .json(&ReleaseStatusRequest { status });
        self.send(request, None, None).await.map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(error: &str, code: Option<&str>) -> ErrorBody {
        ErrorBody {
            error: error.to_owned(),
            code: code.map(str::to_owned),
        }
    }

    #[test]
    fn client_creation() {
        let config = FleetConfig {
            app: "web".to_owned(),
            ..FleetConfig::default()
        };
        let client = FleetClient::new(&config);
        assert!(client.is_ok());
        assert!(client.map(|c| c.base_url.ends_with("/apps/web")).unwrap_or(false));
    }

    #[test]
    fn client_with_url() {
        let client = FleetClient::with_url("http://localhost:4280/v1/");
        assert!(client.is_ok());
    }

    #[test]
    fn placement_prefers_error_code() {
        let err = classify_status(
            StatusCode::PRECONDITION_FAILED,
            body("host full", Some(PLACEMENT_ERROR_CODE)),
            None,
        );
        assert!(err.is_placement());
    }

    #[test]
    fn placement_falls_back_to_message() {
        let err = classify_status(
            StatusCode::PRECONDITION_FAILED,
            body(
                "could not reserve resource for machine: insufficient memory",
                None,
            ),
            None,
        );
        assert!(err.is_placement());
    }

    #[test]
    fn conflicts_name_the_machine() {
        let id = MachineId::new("m1");
        let err = classify_status(
            StatusCode::CONFLICT,
            body("lease currently held by someone else", None),
            Some(&id),
        );
        assert!(matches!(err, DeployError::LeaseConflict { ref machine_id, .. } if machine_id == &id));
        assert!(err.is_unrecoverable());
    }

    #[test]
    fn status_codes_are_classified() {
        assert!(classify_status(StatusCode::BAD_GATEWAY, body("", None), None).is_retryable());
        assert!(
            classify_status(StatusCode::REQUEST_TIMEOUT, body("", None), None).is_retryable()
        );
        assert!(classify_status(StatusCode::NOT_FOUND, body("", None), None).is_not_found());
        assert!(
            classify_status(StatusCode::UNAUTHORIZED, body("", None), None).is_unrecoverable()
        );
        let err = classify_status(StatusCode::BAD_REQUEST, body("invalid config", None), None);
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("invalid config"));
    }
}
