//! The terminal resource owner: create/fetch/delete/heartbeat surface.
//!
//! The server side of this surface is CRUD plumbing and lives elsewhere;
//! this module only consumes it. [`HttpResourceClient`] speaks the
//! resource owner's RPC form: every call is a POST to `/api/terminals`
//! with a `{method, params}` body.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::error::{Error, Result};

/// Identifies which workload/host a terminal attaches to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalCoordinate {
    pub name: String,
    pub namespace: String,
    pub target: String,
}

/// Desired shape of the terminal container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub privileged: Option<bool>,
}

/// Node placement hints for the terminal pod. `node: None` lets the
/// resource owner pick one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostPreferences {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(rename = "hostPID", skip_serializing_if = "Option::is_none")]
    pub host_pid: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_network: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_host: Option<String>,
}

/// Body of a create call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTerminalRequest {
    /// Client-generated identifier, unique per open attempt.
    pub identifier: String,
    #[serde(flatten)]
    pub host: HostPreferences,
    pub container: ContainerSpec,
}

/// Server-side identity of the created terminal resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalMetadata {
    pub name: String,
    pub namespace: String,
}

/// Pod and container the session attaches to on the host cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodAddress {
    pub name: String,
    pub container: String,
}

/// Host cluster coordinates as returned by the create leg; the attach
/// token only exists after the fetch leg.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostClusterInfo {
    pub kube_api_server: String,
    pub namespace: String,
    pub pod: PodAddress,
}

/// Fully resolved host cluster coordinates, including the attach token.
#[derive(Debug, Clone)]
pub struct HostCluster {
    pub kube_api_server: String,
    pub namespace: String,
    pub pod: PodAddress,
    pub token: String,
}

/// Response of the create leg.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedTerminal {
    pub metadata: TerminalMetadata,
    pub host_cluster: HostClusterInfo,
    #[serde(default)]
    pub image_help_text: Option<String>,
}

/// Short-lived attach credentials from the fetch leg.
#[derive(Debug, Clone, Deserialize)]
pub struct TerminalCredentials {
    pub pod: PodAddress,
    pub token: String,
}

/// REST surface of the terminal resource owner. Consumed, never served.
#[async_trait]
pub trait TerminalResourceClient: Send + Sync {
    /// Creates the server-side terminal resource.
    async fn create(
        &self,
        coordinate: &TerminalCoordinate,
        request: &CreateTerminalRequest,
    ) -> Result<CreatedTerminal>;

    /// Fetches the attach credentials for an existing resource.
    async fn fetch(
        &self,
        coordinate: &TerminalCoordinate,
        metadata: &TerminalMetadata,
    ) -> Result<TerminalCredentials>;

    /// Deletes the server-side resource.
    async fn delete(
        &self,
        coordinate: &TerminalCoordinate,
        metadata: &TerminalMetadata,
    ) -> Result<()>;

    /// Keep-alive preventing idle cleanup of the resource.
    async fn heartbeat(
        &self,
        coordinate: &TerminalCoordinate,
        metadata: &TerminalMetadata,
    ) -> Result<()>;

    /// Lists the caller's terminal resources in `namespace`.
    async fn list(&self, namespace: &str) -> Result<Vec<TerminalMetadata>>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FetchResponse {
    host_cluster: TerminalCredentials,
}

/// Default [`TerminalResourceClient`] over HTTP.
pub struct HttpResourceClient {
    http: reqwest::Client,
    base_url: String,
    bearer_token: Option<String>,
}

impl HttpResourceClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| Error::ServerRejection(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bearer_token: None,
        })
    }

    /// Authenticates every call with a bearer token.
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    async fn invoke<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T> {
        debug!(target: "podshell.resource", method, "terminal resource call");
        let mut request = self
            .http
            .post(format!("{}/api/terminals", self.base_url))
            .json(&json!({ "method": method, "params": params }));
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::ServerRejection(format!("{method} call failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::ServerRejection(format!(
                "{method} call returned status {status}"
            )));
        }
        response
            .json()
            .await
            .map_err(|e| Error::ServerRejection(format!("failed to parse {method} response: {e}")))
    }
}

fn scoped_params(
    coordinate: &TerminalCoordinate,
    metadata: &TerminalMetadata,
) -> serde_json::Value {
    json!({
        "name": metadata.name,
        "namespace": metadata.namespace,
        "coordinate": coordinate,
    })
}

#[async_trait]
impl TerminalResourceClient for HttpResourceClient {
    async fn create(
        &self,
        coordinate: &TerminalCoordinate,
        request: &CreateTerminalRequest,
    ) -> Result<CreatedTerminal> {
        let mut params = serde_json::to_value(request)
            .map_err(|e| Error::ServerRejection(format!("failed to encode create request: {e}")))?;
        params["coordinate"] = json!(coordinate);
        self.invoke("create", params).await
    }

    async fn fetch(
        &self,
        coordinate: &TerminalCoordinate,
        metadata: &TerminalMetadata,
    ) -> Result<TerminalCredentials> {
        let response: FetchResponse = self
            .invoke("fetch", scoped_params(coordinate, metadata))
            .await?;
        Ok(response.host_cluster)
    }

    async fn delete(
        &self,
        coordinate: &TerminalCoordinate,
        metadata: &TerminalMetadata,
    ) -> Result<()> {
        let _: serde_json::Value = self
            .invoke("remove", scoped_params(coordinate, metadata))
            .await?;
        Ok(())
    }

    async fn heartbeat(
        &self,
        coordinate: &TerminalCoordinate,
        metadata: &TerminalMetadata,
    ) -> Result<()> {
        let _: serde_json::Value = self
            .invoke("heartbeat", scoped_params(coordinate, metadata))
            .await?;
        Ok(())
    }

    async fn list(&self, namespace: &str) -> Result<Vec<TerminalMetadata>> {
        self.invoke("list", json!({ "coordinate": { "namespace": namespace } }))
            .await
    }
}
