//! Request/response persistence against the diagram REST API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use diagram_core::Cell;
use reqwest::{header, Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use url::Url;

use super::{
    LoadRequest, PersistenceError, PersistenceStrategy, SavePayload, SaveRequest, SaveResult,
};
use crate::auth::TokenProvider;

const NAME: &str = "rest";
const JSON_PATCH: &str = "application/json-patch+json";

/// Errors from the diagram REST API.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The configured base URL cannot be used.
    #[error("invalid API URL: {0}")]
    InvalidUrl(String),
    /// HTTP layer failed (connection, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The server answered with a non-success status.
    #[error("server returned {status}: {body}")]
    Status {
        /// HTTP status.
        status: StatusCode,
        /// Response body, possibly empty.
        body: String,
    },
    /// The response body was not the expected JSON.
    #[error("failed to parse API payload: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<ApiError> for PersistenceError {
    fn from(err: ApiError) -> Self {
        Self::Api(err.to_string())
    }
}

/// A diagram as returned by the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagramDocument {
    /// Diagram ID.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Every cell in the diagram.
    #[serde(default)]
    pub cells: Vec<Cell>,
    /// Monotonic server version.
    #[serde(default)]
    pub update_vector: u64,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Diagram flavour, e.g. `DFD-1.0.0`.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub diagram_type: Option<String>,
}

/// Thin client for `/threat_models/{tm}/diagrams/{id}`.
#[derive(Clone)]
pub struct DiagramApiClient {
    http: Client,
    base_url: Url,
    token_provider: Option<Arc<dyn TokenProvider>>,
}

impl std::fmt::Debug for DiagramApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagramApiClient")
            .field("base_url", &self.base_url.as_str())
            .field("authenticated", &self.token_provider.is_some())
            .finish_non_exhaustive()
    }
}

impl DiagramApiClient {
    /// Create a client rooted at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::InvalidUrl`] if the URL is malformed or cannot
    /// carry a path, and [`ApiError::Http`] if the HTTP client fails to build.
    pub fn new(
        base_url: impl AsRef<str>,
        timeout: Duration,
        token_provider: Option<Arc<dyn TokenProvider>>,
    ) -> Result<Self, ApiError> {
        let base_url =
            Url::parse(base_url.as_ref()).map_err(|e| ApiError::InvalidUrl(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(ApiError::InvalidUrl(format!(
                "{base_url} cannot be used as a base URL"
            )));
        }

        let http = Client::builder()
            .user_agent(concat!("diagram-collab/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;

        Ok(Self {
            http,
            base_url,
            token_provider,
        })
    }

    fn diagram_url(&self, threat_model_id: &str, diagram_id: &str) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| ApiError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(["threat_models", threat_model_id, "diagrams", diagram_id]);
        Ok(url)
    }

    async fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token_provider {
            Some(provider) => match provider.access_token().await {
                Some(token) => request.bearer_auth(token),
                None => request,
            },
            None => request,
        }
    }

    async fn read_document(response: reqwest::Response) -> Result<DiagramDocument, ApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status { status, body });
        }
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Replace the diagram's cells.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] on transport failure, non-success status or an
    /// unparseable response.
    pub async fn save_cells(
        &self,
        threat_model_id: &str,
        diagram_id: &str,
        cells: &[Cell],
    ) -> Result<DiagramDocument, ApiError> {
        let url = self.diagram_url(threat_model_id, diagram_id)?;
        let body = json!([{ "op": "replace", "path": "/cells", "value": cells }]);
        let request = self
            .http
            .patch(url)
            .header(header::CONTENT_TYPE, JSON_PATCH)
            .body(serde_json::to_vec(&body)?);
        let response = self.authorize(request).await.send().await?;
        let document = Self::read_document(response).await?;
        tracing::debug!(
            diagram_id,
            cells = cells.len(),
            update_vector = document.update_vector,
            "Saved diagram snapshot"
        );
        Ok(document)
    }

    /// Fetch a diagram.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] on transport failure, non-success status or an
    /// unparseable response.
    pub async fn load(
        &self,
        threat_model_id: &str,
        diagram_id: &str,
    ) -> Result<DiagramDocument, ApiError> {
        let url = self.diagram_url(threat_model_id, diagram_id)?;
        let request = self.http.get(url).header(header::ACCEPT, "application/json");
        let response = self.authorize(request).await.send().await?;
        Self::read_document(response).await
    }
}

/// Saves full snapshots and loads diagrams over HTTP.
#[derive(Debug, Clone)]
pub struct RestStrategy {
    client: DiagramApiClient,
}

impl RestStrategy {
    /// Wrap an API client.
    #[must_use]
    pub fn new(client: DiagramApiClient) -> Self {
        Self { client }
    }

    /// The underlying client.
    #[must_use]
    pub fn client(&self) -> &DiagramApiClient {
        &self.client
    }
}

fn require_threat_model(id: Option<String>) -> Result<String, PersistenceError> {
    match id {
        Some(id) if !id.is_empty() => Ok(id),
        _ => Err(PersistenceError::MissingThreatModelId),
    }
}

#[async_trait]
impl PersistenceStrategy for RestStrategy {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn save(&self, request: SaveRequest) -> Result<SaveResult, PersistenceError> {
        let threat_model_id = require_threat_model(request.threat_model_id)?;
        let cells = match request.payload {
            SavePayload::Snapshot(cells) => cells,
            SavePayload::Operations(_) => {
                return Err(PersistenceError::Unsupported {
                    strategy: NAME,
                    operation: "operation saves",
                    hint: "send a full snapshot",
                })
            }
            SavePayload::History(_) => {
                return Err(PersistenceError::Unsupported {
                    strategy: NAME,
                    operation: "undo/redo saves",
                    hint: "collaborative history needs a live connection",
                })
            }
        };

        let document = self
            .client
            .save_cells(&threat_model_id, &request.diagram_id, &cells)
            .await?;
        Ok(SaveResult {
            update_vector: Some(document.update_vector),
            cells: Some(document.cells),
            operation_id: None,
        })
    }

    async fn load(&self, request: LoadRequest) -> Result<DiagramDocument, PersistenceError> {
        let threat_model_id = require_threat_model(request.threat_model_id)?;
        Ok(self
            .client
            .load(&threat_model_id, &request.diagram_id)
            .await?)
    }
}
