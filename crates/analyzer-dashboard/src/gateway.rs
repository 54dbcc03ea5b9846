//! Remote resource gateway: the analyzer backend's REST surface.
//!
//! The sync core only talks to the [`Gateway`] trait; [`HttpGateway`] is the
//! reqwest implementation used by the binary.

use std::time::Duration;

use analyzer_proto::model::{ArtifactContent, ArtifactKind, Entity, EntityFields, EntityId};
use async_trait::async_trait;
use reqwest::{Client, Method, Url};
use serde_json::Value;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },

    #[error("malformed response from {url}: {reason}")]
    Malformed { url: String, reason: String },

    #[error("invalid backend url: {0}")]
    InvalidUrl(String),
}

#[async_trait]
pub trait Gateway: Send + Sync + 'static {
    async fn list_entities(&self) -> Result<Vec<Entity>, GatewayError>;

    async fn list_artifact_filenames(
        &self,
        entity_id: &EntityId,
        kind: ArtifactKind,
    ) -> Result<Vec<String>, GatewayError>;

    async fn fetch_artifact(
        &self,
        entity_id: &EntityId,
        kind: ArtifactKind,
        filename: &str,
    ) -> Result<ArtifactContent, GatewayError>;

    async fn create_entity(&self, fields: &EntityFields) -> Result<(), GatewayError>;

    async fn update_entity(
        &self,
        entity_id: &EntityId,
        fields: &EntityFields,
    ) -> Result<(), GatewayError>;

    async fn delete_entity(&self, entity_id: &EntityId) -> Result<(), GatewayError>;
}

/// Gateway over the backend's `/api/analyzers/` routes.
pub struct HttpGateway {
    client: Client,
    base: Url,
}

impl HttpGateway {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, GatewayError> {
        let base = Url::parse(base_url).map_err(|e| GatewayError::InvalidUrl(e.to_string()))?;
        if base.cannot_be_a_base() {
            return Err(GatewayError::InvalidUrl(base_url.to_string()));
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base })
    }

    /// `/api/analyzers/<segments...>`, each segment percent-encoded.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().push("api").push("analyzers");
            if segments.is_empty() {
                // the collection route is registered with a trailing slash
                path.push("");
            } else {
                path.extend(segments);
            }
        }
        url
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<&EntityFields>,
    ) -> Result<String, GatewayError> {
        debug!("gateway: {} {}", method, url);
        let mut request = self
            .client
            .request(method, url.clone())
            .header("Accept", "application/json");
        if let Some(fields) = body {
            request = request.json(fields);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(GatewayError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(response.text().await?)
    }

    async fn get_json(&self, url: Url) -> Result<Value, GatewayError> {
        let body = self.send(Method::GET, url.clone(), None).await?;
        serde_json::from_str(&body).map_err(|e| GatewayError::Malformed {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn list_entities(&self) -> Result<Vec<Entity>, GatewayError> {
        let url = self.url(&[]);
        match self.get_json(url.clone()).await? {
            Value::Array(items) => items
                .into_iter()
                .map(|item| {
                    serde_json::from_value(item).map_err(|e| GatewayError::Malformed {
                        url: url.to_string(),
                        reason: e.to_string(),
                    })
                })
                .collect(),
            other => {
                warn!("gateway: analyzer list is not an array ({}), treating as empty", other);
                Ok(Vec::new())
            }
        }
    }

    async fn list_artifact_filenames(
        &self,
        entity_id: &EntityId,
        kind: ArtifactKind,
    ) -> Result<Vec<String>, GatewayError> {
        let url = self.url(&[entity_id.as_str(), kind.listing_segment()]);
        match self.get_json(url.clone()).await? {
            Value::Null => Ok(Vec::new()),
            value => serde_json::from_value(value).map_err(|e| GatewayError::Malformed {
                url: url.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn fetch_artifact(
        &self,
        entity_id: &EntityId,
        kind: ArtifactKind,
        filename: &str,
    ) -> Result<ArtifactContent, GatewayError> {
        let url = self.url(&[entity_id.as_str(), kind.content_segment(), filename]);
        let body = self.send(Method::GET, url, None).await?;
        Ok(ArtifactContent::from_body(&body))
    }

    async fn create_entity(&self, fields: &EntityFields) -> Result<(), GatewayError> {
        self.send(Method::POST, self.url(&[]), Some(fields)).await?;
        Ok(())
    }

    async fn update_entity(
        &self,
        entity_id: &EntityId,
        fields: &EntityFields,
    ) -> Result<(), GatewayError> {
        self.send(Method::PUT, self.url(&[entity_id.as_str()]), Some(fields))
            .await?;
        Ok(())
    }

    async fn delete_entity(&self, entity_id: &EntityId) -> Result<(), GatewayError> {
        self.send(Method::DELETE, self.url(&[entity_id.as_str()]), None)
            .await?;
        Ok(())
    }
}
