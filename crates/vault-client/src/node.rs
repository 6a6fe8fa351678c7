use std::time::Duration;

use reqwest::Client;
use vault_protocol::{NodeHealth, NodeHealthEnvelope};

use crate::{ClientError, read_body};

/// Bounded-timeout health query against fleet nodes.
#[derive(Debug, Clone)]
pub struct NodeClient {
    http: Client,
}

impl NodeClient {
    pub fn new(timeout: Duration) -> Result<Self, ClientError> {
        let http = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(ClientError::Build)?;
        Ok(Self { http })
    }

    /// Fetch and decode a node's health envelope, normalized to the latest schema.
    pub async fn health(&self, url: &str) -> Result<NodeHealth, ClientError> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| ClientError::from_send(url, e))?;
        let body = read_body(url, resp).await?;
        let envelope: NodeHealthEnvelope =
            serde_json::from_slice(&body).map_err(|e| ClientError::Decode {
                url: url.into(),
                message: e.to_string(),
            })?;
        Ok(envelope.into_latest())
    }
}
