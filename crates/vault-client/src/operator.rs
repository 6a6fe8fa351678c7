use std::time::Duration;

use reqwest::Client;
use url::Url;
use vault_protocol::OperatorHealth;

use crate::{ClientError, read_body};

/// Client for the privileged operator service.
///
/// `reset` is one administrative call: the service stops the fleet's applying
/// processes and the artifact storage owners, clears artifact storage, and
/// starts everything again.
#[derive(Debug, Clone)]
pub struct OperatorClient {
    http: Client,
    base: Url,
    token: Option<String>,
    health_timeout: Option<Duration>,
}

impl OperatorClient {
    /// `timeout` bounds every call, the reset included; give it the whole
    /// recovery budget.
    pub fn new(
        base_url: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let mut base = Url::parse(base_url).map_err(|e| ClientError::InvalidUrl {
            url: base_url.into(),
            source: e,
        })?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ClientError::Build)?;
        Ok(Self {
            http,
            base,
            token,
            health_timeout: None,
        })
    }

    /// Tighter bound for health probes, which are repeated while waiting
    /// for the fleet to come back.
    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = Some(timeout);
        self
    }

    fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        self.base.join(path).map_err(|e| ClientError::InvalidUrl {
            url: format!("{}{path}", self.base),
            source: e,
        })
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    pub async fn reset(&self) -> Result<(), ClientError> {
        let url = self.endpoint("v1/reset")?;
        tracing::info!(%url, "requesting operator reset");
        let resp = self
            .authorize(self.http.post(url.clone()))
            .send()
            .await
            .map_err(|e| ClientError::from_send(url.as_str(), e))?;
        read_body(url.as_str(), resp).await?;
        Ok(())
    }

    pub async fn health(&self) -> Result<OperatorHealth, ClientError> {
        let url = self.endpoint("v1/health")?;
        let mut req = self.authorize(self.http.get(url.clone()));
        if let Some(timeout) = self.health_timeout {
            req = req.timeout(timeout);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| ClientError::from_send(url.as_str(), e))?;
        let body = read_body(url.as_str(), resp).await?;
        serde_json::from_slice(&body).map_err(|e| ClientError::Decode {
            url: url.to_string(),
            message: e.to_string(),
        })
    }
}
