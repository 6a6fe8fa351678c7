//! HTTP clients for the control plane's two outbound interfaces.
//!
//! [`NodeClient`] queries a fleet node's self-reported health. [`OperatorClient`]
//! talks to the privileged operator service, the only component allowed to stop
//! services, truncate artifact storage and restart them. Neither client retries;
//! callers treat a failed call as a failed cycle.

mod node;
mod operator;

pub use node::NodeClient;
pub use operator::OperatorClient;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to build http client: {0}")]
    Build(#[source] reqwest::Error),
    #[error("invalid url '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned HTTP {status}: {body}")]
    Status { url: String, status: u16, body: String },
    #[error("failed to decode response from {url}: {message}")]
    Decode { url: String, message: String },
}

impl ClientError {
    /// Timeouts and refused connections; the next cycle may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClientError::Timeout { .. } | ClientError::Transport { .. }
        )
    }

    pub(crate) fn from_send(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Timeout { url: url.into() }
        } else {
            ClientError::Transport {
                url: url.into(),
                source: err,
            }
        }
    }
}

/// Read a response body, turning non-2xx statuses into [`ClientError::Status`].
pub(crate) async fn read_body(url: &str, resp: reqwest::Response) -> Result<Vec<u8>, ClientError> {
    let status = resp.status();
    let bytes = resp
        .bytes()
        .await
        .map_err(|e| ClientError::from_send(url, e))?;
    if !status.is_success() {
        return Err(ClientError::Status {
            url: url.into(),
            status: status.as_u16(),
            body: String::from_utf8_lossy(&bytes).chars().take(512).collect(),
        });
    }
    Ok(bytes.to_vec())
}
