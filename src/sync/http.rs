//! Shared HTTP plumbing for the remote providers.

use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::error::{PomoflowError, Result};

pub(crate) const USER_AGENT: &str = concat!("pomoflow/", env!("CARGO_PKG_VERSION"));

pub(crate) fn client(provider: &str, timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| PomoflowError::Network {
            provider: provider.to_string(),
            message: format!("cannot build HTTP client: {}", e),
        })
}

pub(crate) fn send_error(provider: &str, e: reqwest::Error) -> PomoflowError {
    let message = if e.is_timeout() {
        format!("request timed out: {}", e)
    } else if e.is_connect() {
        format!("cannot connect: {}", e)
    } else {
        e.to_string()
    };
    PomoflowError::Network {
        provider: provider.to_string(),
        message,
    }
}

/// Reject non-2xx responses.
pub(crate) fn check_status(provider: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if !status.is_success() {
        return Err(PomoflowError::RemoteStatus {
            provider: provider.to_string(),
            status: status.as_u16(),
        });
    }
    Ok(response)
}

pub(crate) async fn read_json<T: DeserializeOwned>(
    provider: &str,
    response: reqwest::Response,
) -> Result<T> {
    let body = response.text().await.map_err(|e| send_error(provider, e))?;
    serde_json::from_str(&body).map_err(|e| PomoflowError::RemoteFormat {
        provider: provider.to_string(),
        reason: e.to_string(),
    })
}
