//! Shared HTTP plumbing for the provider clients

use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

use super::Dependency;
use crate::error::{ImportError, ImportResult};

const USER_AGENT: &str = concat!("setlist-import/", env!("CARGO_PKG_VERSION"));

/// Transport-level ceiling; per-call budgets are enforced by the upstream guard
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) fn build_client(dependency: Dependency) -> ImportResult<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(CLIENT_TIMEOUT)
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .map_err(|e| {
            ImportError::Configuration(format!("{dependency} HTTP client build failed: {e}"))
        })
}

pub(crate) fn require_credential<'a>(
    dependency: Dependency,
    value: &'a Option<String>,
    name: &str,
) -> ImportResult<&'a str> {
    value
        .as_deref()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ImportError::Configuration(format!("{dependency}: {name} not configured")))
}

pub(crate) fn network_error(dependency: Dependency, err: reqwest::Error) -> ImportError {
    ImportError::transient(dependency, err.to_string())
}

/// Map the response status onto the error taxonomy and decode the body
pub(crate) async fn read_json<T: DeserializeOwned>(
    dependency: Dependency,
    response: Response,
    entity: &str,
) -> ImportResult<T> {
    let status = response.status();

    if status == StatusCode::NOT_FOUND {
        return Err(ImportError::not_found(dependency, entity));
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(ImportError::Configuration(format!(
            "{dependency} rejected credentials ({status})"
        )));
    }
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return Err(ImportError::transient(dependency, format!("HTTP {status}")));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ImportError::Validation(format!(
            "{dependency} returned {status} for {entity}: {body}"
        )));
    }

    response
        .json::<T>()
        .await
        .map_err(|e| ImportError::Validation(format!("{dependency} {entity} decode failed: {e}")))
}
