//! JSON over HTTP plumbing shared by the remote proxies and the CLI client.

use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::errors::RemoteError;

/// Status codes treated as success. 1223 is what some proxies turn a 204 into.
pub const SUCCESS_CODES: [u16; 6] = [200, 201, 202, 204, 207, 1223];

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub fn is_success(status: u16) -> bool {
    SUCCESS_CODES.contains(&status)
}

/// Default bound for a single remote call, body included.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// A reqwest client with the defaults every remote call uses. Each request,
/// body included, must complete within `request_timeout`.
pub fn client(request_timeout: Duration) -> Client {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(request_timeout)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!("falling back to default http client: {}", e);
            Client::new()
        })
}

/// Joins `base` and a relative `path` with exactly one slash between them.
pub fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

async fn send(request: RequestBuilder, url: &str) -> Result<Response, RemoteError> {
    let response = request.send().await.map_err(|source| RemoteError::Transport {
        url: url.to_string(),
        source,
    })?;
    let status = response.status().as_u16();
    if is_success(status) {
        return Ok(response);
    }

    let reason = response
        .status()
        .canonical_reason()
        .unwrap_or("unexpected status")
        .to_string();
    let body = response.text().await.unwrap_or_default();
    let payload = serde_json::from_str::<serde_json::Value>(&body).ok();
    let message = payload
        .as_ref()
        .and_then(|p| p.get("error").or_else(|| p.get("message")))
        .and_then(|m| m.as_str())
        .map(str::to_string)
        .or_else(|| (!body.trim().is_empty()).then(|| body.trim().to_string()))
        .unwrap_or(reason);
    tracing::debug!(url, status, "remote call failed: {}", message);
    Err(RemoteError::Service {
        status,
        message,
        payload,
    })
}

async fn decode<T: DeserializeOwned>(response: Response, url: &str) -> Result<T, RemoteError> {
    let body = response.text().await.map_err(|source| RemoteError::Transport {
        url: url.to_string(),
        source,
    })?;
    serde_json::from_str(&body).map_err(|e| RemoteError::InvalidResponse {
        url: url.to_string(),
        message: e.to_string(),
    })
}

pub async fn get_json<T: DeserializeOwned>(client: &Client, url: &str) -> Result<T, RemoteError> {
    let response = send(client.get(url), url).await?;
    decode(response, url).await
}

pub async fn post_json<B, T>(client: &Client, url: &str, body: &B) -> Result<T, RemoteError>
where
    B: Serialize + ?Sized,
    T: DeserializeOwned,
{
    let response = send(client.post(url).json(body), url).await?;
    decode(response, url).await
}

/// POST with a JSON body, ignoring whatever comes back.
pub async fn post_unit<B: Serialize + ?Sized>(
    client: &Client,
    url: &str,
    body: &B,
) -> Result<(), RemoteError> {
    send(client.post(url).json(body), url).await?;
    Ok(())
}

pub async fn get_text(client: &Client, url: &str) -> Result<String, RemoteError> {
    let response = send(client.get(url), url).await?;
    response.text().await.map_err(|source| RemoteError::Transport {
        url: url.to_string(),
        source,
    })
}

/// A downloaded file with the content type the server reported.
#[derive(Debug, Clone)]
pub struct Download {
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

pub async fn get_bytes(
    client: &Client,
    url: &str,
    query: &[(&str, &str)],
) -> Result<Download, RemoteError> {
    let response = send(client.get(url).query(query), url).await?;
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let bytes = response.bytes().await.map_err(|source| RemoteError::Transport {
        url: url.to_string(),
        source,
    })?;
    Ok(Download {
        content_type,
        bytes: bytes.to_vec(),
    })
}
