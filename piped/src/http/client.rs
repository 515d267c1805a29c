//! HTTP client implementation

use std::time::Duration;

use reqwest::{header, Client, Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, error};

use crate::errors::PipedError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for the control-plane API
pub struct HttpClient {
    client: Client,
    base_url: String,
    piped_id: String,
    piped_key: SecretString,
}

impl HttpClient {
    /// Create a new HTTP client
    pub fn new(base_url: &str, piped_id: &str, piped_key: SecretString) -> Result<Self, PipedError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            piped_id: piped_id.to_string(),
            piped_key,
        })
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn piped_id(&self) -> &str {
        &self.piped_id
    }

    /// Make a GET request
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, PipedError> {
        self.request::<T, ()>(Method::GET, path, None).await
    }

    /// Make a POST request
    pub async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, PipedError> {
        self.request(Method::POST, path, Some(body)).await
    }

    /// Make a PUT request
    pub async fn put<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, PipedError> {
        self.request(Method::PUT, path, Some(body)).await
    }

    /// Make a PATCH request
    pub async fn patch<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, PipedError> {
        self.request(Method::PATCH, path, Some(body)).await
    }

    async fn request<T: DeserializeOwned, B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, PipedError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("{} {}", method, url);

        let mut request = self
            .client
            .request(method.clone(), &url)
            .header(
                header::AUTHORIZATION,
                format!("Bearer {}", self.piped_key.expose_secret()),
            )
            .header("X-Piped-ID", &self.piped_id);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("HTTP {} {} failed: {} - {}", method, path, status, body);
            return Err(status_error(status, body));
        }

        if status == StatusCode::NO_CONTENT {
            return Ok(serde_json::from_value(serde_json::Value::Null)?);
        }
        let body = response.json().await?;
        Ok(body)
    }
}

pub(crate) fn status_error(status: StatusCode, body: String) -> PipedError {
    let message = format!("{}: {}", status, body);
    match status {
        StatusCode::NOT_FOUND => PipedError::NotFound(message),
        StatusCode::CONFLICT => PipedError::Conflict(message),
        StatusCode::TOO_MANY_REQUESTS
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => PipedError::Retryable(message),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => PipedError::Validation(message),
        _ => PipedError::Internal(message),
    }
}
