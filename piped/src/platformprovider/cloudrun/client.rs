//! Cloud Run Admin API (Knative serving v1) client

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{header, Method};
use serde_json::Value;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::debug;

use super::manifest::ServiceManifest;
use super::Revision;
use crate::config::piped::CloudRunProviderConfig;
use crate::errors::PipedError;
use crate::http::client::status_error;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const TOKEN_TTL: Duration = Duration::from_secs(30 * 60);

/// Operations piped needs on Cloud Run
#[async_trait]
pub trait Client: Send + Sync {
    async fn create(&self, sm: &ServiceManifest) -> Result<ServiceManifest, PipedError>;

    /// Replace the service. Fails with `NotFound` when it does not exist.
    async fn update(&self, sm: &ServiceManifest) -> Result<ServiceManifest, PipedError>;

    async fn get_service(&self, name: &str) -> Result<ServiceManifest, PipedError>;

    async fn list_services(&self, label_selector: &str) -> Result<Vec<ServiceManifest>, PipedError>;

    async fn get_revision(&self, name: &str) -> Result<Revision, PipedError>;

    async fn list_revisions(&self, label_selector: &str) -> Result<Vec<Revision>, PipedError>;
}

/// REST client authenticated with a `gcloud` access token
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    credentials_file: String,
    token: Mutex<Option<(String, Instant)>>,
}

impl RestClient {
    pub fn new(config: &CloudRunProviderConfig) -> Result<Self, PipedError> {
        if config.project.is_empty() || config.region.is_empty() {
            return Err(PipedError::Config(
                "cloud run platform provider requires both project and region".to_string(),
            ));
        }
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: format!(
                "https://{}-run.googleapis.com/apis/serving.knative.dev/v1/namespaces/{}",
                config.region, config.project
            ),
            credentials_file: config.credentials_file.clone(),
            token: Mutex::new(None),
        })
    }

    async fn access_token(&self) -> Result<String, PipedError> {
        let mut cached = self.token.lock().await;
        if let Some((token, fetched_at)) = cached.as_ref() {
            if fetched_at.elapsed() < TOKEN_TTL {
                return Ok(token.clone());
            }
        }

        let mut cmd = Command::new("gcloud");
        if self.credentials_file.is_empty() {
            cmd.args(["auth", "print-access-token"]);
        } else {
            cmd.args(["auth", "application-default", "print-access-token"])
                .env("GOOGLE_APPLICATION_CREDENTIALS", &self.credentials_file);
        }
        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(PipedError::Config(format!(
                "failed to get a gcloud access token: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        *cached = Some((token.clone(), Instant::now()));
        Ok(token)
    }

    async fn request(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value, PipedError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("{} {}", method, url);
        let token = self.access_token().await?;

        let mut request = self
            .http
            .request(method, &url)
            .header(header::AUTHORIZATION, format!("Bearer {}", token));
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }
        Ok(response.json().await?)
    }

    async fn list(&self, resource: &str, label_selector: &str) -> Result<Vec<Value>, PipedError> {
        let mut path = format!("/{}", resource);
        if !label_selector.is_empty() {
            path.push_str("?labelSelector=");
            path.push_str(&url::form_urlencoded::byte_serialize(label_selector.as_bytes()).collect::<String>());
        }
        let list = self.request(Method::GET, &path, None).await?;
        Ok(list
            .get("items")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl Client for RestClient {
    async fn create(&self, sm: &ServiceManifest) -> Result<ServiceManifest, PipedError> {
        let created = self.request(Method::POST, "/services", Some(&sm.body)).await?;
        ServiceManifest::from_value(created)
    }

    async fn update(&self, sm: &ServiceManifest) -> Result<ServiceManifest, PipedError> {
        let path = format!("/services/{}", sm.name);
        let updated = self.request(Method::PUT, &path, Some(&sm.body)).await?;
        ServiceManifest::from_value(updated)
    }

    async fn get_service(&self, name: &str) -> Result<ServiceManifest, PipedError> {
        let service = self
            .request(Method::GET, &format!("/services/{}", name), None)
            .await?;
        ServiceManifest::from_value(service)
    }

    async fn list_services(&self, label_selector: &str) -> Result<Vec<ServiceManifest>, PipedError> {
        self.list("services", label_selector)
            .await?
            .into_iter()
            .map(ServiceManifest::from_value)
            .collect()
    }

    async fn get_revision(&self, name: &str) -> Result<Revision, PipedError> {
        let revision = self
            .request(Method::GET, &format!("/revisions/{}", name), None)
            .await?;
        Ok(Revision::from_value(revision))
    }

    async fn list_revisions(&self, label_selector: &str) -> Result<Vec<Revision>, PipedError> {
        Ok(self
            .list("revisions", label_selector)
            .await?
            .into_iter()
            .map(Revision::from_value)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_project_and_region() {
        let config = CloudRunProviderConfig {
            project: "my-project".to_string(),
            region: String::new(),
            credentials_file: String::new(),
        };
        assert!(RestClient::new(&config).is_err());

        let config = CloudRunProviderConfig {
            region: "asia-northeast1".to_string(),
            ..config
        };
        let client = RestClient::new(&config).unwrap();
        assert_eq!(
            client.base_url,
            "https://asia-northeast1-run.googleapis.com/apis/serving.knative.dev/v1/namespaces/my-project"
        );
    }
}
