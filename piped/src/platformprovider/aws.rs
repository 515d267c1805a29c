//! `aws` CLI runner shared by the Lambda and ECS clients

use std::path::PathBuf;

use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

use crate::config::piped::AwsProviderConfig;
use crate::errors::PipedError;

pub struct AwsCli {
    path: PathBuf,
    config: AwsProviderConfig,
}

impl AwsCli {
    pub fn new(config: &AwsProviderConfig) -> Result<Self, PipedError> {
        if config.region.is_empty() {
            return Err(PipedError::Config("region is required field".to_string()));
        }
        let path = which::which("aws")
            .map_err(|e| PipedError::Config(format!("aws binary was not found: {}", e)))?;
        Ok(Self {
            path,
            config: config.clone(),
        })
    }

    pub fn region(&self) -> &str {
        &self.config.region
    }

    /// Run `aws {service} {operation}` with `input` passed as `--cli-input-json`
    /// and return the JSON output (`Null` for operations without output).
    pub async fn call(
        &self,
        service: &str,
        operation: &str,
        input: Option<&Value>,
        extra_args: &[String],
    ) -> Result<Value, PipedError> {
        let mut cmd = Command::new(&self.path);
        cmd.arg(service)
            .arg(operation)
            .arg("--region")
            .arg(&self.config.region)
            .arg("--output")
            .arg("json");
        if !self.config.profile.is_empty() {
            cmd.arg("--profile").arg(&self.config.profile);
        }
        if let Some(input) = input {
            cmd.arg("--cli-input-json").arg(serde_json::to_string(input)?);
        }
        cmd.args(extra_args);
        if !self.config.credentials_file.is_empty() {
            cmd.env("AWS_SHARED_CREDENTIALS_FILE", &self.config.credentials_file);
        }
        if !self.config.role_arn.is_empty() && !self.config.token_file.is_empty() {
            cmd.env("AWS_ROLE_ARN", &self.config.role_arn)
                .env("AWS_WEB_IDENTITY_TOKEN_FILE", &self.config.token_file);
        }

        debug!("Running aws {} {}", service, operation);
        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(classify_error(
                operation,
                String::from_utf8_lossy(&output.stderr).trim(),
            ));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&stdout)?)
    }
}

fn classify_error(operation: &str, stderr: &str) -> PipedError {
    let message = format!("aws {} failed: {}", operation, stderr);
    if stderr.contains("ResourceNotFoundException")
        || stderr.contains("ServiceNotFoundException")
        || stderr.contains("ClusterNotFoundException")
    {
        PipedError::NotFound(message)
    } else if stderr.contains("ResourceConflictException") {
        PipedError::Conflict(message)
    } else if stderr.contains("TooManyRequestsException")
        || stderr.contains("ThrottlingException")
        || stderr.contains("ServiceException")
    {
        PipedError::Retryable(message)
    } else {
        PipedError::Internal(message)
    }
}
