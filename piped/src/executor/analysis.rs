//! ANALYSIS stage: probe HTTP endpoints for a while and fail on too many errors

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::select_all;
use reqwest::{Client, Method};

use crate::config::stage::{AnalysisHttp, StageOptions};
use crate::errors::PipedError;
use crate::executor::{status_on_stop, Executor, Input, Registry, StopSignal};
use crate::logs::StageLogWriter;
use crate::model::{StageName, StageStatus};

pub fn register(r: &mut Registry) -> Result<(), PipedError> {
    r.register(StageName::Analysis, Arc::new(|input| Box::new(AnalysisExecutor { input })))
}

pub struct AnalysisExecutor {
    input: Input,
}

async fn check(client: &Client, probe: &AnalysisHttp) -> Result<(), String> {
    let method = Method::from_bytes(probe.method.to_uppercase().as_bytes())
        .map_err(|e| format!("invalid method {} ({})", probe.method, e))?;
    let mut req = client.request(method, &probe.url).timeout(probe.timeout);
    for (k, v) in &probe.headers {
        req = req.header(k, v);
    }
    let resp = req.send().await.map_err(|e| e.to_string())?;
    let code = resp.status().as_u16();
    if code != probe.expected_code {
        return Err(format!("got status code {}, expected {}", code, probe.expected_code));
    }
    Ok(())
}

/// Probe `probe.url` every interval. Only returns, with the reason, once
/// more than `failure_limit` checks failed.
async fn run_probe(client: &Client, probe: &AnalysisHttp, lw: &dyn StageLogWriter) -> String {
    let mut failures = 0u32;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + probe.interval, probe.interval);
    loop {
        ticker.tick().await;
        match check(client, probe).await {
            Ok(()) => lw.info(&format!("[HTTP] {} is healthy", probe.url)),
            Err(reason) => {
                failures += 1;
                lw.error(&format!(
                    "[HTTP] {} failed ({}), {} failure(s) so far",
                    probe.url, reason, failures
                ));
                if failures > probe.failure_limit {
                    return format!(
                        "analysis of {} failed {} times, exceeding the limit {}",
                        probe.url, failures, probe.failure_limit
                    );
                }
            }
        }
    }
}

#[async_trait]
impl Executor for AnalysisExecutor {
    async fn execute(&self, sig: &StopSignal) -> StageStatus {
        let lw = self.input.lw();
        let original = self.input.stage.status;
        let Some(StageOptions::Analysis(opts)) = self.input.stage_options() else {
            lw.error(&format!("Malformed configuration for stage {}", self.input.stage.name));
            return StageStatus::Failure;
        };
        let client = match Client::builder().build() {
            Ok(c) => c,
            Err(e) => {
                lw.error(&format!("Failed to build the HTTP client ({})", e));
                return StageStatus::Failure;
            }
        };

        lw.info(&format!(
            "Start analysis for {}s with {} HTTP probe(s)",
            opts.duration.as_secs(),
            opts.http.len()
        ));
        let probes: Vec<Pin<Box<dyn Future<Output = String> + Send + '_>>> = opts
            .http
            .iter()
            .map(|p| Box::pin(run_probe(&client, p, lw)) as Pin<Box<dyn Future<Output = String> + Send + '_>>)
            .collect();
        let first_failure = async move {
            if probes.is_empty() {
                std::future::pending::<String>().await
            } else {
                select_all(probes).await.0
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(opts.duration) => {
                lw.success("All analyses were successful");
                StageStatus::Success
            }
            reason = first_failure => {
                lw.error(&reason);
                StageStatus::Failure
            }
            kind = sig.wait() => status_on_stop(kind, original),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::stage::PipelineStageConfig;
    use crate::executor::new_stop_signal;
    use crate::executor::testing::{input, NoCommands};
    use crate::model::PipelineStage;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const APP: &str = "apiVersion: pipecd.dev/v1beta1\nkind: KubernetesApp\nspec: {}\n";

    /// Answer every connection with `status`
    async fn serve(status: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = sock.read(&mut buf).await;
                    let resp = format!("HTTP/1.1 {}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n", status);
                    let _ = sock.write_all(resp.as_bytes()).await;
                });
            }
        });
        format!("http://{}/healthz", addr)
    }

    fn config(url: &str, duration: &str) -> PipelineStageConfig {
        let yaml = format!(
            "name: ANALYSIS\nwith:\n  duration: {}\n  http:\n    - url: {}\n      interval: 50ms\n      failureLimit: 1\n",
            duration, url
        );
        serde_yaml::from_str(&yaml).unwrap()
    }

    #[tokio::test]
    async fn test_failing_endpoint_fails_stage() {
        let dir = tempfile::tempdir().unwrap();
        let url = serve("503 Service Unavailable").await;
        let stage = PipelineStage::new("stage-0", StageName::Analysis, 0, 0);
        let (input, _) = input(dir.path(), dir.path(), stage, Some(config(&url, "1m")), APP, Arc::new(NoCommands)).await;
        let (_handler, sig) = new_stop_signal();

        let status = AnalysisExecutor { input: input.clone() }.execute(&sig).await;
        assert_eq!(status, StageStatus::Failure);
        assert!(input.log.blocks().iter().any(|b| b.log.contains("exceeding the limit 1")));
    }

    #[tokio::test]
    async fn test_healthy_endpoint_succeeds_after_duration() {
        let dir = tempfile::tempdir().unwrap();
        let url = serve("200 OK").await;
        let stage = PipelineStage::new("stage-0", StageName::Analysis, 0, 0);
        let (input, _) = input(dir.path(), dir.path(), stage, Some(config(&url, "300ms")), APP, Arc::new(NoCommands)).await;
        let (_handler, sig) = new_stop_signal();

        let status = AnalysisExecutor { input }.execute(&sig).await;
        assert_eq!(status, StageStatus::Success);
    }
}
