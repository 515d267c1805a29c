//! Stage log collection
//!
//! Executors write user-facing lines through [`StageLogWriter`]. Lines are
//! kept in order with a monotonically increasing index and mirrored to the
//! process log; [`StageLogPersister::flush`] ships everything not sent yet.

use std::sync::{Arc, Mutex};

use tracing::{debug, error, info};

use crate::errors::PipedError;
use crate::http::PipedApi;
use crate::logs::StageLogWriter;
use crate::model::{LogBlock, LogSeverity};
use crate::utils::now_unix;

#[derive(Default)]
struct Buffer {
    blocks: Vec<LogBlock>,
    sent: usize,
}

pub struct StageLogPersister {
    api: Arc<dyn PipedApi>,
    deployment_id: String,
    stage_id: String,
    retried_count: u32,
    buffer: Mutex<Buffer>,
    // serializes flushes so blocks are never reported twice
    flushing: tokio::sync::Mutex<()>,
}

impl StageLogPersister {
    pub fn new(
        api: Arc<dyn PipedApi>,
        deployment_id: impl Into<String>,
        stage_id: impl Into<String>,
        retried_count: u32,
    ) -> Self {
        Self {
            api,
            deployment_id: deployment_id.into(),
            stage_id: stage_id.into(),
            retried_count,
            buffer: Mutex::new(Buffer::default()),
            flushing: tokio::sync::Mutex::new(()),
        }
    }

    pub fn stage_id(&self) -> &str {
        &self.stage_id
    }

    fn append(&self, severity: LogSeverity, message: &str) {
        match severity {
            LogSeverity::Error => error!(
                deployment = %self.deployment_id,
                stage = %self.stage_id,
                "{}",
                message
            ),
            _ => info!(
                deployment = %self.deployment_id,
                stage = %self.stage_id,
                "{}",
                message
            ),
        }
        if let Ok(mut buf) = self.buffer.lock() {
            let index = buf.blocks.len() as u64;
            buf.blocks.push(LogBlock {
                index,
                log: message.to_string(),
                severity,
                created_at: now_unix(),
            });
        }
    }

    /// Every block recorded so far
    pub fn blocks(&self) -> Vec<LogBlock> {
        self.buffer
            .lock()
            .map(|buf| buf.blocks.clone())
            .unwrap_or_default()
    }

    /// Report the blocks written since the last successful flush
    pub async fn flush(&self) -> Result<(), PipedError> {
        let _guard = self.flushing.lock().await;
        let (pending, upto) = {
            let buf = self
                .buffer
                .lock()
                .map_err(|_| PipedError::Internal("log buffer poisoned".to_string()))?;
            (buf.blocks[buf.sent..].to_vec(), buf.blocks.len())
        };
        if pending.is_empty() {
            return Ok(());
        }
        self.api
            .report_stage_logs(&self.deployment_id, &self.stage_id, self.retried_count, &pending)
            .await?;
        if let Ok(mut buf) = self.buffer.lock() {
            buf.sent = upto;
        }
        debug!("Flushed {} log blocks of stage {}", pending.len(), self.stage_id);
        Ok(())
    }
}

impl StageLogWriter for StageLogPersister {
    fn info(&self, message: &str) {
        self.append(LogSeverity::Info, message);
    }

    fn success(&self, message: &str) {
        self.append(LogSeverity::Success, message);
    }

    fn error(&self, message: &str) {
        self.append(LogSeverity::Error, message);
    }
}
