use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogSeverity {
    Info,
    Success,
    Error,
}

/// A single line of a stage log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogBlock {
    pub index: u64,
    pub log: String,
    pub severity: LogSeverity,
    pub created_at: i64,
}
