//! Pipeline stage configuration

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::duration;
use crate::errors::PipedError;
use crate::model::StageName;

/// Conditions under which a stage is skipped before running
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkipOptions {
    /// Glob patterns; the stage is skipped when every changed file matches one of them
    #[serde(default)]
    pub paths: Vec<String>,

    #[serde(default)]
    pub commit_message_prefix: String,
}

impl SkipOptions {
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty() && self.commit_message_prefix.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitStageOptions {
    #[serde(with = "duration::serde_str")]
    pub duration: Duration,
    #[serde(default)]
    pub skip_on: SkipOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitApprovalStageOptions {
    #[serde(default = "default_approval_timeout", with = "duration::serde_str")]
    pub timeout: Duration,

    /// Logins allowed to approve, anyone when empty
    #[serde(default)]
    pub approvers: Vec<String>,

    #[serde(default = "default_min_approver_num")]
    pub min_approver_num: usize,

    #[serde(default)]
    pub skip_on: SkipOptions,
}

fn default_approval_timeout() -> Duration {
    Duration::from_secs(6 * 3600)
}

fn default_min_approver_num() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisHttp {
    pub url: String,
    #[serde(default = "default_http_method")]
    pub method: String,
    #[serde(default = "default_expected_code")]
    pub expected_code: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_analysis_interval", with = "duration::serde_str")]
    pub interval: Duration,
    #[serde(default = "default_analysis_http_timeout", with = "duration::serde_str")]
    pub timeout: Duration,
    #[serde(default)]
    pub failure_limit: u32,
}

fn default_http_method() -> String {
    "GET".to_string()
}

fn default_expected_code() -> u16 {
    200
}

fn default_analysis_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_analysis_http_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisStageOptions {
    #[serde(with = "duration::serde_str")]
    pub duration: Duration,
    #[serde(default)]
    pub http: Vec<AnalysisHttp>,
    #[serde(default)]
    pub skip_on: SkipOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptRunStageOptions {
    pub run: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_script_timeout", with = "duration::serde_str")]
    pub timeout: Duration,
    #[serde(default)]
    pub skip_on: SkipOptions,
}

fn default_script_timeout() -> Duration {
    Duration::from_secs(6 * 3600)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalTool {
    pub command: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomSyncStageOptions {
    pub run: String,
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
    #[serde(default)]
    pub external_tools: Vec<ExternalTool>,
    #[serde(default = "default_script_timeout", with = "duration::serde_str")]
    pub timeout: Duration,
    #[serde(default)]
    pub skip_on: SkipOptions,
}

/// Traffic percentage routed to the new version by a promote-like stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromoteStageOptions {
    pub percent: u32,
    #[serde(default)]
    pub skip_on: SkipOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerraformPlanStageOptions {
    #[serde(default)]
    pub exit_on_no_changes: bool,
    #[serde(default)]
    pub skip_on: SkipOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmptyStageOptions {
    #[serde(default)]
    pub skip_on: SkipOptions,
}

/// Typed `with` block of a pipeline stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOptions {
    Wait(WaitStageOptions),
    WaitApproval(WaitApprovalStageOptions),
    Analysis(AnalysisStageOptions),
    ScriptRun(ScriptRunStageOptions),
    CustomSync(CustomSyncStageOptions),
    CloudRunPromote(PromoteStageOptions),
    LambdaPromote(PromoteStageOptions),
    TerraformPlan(TerraformPlanStageOptions),
    Empty(EmptyStageOptions),
}

impl StageOptions {
    pub fn decode(name: StageName, with: Option<serde_yaml::Value>) -> Result<Self, PipedError> {
        let with = with.unwrap_or(serde_yaml::Value::Mapping(Default::default()));
        let options = match name {
            StageName::Wait => StageOptions::Wait(serde_yaml::from_value(with)?),
            StageName::WaitApproval => StageOptions::WaitApproval(serde_yaml::from_value(with)?),
            StageName::Analysis => StageOptions::Analysis(serde_yaml::from_value(with)?),
            StageName::ScriptRun => StageOptions::ScriptRun(serde_yaml::from_value(with)?),
            StageName::CustomSync => StageOptions::CustomSync(serde_yaml::from_value(with)?),
            StageName::CloudRunPromote => {
                let opts: PromoteStageOptions = serde_yaml::from_value(with)?;
                validate_percent(opts.percent)?;
                StageOptions::CloudRunPromote(opts)
            }
            StageName::LambdaPromote => {
                let opts: PromoteStageOptions = serde_yaml::from_value(with)?;
                validate_percent(opts.percent)?;
                StageOptions::LambdaPromote(opts)
            }
            StageName::TerraformPlan => StageOptions::TerraformPlan(serde_yaml::from_value(with)?),
            _ => StageOptions::Empty(serde_yaml::from_value(with)?),
        };
        if let StageOptions::WaitApproval(opts) = &options {
            if opts.min_approver_num == 0 {
                return Err(PipedError::Config("minApproverNum must be at least 1".to_string()));
            }
        }
        Ok(options)
    }

    pub fn skip_on(&self) -> &SkipOptions {
        match self {
            StageOptions::Wait(o) => &o.skip_on,
            StageOptions::WaitApproval(o) => &o.skip_on,
            StageOptions::Analysis(o) => &o.skip_on,
            StageOptions::ScriptRun(o) => &o.skip_on,
            StageOptions::CustomSync(o) => &o.skip_on,
            StageOptions::CloudRunPromote(o) | StageOptions::LambdaPromote(o) => &o.skip_on,
            StageOptions::TerraformPlan(o) => &o.skip_on,
            StageOptions::Empty(o) => &o.skip_on,
        }
    }
}

fn validate_percent(percent: u32) -> Result<(), PipedError> {
    if percent > 100 {
        return Err(PipedError::Config(format!(
            "percent must be between 0 and 100, got {}",
            percent
        )));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPipelineStage {
    #[serde(default)]
    id: String,
    name: StageName,
    #[serde(default)]
    desc: String,
    #[serde(default, with = "duration::serde_str_opt")]
    timeout: Option<Duration>,
    #[serde(default)]
    with: Option<serde_yaml::Value>,
}

/// A stage declared in the application pipeline
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawPipelineStage")]
pub struct PipelineStageConfig {
    pub id: String,
    pub name: StageName,
    pub desc: String,
    pub timeout: Option<Duration>,
    pub options: StageOptions,
}

impl TryFrom<RawPipelineStage> for PipelineStageConfig {
    type Error = PipedError;

    fn try_from(raw: RawPipelineStage) -> Result<Self, Self::Error> {
        let options = StageOptions::decode(raw.name, raw.with)?;
        Ok(Self {
            id: raw.id,
            name: raw.name,
            desc: raw.desc,
            timeout: raw.timeout,
            options,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub stages: Vec<PipelineStageConfig>,
}

impl PipelineConfig {
    pub fn stage(&self, id: &str) -> Option<&PipelineStageConfig> {
        self.stages.iter().find(|s| s.id == id)
    }

    /// Resolve the configuration of a planned stage. Planned ids are either the
    /// declared id or `stage-{index}`.
    pub fn stage_by_index(&self, index: usize) -> Option<&PipelineStageConfig> {
        self.stages.get(index)
    }
}
