//! The job descriptor: the immutable product of config resolution (C1).

use serde::{Deserialize, Serialize};

/// Dispatch tag for an untrusted- or trusted-tree source strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    /// No source tree is materialized.
    #[default]
    None,
    Git,
    Copy,
    Tarball,
    Hg,
    Svn,
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SourceType::None => "none",
            SourceType::Git => "git",
            SourceType::Copy => "copy",
            SourceType::Tarball => "tarball",
            SourceType::Hg => "hg",
            SourceType::Svn => "svn",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(SourceType::None),
            "git" => Ok(SourceType::Git),
            "copy" => Ok(SourceType::Copy),
            "tarball" => Ok(SourceType::Tarball),
            "hg" => Ok(SourceType::Hg),
            "svn" => Ok(SourceType::Svn),
            other => Err(format!("unknown source type: {other}")),
        }
    }
}

/// Immutable job descriptor produced by the config resolver.
///
/// Every path field is either absent or rooted inside the workspace; every
/// required field is non-empty once `resolve` returns successfully.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub code_dir: String,
    pub job_dir: String,
    pub job_command: String,
    pub runner_image: String,

    /// Inline `KEY=value` block, or a workspace-restricted path to one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_env: Option<String>,

    /// `None` means "mask every non-`REACTORCIDE_*` env value" (the safe
    /// default). `Some(_)`, including `Some(String::new())`, means "mask
    /// exactly this comma-separated list (or file) and nothing else".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secrets_list: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub secrets_file: Option<String>,

    #[serde(default)]
    pub source_type: SourceType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,

    #[serde(default)]
    pub ci_source_type: SourceType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ci_source_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ci_source_ref: Option<String>,

    /// Print the container invocation instead of spawning it.
    #[serde(default)]
    pub dry_run: bool,

    /// Force container execution even without a `runner_image` override.
    #[serde(default)]
    pub container: bool,
}

impl JobDescriptor {
    /// Names of required fields that are currently empty, in a fixed order.
    pub fn missing_required_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.job_command.is_empty() {
            missing.push("job_command");
        }
        if self.runner_image.is_empty() {
            missing.push("runner_image");
        }
        if self.code_dir.is_empty() {
            missing.push("code_dir");
        }
        if self.job_dir.is_empty() {
            missing.push("job_dir");
        }
        missing
    }

    /// Projects the `REACTORCIDE_*` fields back into the container
    /// environment. `job_env` itself is deliberately excluded — only its
    /// parsed `KEY=value` pairs (merged in by the caller) are forwarded, to
    /// avoid double interpretation of the raw block.
    pub fn reactorcide_env(&self) -> std::collections::BTreeMap<String, String> {
        let mut env = std::collections::BTreeMap::new();
        env.insert("REACTORCIDE_CODE_DIR".into(), self.code_dir.clone());
        env.insert("REACTORCIDE_JOB_DIR".into(), self.job_dir.clone());
        env.insert("REACTORCIDE_JOB_COMMAND".into(), self.job_command.clone());
        env.insert("REACTORCIDE_RUNNER_IMAGE".into(), self.runner_image.clone());
        env
    }
}
