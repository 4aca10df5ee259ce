//! Lifecycle phases and plugin bookkeeping types (C6).

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::descriptor::JobDescriptor;

/// A named point in the run lifecycle at which plugins may act.
///
/// Total order within a run: `PreValidation -> PostValidation ->
/// PreSourcePrep -> PostSourcePrep -> PreContainer -> PostContainer ->
/// OnError (only on failure) -> Cleanup (always)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    PreValidation,
    PostValidation,
    PreSourcePrep,
    PostSourcePrep,
    PreContainer,
    PostContainer,
    OnError,
    Cleanup,
}

impl Phase {
    pub const ALL: [Phase; 8] = [
        Phase::PreValidation,
        Phase::PostValidation,
        Phase::PreSourcePrep,
        Phase::PostSourcePrep,
        Phase::PreContainer,
        Phase::PostContainer,
        Phase::OnError,
        Phase::Cleanup,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Phase::PreValidation => "pre_validation",
            Phase::PostValidation => "post_validation",
            Phase::PreSourcePrep => "pre_source_prep",
            Phase::PostSourcePrep => "post_source_prep",
            Phase::PreContainer => "pre_container",
            Phase::PostContainer => "post_container",
            Phase::OnError => "on_error",
            Phase::Cleanup => "cleanup",
        }
    }
}

/// Bookkeeping record for a registered plugin (not the plugin instance
/// itself — see `reactorcide-plugins` for the loader/dispatcher).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginRecord {
    pub name: String,
    /// Lower runs first. Default 100.
    pub priority: i32,
    pub enabled: bool,
    pub supported_phases: Vec<Phase>,
}

impl PluginRecord {
    pub fn new(name: impl Into<String>, supported_phases: Vec<Phase>) -> Self {
        Self {
            name: name.into(),
            priority: 100,
            enabled: true,
            supported_phases,
        }
    }
}

/// Mutable context threaded through the lifecycle by the orchestrator.
///
/// `metadata` is the sole channel through which plugins communicate between
/// phases (e.g. `resource_limits`, `start_time`, `artifact_path`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginContext {
    pub descriptor: JobDescriptor,
    pub current_phase: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_path: Option<PathBuf>,
    pub env_vars: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl PluginContext {
    pub fn new(descriptor: JobDescriptor) -> Self {
        Self {
            descriptor,
            current_phase: Phase::PreValidation,
            job_path: None,
            env_vars: BTreeMap::new(),
            exit_code: None,
            error: None,
            metadata: BTreeMap::new(),
        }
    }
}
