//! Job-definition, event, and trigger types shared by C10 and C11.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::descriptor::SourceType;

/// The closed set of VCS event kinds the evaluator understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Push,
    PullRequestOpened,
    PullRequestUpdated,
    PullRequestMerged,
    PullRequestClosed,
    TagCreated,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::Push,
        EventKind::PullRequestOpened,
        EventKind::PullRequestUpdated,
        EventKind::PullRequestMerged,
        EventKind::PullRequestClosed,
        EventKind::TagCreated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Push => "push",
            EventKind::PullRequestOpened => "pull_request_opened",
            EventKind::PullRequestUpdated => "pull_request_updated",
            EventKind::PullRequestMerged => "pull_request_merged",
            EventKind::PullRequestClosed => "pull_request_closed",
            EventKind::TagCreated => "tag_created",
        }
    }

    pub fn is_pull_request(&self) -> bool {
        matches!(
            self,
            EventKind::PullRequestOpened
                | EventKind::PullRequestUpdated
                | EventKind::PullRequestMerged
                | EventKind::PullRequestClosed
        )
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown event type: {s}"))
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The VCS event an `eval` run is matched against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventContext {
    pub event_type: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ci_source_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ci_source_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_base_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
}

/// `triggers:` block of a job definition file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggersSpec {
    #[serde(default)]
    pub events: Vec<EventKind>,
    #[serde(default)]
    pub branches: Vec<String>,
}

/// `paths:` block of a job definition file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathsSpec {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// `job:` block of a job definition file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default, with = "humantime_serde::option")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub raw_command: Option<bool>,
}

/// A parsed `.reactorcide/jobs/*.yml` job definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub triggers: TriggersSpec,
    #[serde(default)]
    pub paths: PathsSpec,
    #[serde(default)]
    pub job: JobSpec,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Not part of the YAML document — stamped in by the loader.
    #[serde(skip)]
    pub source_file: PathBuf,
}

/// `condition` a trigger is scheduled under relative to its `depends_on` set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerCondition {
    AllSuccess,
    AnySuccess,
    Always,
}

impl Default for TriggerCondition {
    fn default() -> Self {
        TriggerCondition::AllSuccess
    }
}

/// A `JobDefinition` x `EventContext` projection: a request for a follow-up
/// job, ready to be queued by C10 and serialized into the triggers file or
/// POSTed to the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTrigger {
    pub job_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    pub condition: TriggerCondition,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<SourceType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci_source_type: Option<SourceType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ci_source_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ci_source_ref: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "humantime_serde::option")]
    pub timeout: Option<Duration>,
}

impl JobTrigger {
    pub fn new(job_name: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            depends_on: Vec::new(),
            condition: TriggerCondition::AllSuccess,
            env: BTreeMap::new(),
            source_type: None,
            source_url: None,
            source_ref: None,
            ci_source_type: None,
            ci_source_url: None,
            ci_source_ref: None,
            container_image: None,
            job_command: None,
            priority: None,
            timeout: None,
        }
    }
}

/// On-disk / on-wire shape of the triggers file and the coordinator POST
/// body: `{"type": "trigger_job", "jobs": [...]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggersFile {
    #[serde(rename = "type")]
    pub kind: TriggersFileKind,
    pub jobs: Vec<JobTrigger>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggersFileKind {
    #[serde(rename = "trigger_job")]
    TriggerJob,
}

impl TriggersFile {
    pub fn new(jobs: Vec<JobTrigger>) -> Self {
        Self {
            kind: TriggersFileKind::TriggerJob,
            jobs,
        }
    }
}
