//! Shared types for the release plan data model.
//!
//! Everything here is plain data: the graph nodes (projects), the units of
//! work attached to them (commands) and the closed state set each command
//! moves through. The transition rules live in [`crate::state`], the
//! aggregate container in [`crate::plan`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Maven coordinates identifying one project in the dependency graph.
///
/// Equality and ordering define graph identity; dependency sets are
/// `BTreeSet<ProjectId>` so serialized documents stay deterministic.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectId {
    pub group_id: String,
    pub artifact_id: String,
}

impl ProjectId {
    pub fn new(group_id: impl Into<String>, artifact_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            artifact_id: artifact_id.into(),
        }
    }

    /// Canonical `groupId:artifactId` form, used in diagnostics and in the
    /// disable-by-pattern match.
    pub fn identifier(&self) -> String {
        format!("{}:{}", self.group_id, self.artifact_id)
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group_id, self.artifact_id)
    }
}

/// One node of the release plan.
#[derive(Clone, Debug, PartialEq)]
pub struct Project {
    pub id: ProjectId,
    pub current_version: String,
    /// User-editable until execution starts.
    pub release_version: String,
    /// Layer in the dependency DAG; 0 = no unreleased dependencies. A
    /// project's level is strictly less than the level of every project
    /// that depends on it; a submodule inherits its parent's level.
    pub level: u32,
    /// Submodules are grouped under their multi-module parent and never
    /// appear as top-level iteration nodes, but they participate fully in
    /// dependency resolution.
    pub is_submodule: bool,
    /// Executed strictly in declared order.
    pub commands: Vec<Command>,
}

/// One schedulable unit of work on a project.
#[derive(Clone, Debug, PartialEq)]
pub struct Command {
    pub kind: CommandKind,
    pub state: CommandState,
    /// Where the triggered job can be inspected, once known.
    pub build_url: Option<String>,
}

impl Command {
    pub fn new(kind: CommandKind, state: CommandState) -> Self {
        Self {
            kind,
            state,
            build_url: None,
        }
    }

    /// True for the command variants that release a project (as opposed to
    /// bumping a dependency version).
    pub fn is_release(&self) -> bool {
        matches!(
            self.kind,
            CommandKind::ReleaseMavenProject { .. } | CommandKind::ReleaseMultiModuleProject { .. }
        )
    }
}

/// The closed set of command variants. Replaces the runtime-tagged handles
/// of earlier designs with an explicit enumeration.
#[derive(Clone, Debug, PartialEq)]
pub enum CommandKind {
    /// Trigger the release job of a single-module project.
    ReleaseMavenProject { next_dev_version: String },
    /// Trigger the release job of a multi-module parent (covers its
    /// submodules in one job).
    ReleaseMultiModuleProject { next_dev_version: String },
    /// Bump the version of one dependency in this project's manifest.
    UpdateDependency { dependency: ProjectId },
}

impl CommandKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReleaseMavenProject { .. } => "ReleaseMavenProject",
            Self::ReleaseMultiModuleProject { .. } => "ReleaseMultiModuleProject",
            Self::UpdateDependency { .. } => "UpdateDependency",
        }
    }
}

/// Execution state of a single command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandState {
    /// Blocked until the named projects have released.
    Waiting { dependencies: BTreeSet<ProjectId> },
    /// Unblocked, not yet scheduled.
    Ready,
    /// Submitted to the job server, waiting for an executor slot.
    Queueing,
    /// Job confirmed running.
    InProgress,
    /// Terminal success.
    Succeeded,
    /// Terminal failure; the message carries the diagnostic evidence.
    Failed { message: Option<String> },
    /// Failed, then manually reset so the forward chain can run again.
    ReadyToRetrigger,
    /// User opted the command out; reversible, wraps the prior state.
    Deactivated { previous: Box<CommandState> },
    /// Permanently excluded (e.g. matched a disable pattern); irreversible.
    Disabled,
}

impl CommandState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Waiting { .. } => "Waiting",
            Self::Ready => "Ready",
            Self::Queueing => "Queueing",
            Self::InProgress => "InProgress",
            Self::Succeeded => "Succeeded",
            Self::Failed { .. } => "Failed",
            Self::ReadyToRetrigger => "ReadyToRetrigger",
            Self::Deactivated { .. } => "Deactivated",
            Self::Disabled => "Disabled",
        }
    }

    pub fn waiting_on(dependencies: impl IntoIterator<Item = ProjectId>) -> Self {
        Self::Waiting {
            dependencies: dependencies.into_iter().collect(),
        }
    }

    /// A command in one of these states needs no further work: the project
    /// may proceed past it and dependents may treat it as settled.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Deactivated { .. } | Self::Disabled
        )
    }
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waiting { dependencies } => {
                write!(f, "Waiting on {} project(s)", dependencies.len())
            }
            other => f.write_str(other.name()),
        }
    }
}

/// Aggregate state of the whole release, mirrored from the command states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseState {
    Ready,
    InProgress,
    Succeeded,
    Failed,
}

/// Global plan settings keyed by a closed set of names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConfigKey {
    CommitPrefix,
    UpdateDependencyJob,
    RemoteRegex,
    RemoteJob,
    RegexParams,
    JobMapping,
}

impl ConfigKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CommitPrefix => "commitPrefix",
            Self::UpdateDependencyJob => "updateDependencyJob",
            Self::RemoteRegex => "remoteRegex",
            Self::RemoteJob => "remoteJob",
            Self::RegexParams => "regexParams",
            Self::JobMapping => "jobMapping",
        }
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for ConfigKey {
    type Error = String;

    fn try_from(key: &str) -> Result<Self, Self::Error> {
        match key {
            "commitPrefix" => Ok(Self::CommitPrefix),
            "updateDependencyJob" => Ok(Self::UpdateDependencyJob),
            "remoteRegex" => Ok(Self::RemoteRegex),
            "remoteJob" => Ok(Self::RemoteJob),
            "regexParams" => Ok(Self::RegexParams),
            "jobMapping" => Ok(Self::JobMapping),
            other => Err(format!("Unknown config key: {other}")),
        }
    }
}
