//! Core of the dependency-graph releaser: plan model, command state
//! machine, job execution and the release engine.
//!
//! The flow is: an analysed dependency graph arrives as a [`ReleasePlan`]
//! (built directly or decoded from a persisted document), the
//! [`engine::Releaser`] walks it level by level triggering jobs through a
//! [`executor::JobExecutor`], and every state change is persisted through
//! a [`engine::Publisher`] so an interrupted release can be resumed and
//! retriggered.

pub mod codec;
pub mod engine;
pub mod events;
pub mod executor;
pub mod iter;
pub mod plan;
pub mod state;
pub mod types;

pub use engine::{NullPublisher, PlanHandle, Publisher, Releaser};
pub use events::{ReleaseEvent, ReleaseEvents};
pub use executor::{
    JenkinsJobExecutor, JobExecutor, JobTrigger, PollSettings, SimulatingJobExecutor, StartedJob,
    UsernameToken,
};
pub use plan::{PlanError, ReleasePlan, ReleasePlanBuilder};
pub use state::TransitionError;
pub use types::{
    Command, CommandKind, CommandState, ConfigKey, Project, ProjectId, ReleaseState,
};
