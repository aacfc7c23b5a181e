//! The release engine: schedules command execution across the plan.
//!
//! One task per runnable project; within a project, commands run strictly
//! in declared order. A project becomes runnable when its first unsettled
//! command is Ready (or ReadyToRetrigger), which by construction only
//! happens after everything it waits on has released. A failure stops its
//! own branch and nothing else: dependents simply keep Waiting and the run
//! drains the remaining independent branches.
//!
//! Every state change goes through [`PlanHandle`]: validate against the
//! machine, mutate under the lock, snapshot, then persist and notify with
//! the lock released.

use crate::events::{ReleaseEvent, ReleaseEvents};
use crate::executor::{JobExecutor, JobTrigger};
use crate::plan::{PlanError, ReleasePlan};
use crate::types::{Command, CommandKind, CommandState, ConfigKey, Project, ProjectId};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("Failed to persist the release plan")]
    Publish(#[source] anyhow::Error),

    #[error("A scheduled project task was cancelled or panicked")]
    Join(#[from] tokio::task::JoinError),
}

/// Persistence seam: called with a consistent snapshot after every plan
/// mutation.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, plan: &ReleasePlan) -> anyhow::Result<()>;
}

/// Publisher for runs that nobody needs to resume (tests, exploration).
pub struct NullPublisher;

#[async_trait]
impl Publisher for NullPublisher {
    async fn publish(&self, _plan: &ReleasePlan) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Shared, mutation-serializing access to the plan during a run.
#[derive(Clone)]
pub struct PlanHandle {
    plan: Arc<Mutex<ReleasePlan>>,
    publisher: Arc<dyn Publisher>,
    events: ReleaseEvents,
}

impl PlanHandle {
    pub fn new(plan: ReleasePlan, publisher: Arc<dyn Publisher>, events: ReleaseEvents) -> Self {
        Self {
            plan: Arc::new(Mutex::new(plan)),
            publisher,
            events,
        }
    }

    pub async fn snapshot(&self) -> ReleasePlan {
        self.plan.lock().await.clone()
    }

    /// Apply one validated transition, persist the result, notify.
    pub async fn transition(
        &self,
        id: &ProjectId,
        index: usize,
        next: CommandState,
    ) -> Result<(), EngineError> {
        let snapshot = {
            let mut plan = self.plan.lock().await;
            plan.transition_command(id, index, next.clone())?;
            plan.clone()
        };
        self.publish(&snapshot).await?;
        self.events.emit(ReleaseEvent::CommandTransitioned {
            project: id.clone(),
            command_index: index,
            state: next,
        });
        Ok(())
    }

    pub async fn record_build_url(
        &self,
        id: &ProjectId,
        index: usize,
        build_url: String,
    ) -> Result<(), EngineError> {
        let snapshot = {
            let mut plan = self.plan.lock().await;
            plan.set_build_url(id, index, build_url)?;
            plan.clone()
        };
        self.publish(&snapshot).await
    }

    /// Propagate a fully released project into its dependents' Waiting
    /// sets; emits a transition event for every command that became Ready.
    pub async fn mark_released(&self, id: &ProjectId) -> Result<(), EngineError> {
        let (promoted, snapshot) = {
            let mut plan = self.plan.lock().await;
            let promoted = plan.mark_project_released(id)?;
            (promoted, plan.clone())
        };
        self.publish(&snapshot).await?;
        self.events.emit(ReleaseEvent::ProjectReleased { project: id.clone() });
        for (project, command_index) in promoted {
            self.events.emit(ReleaseEvent::CommandTransitioned {
                project,
                command_index,
                state: CommandState::Ready,
            });
        }
        Ok(())
    }

    async fn publish(&self, snapshot: &ReleasePlan) -> Result<(), EngineError> {
        self.publisher
            .publish(snapshot)
            .await
            .map_err(EngineError::Publish)
    }
}

enum ProjectOutcome {
    /// Every command settled; dependents may be unblocked.
    Succeeded,
    /// Stopped at a command still Waiting on another project.
    Blocked,
    /// A command failed; the branch below this project stays untouched.
    Failed { message: String },
}

/// Drives one plan from its current state to a terminal state.
pub struct Releaser {
    executor: Arc<dyn JobExecutor>,
    publisher: Arc<dyn Publisher>,
    events: ReleaseEvents,
    job_server_url: String,
}

impl Releaser {
    pub fn new(
        executor: Arc<dyn JobExecutor>,
        publisher: Arc<dyn Publisher>,
        job_server_url: impl Into<String>,
    ) -> Self {
        let mut job_server_url = job_server_url.into();
        if !job_server_url.ends_with('/') {
            job_server_url.push('/');
        }
        Self {
            executor,
            publisher,
            events: ReleaseEvents::default(),
            job_server_url,
        }
    }

    pub fn events(&self) -> &ReleaseEvents {
        &self.events
    }

    /// Run the plan to completion. Commands a previous run left mid-flight
    /// (Queueing, InProgress) are first recorded as Failed, then every
    /// Failed command is turned into ReadyToRetrigger, so re-running a
    /// half-failed or interrupted plan resumes where it stopped.
    pub async fn run(&self, mut plan: ReleasePlan) -> Result<ReleasePlan, EngineError> {
        plan.verify_coverage()?;
        let interrupted = plan.fail_interrupted_commands()?;
        if interrupted > 0 {
            info!(
                interrupted,
                "recorded commands left mid-flight by a previous run as failed"
            );
        }
        let retriggered = plan.retrigger_failed_commands()?;
        if retriggered > 0 {
            info!(retriggered, "reset failed commands for retriggering");
        }

        let release_id = plan.release_id();
        self.events.emit(ReleaseEvent::ReleaseStarted {
            release_id,
            root_project: plan.root_project_id().clone(),
        });

        let handle = PlanHandle::new(plan, self.publisher.clone(), self.events.clone());
        let mut active: BTreeSet<ProjectId> = BTreeSet::new();
        let mut finished: BTreeSet<ProjectId> = BTreeSet::new();
        let mut tasks: JoinSet<Result<(ProjectId, ProjectOutcome), EngineError>> = JoinSet::new();

        loop {
            // Projects that are fully settled without having run (every
            // command Deactivated or Disabled, or already Succeeded in a
            // resumed document) never get a task, but their dependents must
            // still be unblocked. Marking may cascade, hence the loop.
            loop {
                let snapshot = handle.snapshot().await;
                let settled: Vec<ProjectId> = snapshot
                    .projects()
                    .filter(|p| {
                        !finished.contains(&p.id)
                            && !active.contains(&p.id)
                            && p.commands.iter().all(|c| c.state.is_settled())
                    })
                    .map(|p| p.id.clone())
                    .collect();
                if settled.is_empty() {
                    break;
                }
                for id in settled {
                    finished.insert(id.clone());
                    handle.mark_released(&id).await?;
                }
            }

            let snapshot = handle.snapshot().await;
            for project in snapshot.projects() {
                if active.contains(&project.id)
                    || finished.contains(&project.id)
                    || !is_runnable(project)
                {
                    continue;
                }
                active.insert(project.id.clone());
                let handle = handle.clone();
                let executor = self.executor.clone();
                let job_server_url = self.job_server_url.clone();
                let id = project.id.clone();
                tasks.spawn(async move {
                    let outcome =
                        run_project(&handle, executor.as_ref(), &job_server_url, &id).await?;
                    Ok((id, outcome))
                });
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            let (id, outcome) = joined??;
            active.remove(&id);
            match outcome {
                ProjectOutcome::Succeeded => {
                    info!(project = %id, "project released");
                    finished.insert(id.clone());
                    handle.mark_released(&id).await?;
                }
                ProjectOutcome::Blocked => {
                    // Back into the pool; re-examined once a dependency
                    // releases.
                }
                ProjectOutcome::Failed { message } => {
                    warn!(project = %id, %message, "project failed; dependents stay waiting");
                    finished.insert(id.clone());
                    self.events.emit(ReleaseEvent::ProjectFailed {
                        project: id,
                        message,
                    });
                }
            }
        }

        let final_plan = handle.snapshot().await;
        self.events.emit(ReleaseEvent::ReleaseFinished {
            release_id,
            state: final_plan.state(),
        });
        Ok(final_plan)
    }
}

/// A project may be scheduled when its first unsettled command can be
/// executed right away.
fn is_runnable(project: &Project) -> bool {
    project
        .commands
        .iter()
        .find(|c| !c.state.is_settled())
        .is_some_and(|c| {
            matches!(
                c.state,
                CommandState::Ready | CommandState::ReadyToRetrigger
            )
        })
}

/// Execute one project's commands in order until all are settled or one
/// cannot proceed.
async fn run_project(
    handle: &PlanHandle,
    executor: &dyn JobExecutor,
    job_server_url: &str,
    id: &ProjectId,
) -> Result<ProjectOutcome, EngineError> {
    loop {
        let snapshot = handle.snapshot().await;
        let project = snapshot.project(id)?;
        let Some((index, command)) = project
            .commands
            .iter()
            .enumerate()
            .find(|(_, c)| !c.state.is_settled())
        else {
            return Ok(ProjectOutcome::Succeeded);
        };

        match &command.state {
            CommandState::ReadyToRetrigger => {
                handle.transition(id, index, CommandState::Ready).await?;
            }
            CommandState::Ready => {
                let trigger = build_trigger(&snapshot, project, command, job_server_url)?;
                if let Some(failed) =
                    execute_command(handle, executor, id, index, trigger).await?
                {
                    return Ok(failed);
                }
            }
            CommandState::Waiting { .. } => return Ok(ProjectOutcome::Blocked),
            CommandState::Failed { message } => {
                return Ok(ProjectOutcome::Failed {
                    message: message.clone().unwrap_or_else(|| "job failed".into()),
                });
            }
            // Settled states are filtered out above; mid-flight states are
            // converted to Failed before anything is scheduled.
            CommandState::Queueing | CommandState::InProgress => {
                unreachable!("mid-flight command selected for execution")
            }
            CommandState::Succeeded
            | CommandState::Deactivated { .. }
            | CommandState::Disabled => {
                unreachable!("settled command selected for execution")
            }
        }
    }
}

/// Walk the command through Queueing, InProgress and its terminal state.
/// Returns the failure outcome if the job did not succeed.
async fn execute_command(
    handle: &PlanHandle,
    executor: &dyn JobExecutor,
    id: &ProjectId,
    index: usize,
    trigger: JobTrigger,
) -> Result<Option<ProjectOutcome>, EngineError> {
    handle.transition(id, index, CommandState::Queueing).await?;

    let started = match executor.start_job(&trigger).await {
        Ok(started) => started,
        Err(err) => return fail_command(handle, id, index, err.to_string()).await,
    };
    handle
        .record_build_url(id, index, started.build_url.clone())
        .await?;
    handle
        .transition(id, index, CommandState::InProgress)
        .await?;

    match executor.await_completion(&started).await {
        Ok(()) => {
            handle
                .transition(id, index, CommandState::Succeeded)
                .await?;
            Ok(None)
        }
        Err(err) => fail_command(handle, id, index, err.to_string()).await,
    }
}

async fn fail_command(
    handle: &PlanHandle,
    id: &ProjectId,
    index: usize,
    message: String,
) -> Result<Option<ProjectOutcome>, EngineError> {
    handle
        .transition(
            id,
            index,
            CommandState::Failed {
                message: Some(message.clone()),
            },
        )
        .await?;
    Ok(Some(ProjectOutcome::Failed { message }))
}

/// Resolve the job and parameters for one command. Release jobs default to
/// the artifact id and can be remapped per project through the jobMapping
/// config; dependency bumps go to one shared updater job.
fn build_trigger(
    plan: &ReleasePlan,
    project: &Project,
    command: &Command,
    job_server_url: &str,
) -> Result<JobTrigger, PlanError> {
    let mut parameters = BTreeMap::new();
    let job_name = match &command.kind {
        CommandKind::ReleaseMavenProject { next_dev_version }
        | CommandKind::ReleaseMultiModuleProject { next_dev_version } => {
            parameters.insert("releaseVersion".to_owned(), project.release_version.clone());
            parameters.insert("nextDevVersion".to_owned(), next_dev_version.clone());
            mapped_job_name(plan, &project.id)
        }
        CommandKind::UpdateDependency { dependency } => {
            let released = plan.project(dependency)?;
            parameters.insert("projectId".to_owned(), project.id.identifier());
            parameters.insert("groupId".to_owned(), dependency.group_id.clone());
            parameters.insert("artifactId".to_owned(), dependency.artifact_id.clone());
            parameters.insert("newVersion".to_owned(), released.release_version.clone());
            if let Some(prefix) = plan.config_value(ConfigKey::CommitPrefix) {
                parameters.insert("commitPrefix".to_owned(), prefix.to_owned());
            }
            plan.config_value(ConfigKey::UpdateDependencyJob)
                .unwrap_or("update-dependency")
                .to_owned()
        }
    };
    Ok(JobTrigger {
        job_url: format!("{job_server_url}job/{job_name}/"),
        parameters,
    })
}

/// jobMapping entries are newline-separated `groupId:artifactId=jobName`
/// pairs; unmapped projects use their artifact id.
fn mapped_job_name(plan: &ReleasePlan, id: &ProjectId) -> String {
    let identifier = id.identifier();
    plan.config_value(ConfigKey::JobMapping)
        .and_then(|mapping| {
            mapping.lines().find_map(|line| {
                let (key, job) = line.split_once('=')?;
                (key.trim() == identifier).then(|| job.trim().to_owned())
            })
        })
        .unwrap_or_else(|| id.artifact_id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::SimulatingJobExecutor;
    use crate::plan::ReleasePlanBuilder;
    use crate::types::ReleaseState;
    use tokio::sync::broadcast::error::TryRecvError;

    fn id(artifact: &str) -> ProjectId {
        ProjectId::new("com.example", artifact)
    }

    fn release_command(waiting_on: &[&str]) -> Command {
        let state = if waiting_on.is_empty() {
            CommandState::Ready
        } else {
            CommandState::waiting_on(waiting_on.iter().map(|a| id(a)))
        };
        Command::new(
            CommandKind::ReleaseMavenProject {
                next_dev_version: "1.1.0-SNAPSHOT".into(),
            },
            state,
        )
    }

    fn chain_plan() -> ReleasePlan {
        ReleasePlanBuilder::new(id("a"))
            .project(id("a"), "1.0.0", "1.0.1", vec![release_command(&[])])
            .project(id("b"), "2.0.0", "2.0.1", vec![release_command(&["a"])])
            .project(id("c"), "3.0.0", "3.0.1", vec![release_command(&["b"])])
            .build()
            .unwrap()
    }

    struct CountingPublisher {
        snapshots: std::sync::Mutex<Vec<ReleaseState>>,
    }

    #[async_trait]
    impl Publisher for CountingPublisher {
        async fn publish(&self, plan: &ReleasePlan) -> anyhow::Result<()> {
            self.snapshots.lock().unwrap().push(plan.state());
            Ok(())
        }
    }

    fn drain_released(
        rx: &mut tokio::sync::broadcast::Receiver<ReleaseEvent>,
    ) -> Vec<ProjectId> {
        let mut released = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(ReleaseEvent::ProjectReleased { project }) => released.push(project),
                Ok(_) => {}
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return released,
                Err(TryRecvError::Lagged(_)) => {}
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_chain_releases_in_dependency_order() {
        let releaser = Releaser::new(
            Arc::new(SimulatingJobExecutor::new()),
            Arc::new(NullPublisher),
            "https://ci.example.com",
        );
        let mut rx = releaser.events().subscribe();

        let finished = releaser.run(chain_plan()).await.unwrap();
        assert_eq!(finished.state(), ReleaseState::Succeeded);
        for project in [id("a"), id("b"), id("c")] {
            assert_eq!(
                finished.command_state(&project, 0).unwrap(),
                &CommandState::Succeeded
            );
        }

        assert_eq!(drain_released(&mut rx), vec![id("a"), id("b"), id("c")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_isolates_the_branch() {
        // a fails; b waits on a and must stay Waiting. d is independent
        // and still releases.
        let plan = ReleasePlanBuilder::new(id("a"))
            .project(id("a"), "1.0.0", "1.0.1", vec![release_command(&[])])
            .project(id("b"), "2.0.0", "2.0.1", vec![release_command(&["a"])])
            .project(id("d"), "4.0.0", "4.0.1", vec![release_command(&[])])
            .build()
            .unwrap();

        // The simulator fails the first awaited build. The scan order is
        // deterministic (BTreeMap), so a is triggered first.
        let releaser = Releaser::new(
            Arc::new(SimulatingJobExecutor::failing_on(1)),
            Arc::new(NullPublisher),
            "https://ci.example.com",
        );
        let finished = releaser.run(plan).await.unwrap();

        assert_eq!(finished.state(), ReleaseState::Failed);
        assert!(matches!(
            finished.command_state(&id("a"), 0).unwrap(),
            CommandState::Failed { message: Some(_) }
        ));
        assert!(matches!(
            finished.command_state(&id("b"), 0).unwrap(),
            CommandState::Waiting { .. }
        ));
        assert_eq!(
            finished.command_state(&id("d"), 0).unwrap(),
            &CommandState::Succeeded
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rerun_retriggers_failed_commands() {
        let failing = Releaser::new(
            Arc::new(SimulatingJobExecutor::failing_on(1)),
            Arc::new(NullPublisher),
            "https://ci.example.com",
        );
        let failed = failing.run(chain_plan()).await.unwrap();
        assert_eq!(failed.state(), ReleaseState::Failed);

        let retry = Releaser::new(
            Arc::new(SimulatingJobExecutor::new()),
            Arc::new(NullPublisher),
            "https://ci.example.com",
        );
        let finished = retry.run(failed).await.unwrap();
        assert_eq!(finished.state(), ReleaseState::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publisher_sees_every_mutation() {
        let publisher = Arc::new(CountingPublisher {
            snapshots: std::sync::Mutex::new(Vec::new()),
        });
        let releaser = Releaser::new(
            Arc::new(SimulatingJobExecutor::new()),
            publisher.clone(),
            "https://ci.example.com",
        );
        releaser.run(chain_plan()).await.unwrap();

        let snapshots = publisher.snapshots.lock().unwrap();
        // Per command: Queueing, build url, InProgress, Succeeded; plus one
        // snapshot per released project.
        assert_eq!(snapshots.len(), 3 * 4 + 3);
        assert_eq!(*snapshots.last().unwrap(), ReleaseState::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deactivated_commands_are_skipped() {
        let mut plan = ReleasePlanBuilder::new(id("a"))
            .project(id("a"), "1.0.0", "1.0.1", vec![release_command(&[])])
            .project(id("b"), "2.0.0", "2.0.1", vec![release_command(&["a"])])
            .build()
            .unwrap();
        plan.transition_command(
            &id("b"),
            0,
            CommandState::Deactivated {
                previous: Box::new(CommandState::waiting_on([id("a")])),
            },
        )
        .unwrap();

        let releaser = Releaser::new(
            Arc::new(SimulatingJobExecutor::new()),
            Arc::new(NullPublisher),
            "https://ci.example.com",
        );
        let finished = releaser.run(plan).await.unwrap();

        assert_eq!(finished.state(), ReleaseState::Succeeded);
        assert!(matches!(
            finished.command_state(&id("b"), 0).unwrap(),
            CommandState::Deactivated { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resumes_a_plan_interrupted_mid_flight() {
        // A crash persists the document with the active command still
        // Queueing or InProgress. Re-running must drive it to completion.
        let mut plan = chain_plan();
        plan.transition_command(&id("a"), 0, CommandState::Queueing)
            .unwrap();
        let resumed = crate::codec::decode(&crate::codec::encode(&plan).unwrap()).unwrap();
        assert_eq!(resumed.state(), ReleaseState::InProgress);

        let releaser = Releaser::new(
            Arc::new(SimulatingJobExecutor::new()),
            Arc::new(NullPublisher),
            "https://ci.example.com",
        );
        let finished = releaser.run(resumed).await.unwrap();

        assert_eq!(finished.state(), ReleaseState::Succeeded);
        for project in [id("a"), id("b"), id("c")] {
            assert_eq!(
                finished.command_state(&project, 0).unwrap(),
                &CommandState::Succeeded
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dependents_of_fully_disabled_projects_proceed() {
        // a's release command is Disabled; b waits on a. b must still be
        // unblocked and released.
        let plan = ReleasePlanBuilder::new(id("a"))
            .project(id("a"), "1.0.0", "1.0.1", vec![release_command(&[])])
            .project(id("b"), "2.0.0", "2.0.1", vec![release_command(&["a"])])
            .disable_release_for(regex::Regex::new(r"com\.example:a").unwrap())
            .build()
            .unwrap();

        let releaser = Releaser::new(
            Arc::new(SimulatingJobExecutor::new()),
            Arc::new(NullPublisher),
            "https://ci.example.com",
        );
        let finished = releaser.run(plan).await.unwrap();

        assert_eq!(finished.state(), ReleaseState::Succeeded);
        assert_eq!(
            finished.command_state(&id("a"), 0).unwrap(),
            &CommandState::Disabled
        );
        assert_eq!(
            finished.command_state(&id("b"), 0).unwrap(),
            &CommandState::Succeeded
        );
    }

    #[test]
    fn test_job_name_mapping_and_trigger_parameters() {
        let plan = ReleasePlanBuilder::new(id("a"))
            .project(id("a"), "1.0.0", "1.0.1", vec![release_command(&[])])
            .project(
                id("b"),
                "2.0.0",
                "2.0.1",
                vec![Command::new(
                    CommandKind::UpdateDependency {
                        dependency: id("a"),
                    },
                    CommandState::waiting_on([id("a")]),
                )],
            )
            .config(
                ConfigKey::JobMapping,
                "com.example:a=special-release-job\ncom.example:x=other",
            )
            .config(ConfigKey::UpdateDependencyJob, "bump-dependency")
            .config(ConfigKey::CommitPrefix, "[RELEASE]")
            .build()
            .unwrap();

        let a = plan.project(&id("a")).unwrap();
        let trigger =
            build_trigger(&plan, a, &a.commands[0], "https://ci.example.com/").unwrap();
        assert_eq!(
            trigger.job_url,
            "https://ci.example.com/job/special-release-job/"
        );
        assert_eq!(trigger.parameters["releaseVersion"], "1.0.1");
        assert_eq!(trigger.parameters["nextDevVersion"], "1.1.0-SNAPSHOT");

        let b = plan.project(&id("b")).unwrap();
        let trigger =
            build_trigger(&plan, b, &b.commands[0], "https://ci.example.com/").unwrap();
        assert_eq!(
            trigger.job_url,
            "https://ci.example.com/job/bump-dependency/"
        );
        assert_eq!(trigger.parameters["groupId"], "com.example");
        assert_eq!(trigger.parameters["artifactId"], "a");
        assert_eq!(trigger.parameters["newVersion"], "1.0.1");
        assert_eq!(trigger.parameters["commitPrefix"], "[RELEASE]");
    }
}
