//! Command line front end: run, simulate, retrigger and inspect release
//! plans produced by the dependency analyser.

mod publish;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use depgraph_core::{
    codec, JenkinsJobExecutor, NullPublisher, ProjectId, ReleaseEvent, Releaser, ReleaseState,
    SimulatingJobExecutor, UsernameToken,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "depgraph-runner",
    about = "Releases a dependency graph of projects bottom-up via remote jobs"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute the plan against a Jenkins-style job server.
    Run {
        /// Path to the plan document; updated after every state change.
        plan: PathBuf,
        /// Base URL of the job server, e.g. https://ci.example.com
        #[arg(long)]
        job_server_url: String,
        /// Username for basic auth (API token style).
        #[arg(long, requires = "token")]
        user: Option<String>,
        /// API token belonging to --user.
        #[arg(long, requires = "user")]
        token: Option<String>,
    },
    /// Dry-run the plan with simulated jobs; the plan file is not touched.
    Explore {
        plan: PathBuf,
        /// Make the n-th simulated build fail, to inspect failure fallout.
        #[arg(long)]
        fail_on: Option<u64>,
    },
    /// Turn Failed commands back into ReadyToRetrigger and save the plan.
    Retrigger {
        plan: PathBuf,
        /// Restrict to one project, given as groupId:artifactId.
        #[arg(long)]
        project: Option<String>,
    },
    /// Print the plan level by level with each command's state.
    Status { plan: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Commands::Run {
            plan,
            job_server_url,
            user,
            token,
        } => {
            let auth = user.zip(token).map(|(username, token)| UsernameToken {
                username,
                token,
            });
            let executor = JenkinsJobExecutor::new(&job_server_url, auth)?;
            let publisher = Arc::new(publish::FilePublisher::new(plan.clone()));
            let releaser = Releaser::new(Arc::new(executor), publisher, job_server_url);
            run_release(&plan, releaser).await
        }
        Commands::Explore { plan, fail_on } => {
            let executor = match fail_on {
                Some(nth) => SimulatingJobExecutor::failing_on(nth),
                None => SimulatingJobExecutor::new(),
            };
            let releaser = Releaser::new(
                Arc::new(executor),
                Arc::new(NullPublisher),
                "https://simulation.invalid",
            );
            run_release(&plan, releaser).await
        }
        Commands::Retrigger { plan, project } => retrigger(&plan, project).await,
        Commands::Status { plan } => {
            let document = load_plan(&plan).await?;
            print_status(&document);
            Ok(())
        }
    }
}

async fn load_plan(path: &Path) -> anyhow::Result<depgraph_core::ReleasePlan> {
    let json = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("could not read plan from {}", path.display()))?;
    Ok(codec::decode(&json)?)
}

async fn run_release(path: &Path, releaser: Releaser) -> anyhow::Result<()> {
    let plan = load_plan(path).await?;
    info!(
        release_id = %plan.release_id(),
        root = %plan.root_project_id(),
        projects = plan.number_of_projects(),
        "starting release"
    );

    let mut events = releaser.events().subscribe();
    let reporter = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            report(event);
        }
    });

    let finished = releaser.run(plan).await?;
    reporter.abort();

    match finished.state() {
        ReleaseState::Succeeded => {
            info!("release succeeded");
            Ok(())
        }
        state => {
            print_status(&finished);
            bail!("release ended in state {state:?}; see the plan file, then retrigger")
        }
    }
}

fn report(event: ReleaseEvent) {
    match event {
        ReleaseEvent::ReleaseStarted { release_id, .. } => {
            info!(%release_id, "release started");
        }
        ReleaseEvent::CommandTransitioned {
            project,
            command_index,
            state,
        } => {
            info!(%project, command = command_index, %state, "command transitioned");
        }
        ReleaseEvent::ProjectReleased { project } => info!(%project, "released"),
        ReleaseEvent::ProjectFailed { project, message } => {
            tracing::warn!(%project, %message, "failed");
        }
        ReleaseEvent::ReleaseFinished { state, .. } => info!(?state, "release finished"),
    }
}

async fn retrigger(path: &Path, project: Option<String>) -> anyhow::Result<()> {
    let mut plan = load_plan(path).await?;
    let flipped = match project {
        Some(raw) => plan.retrigger_project(&parse_project_id(&raw)?)?,
        None => plan.retrigger_failed_commands()?,
    };
    if flipped == 0 {
        info!("no failed commands to retrigger");
        return Ok(());
    }
    tokio::fs::write(path, codec::encode(&plan)?)
        .await
        .with_context(|| format!("could not write {}", path.display()))?;
    info!(flipped, "commands are ready to retrigger; re-run the plan");
    Ok(())
}

fn parse_project_id(raw: &str) -> anyhow::Result<ProjectId> {
    match raw.split_once(':') {
        Some((group_id, artifact_id)) if !group_id.is_empty() && !artifact_id.is_empty() => {
            Ok(ProjectId::new(group_id, artifact_id))
        }
        _ => bail!("expected groupId:artifactId, got: {raw}"),
    }
}

fn print_status(plan: &depgraph_core::ReleasePlan) {
    println!(
        "release {} of {} ({:?})",
        plan.release_id(),
        plan.root_project_id(),
        plan.state()
    );
    let mut projects = plan.iter_by_level().peeking();
    while let Some(project) = projects.next() {
        println!("level {}", project.level);
        print_project(plan, project, "  ");
        while projects.has_next_on_the_same_level(project.level) {
            if let Some(next) = projects.next() {
                print_project(plan, next, "  ");
            }
        }
    }
}

fn print_project(
    plan: &depgraph_core::ReleasePlan,
    project: &depgraph_core::Project,
    indent: &str,
) {
    println!(
        "{indent}{} {} -> {}",
        project.id, project.current_version, project.release_version
    );
    for command in &project.commands {
        let build = command
            .build_url
            .as_deref()
            .map(|url| format!(" ({url})"))
            .unwrap_or_default();
        println!("{indent}  [{}] {}{build}", command.state, command.kind.name());
    }
    for submodule in plan.submodules_of(&project.id) {
        if let Ok(sub) = plan.project(submodule) {
            print_project(plan, sub, &format!("{indent}  "));
        }
    }
}
