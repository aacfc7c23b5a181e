//! The release plan: a leveled dependency DAG of projects and their
//! commands.
//!
//! A plan is constructed once (by the external analyser, through
//! [`ReleasePlanBuilder`], or by decoding a persisted document) and then
//! mutated in place by the release engine, one command state at a time.
//! All mutation goes through the methods here so the state machine is
//! consulted on every change and the aggregate [`ReleaseState`] stays
//! consistent.

use crate::iter::LevelIterator;
use crate::state::TransitionError;
use crate::types::{Command, CommandState, ConfigKey, Project, ProjectId, ReleaseState};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("Project {id} was added twice")]
    DuplicateProject { id: ProjectId },

    #[error("Unknown project: {id}")]
    UnknownProject { id: ProjectId },

    #[error("Project {required_by} waits on {dependency}, which is not part of the plan")]
    UnknownDependency {
        dependency: ProjectId,
        required_by: ProjectId,
    },

    #[error("Project {id} has no command at index {index}")]
    CommandIndexOutOfRange { id: ProjectId, index: usize },

    #[error("The dependency relation contains a cycle involving {involving}")]
    DependencyCycle { involving: ProjectId },

    #[error(
        "Submodule {submodule} refers to parent {parent}, which is not part of the plan"
    )]
    SubmoduleParentMissing {
        parent: ProjectId,
        submodule: ProjectId,
    },

    #[error(
        "Command {index} of {id} starts in state {state}; \
         a fresh plan may only contain Waiting, Ready or Disabled commands"
    )]
    IllegalInitialState {
        id: ProjectId,
        index: usize,
        state: String,
    },

    #[error(
        "Not all projects reachable from the root are covered by the \
         top-level iteration and submodule groups; left out: {missing}. \
         This is a bug in the plan construction, please report it"
    )]
    MissingProjects { missing: String },

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// The full dependency-ordered release specification for a root project
/// and its transitive dependents.
#[derive(Debug, Clone, PartialEq)]
pub struct ReleasePlan {
    release_id: Uuid,
    root_project_id: ProjectId,
    projects: BTreeMap<ProjectId, Project>,
    /// Multi-module parent -> ordered direct submodules.
    submodules: BTreeMap<ProjectId, Vec<ProjectId>>,
    /// Derived from the commands' Waiting sets: who is blocked by whom.
    dependents: BTreeMap<ProjectId, BTreeSet<ProjectId>>,
    config: BTreeMap<ConfigKey, String>,
    warnings: Vec<String>,
    infos: Vec<String>,
    state: ReleaseState,
}

impl ReleasePlan {
    /// Assemble a plan from already-leveled parts (the codec's entry
    /// point). Re-derives the dependent adjacency and re-checks the
    /// structural invariants, but accepts mid-flight command states.
    pub(crate) fn from_parts(
        release_id: Uuid,
        root_project_id: ProjectId,
        projects: BTreeMap<ProjectId, Project>,
        submodules: BTreeMap<ProjectId, Vec<ProjectId>>,
        config: BTreeMap<ConfigKey, String>,
        warnings: Vec<String>,
        infos: Vec<String>,
        state: ReleaseState,
    ) -> Result<Self, PlanError> {
        if !projects.contains_key(&root_project_id) {
            return Err(PlanError::UnknownProject {
                id: root_project_id,
            });
        }
        for (parent, children) in &submodules {
            for child in std::iter::once(parent).chain(children) {
                if !projects.contains_key(child) {
                    return Err(PlanError::SubmoduleParentMissing {
                        parent: parent.clone(),
                        submodule: child.clone(),
                    });
                }
            }
        }

        let dependents = derive_dependents(&projects)?;
        let plan = Self {
            release_id,
            root_project_id,
            projects,
            submodules,
            dependents,
            config,
            warnings,
            infos,
            state,
        };
        plan.verify_coverage()?;
        Ok(plan)
    }

    pub fn release_id(&self) -> Uuid {
        self.release_id
    }

    pub fn root_project_id(&self) -> &ProjectId {
        &self.root_project_id
    }

    pub fn project(&self, id: &ProjectId) -> Result<&Project, PlanError> {
        self.projects
            .get(id)
            .ok_or_else(|| PlanError::UnknownProject { id: id.clone() })
    }

    pub fn projects(&self) -> impl Iterator<Item = &Project> {
        self.projects.values()
    }

    pub fn project_ids(&self) -> impl Iterator<Item = &ProjectId> {
        self.projects.keys()
    }

    pub fn number_of_projects(&self) -> usize {
        self.projects.len()
    }

    /// Direct submodules of a multi-module parent, in declaration order.
    pub fn submodules_of(&self, parent: &ProjectId) -> &[ProjectId] {
        self.submodules.get(parent).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_submodules(&self, parent: &ProjectId) -> bool {
        !self.submodules_of(parent).is_empty()
    }

    /// Projects whose commands wait on `id`.
    pub fn dependents_of(&self, id: &ProjectId) -> impl Iterator<Item = &ProjectId> {
        self.dependents.get(id).into_iter().flatten()
    }

    pub fn config(&self) -> &BTreeMap<ConfigKey, String> {
        &self.config
    }

    pub fn config_value(&self, key: ConfigKey) -> Option<&str> {
        self.config.get(&key).map(String::as_str)
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn infos(&self) -> &[String] {
        &self.infos
    }

    pub fn state(&self) -> ReleaseState {
        self.state
    }

    /// Non-submodule projects in non-decreasing level order. Submodules are
    /// reached through [`Self::submodules_of`].
    pub fn iter_by_level(&self) -> LevelIterator<'_> {
        LevelIterator::new(self.projects.values())
    }

    /// Every project must be reachable either as a top-level iteration node
    /// or through some parent's submodule list. A violation is a
    /// construction bug and must never be silently skipped.
    pub fn verify_coverage(&self) -> Result<(), PlanError> {
        let mut covered: BTreeSet<&ProjectId> = self
            .projects
            .values()
            .filter(|p| !p.is_submodule)
            .map(|p| &p.id)
            .collect();
        covered.extend(self.submodules.values().flatten());

        let missing: Vec<String> = self
            .projects
            .keys()
            .filter(|id| !covered.contains(id))
            .map(|id| id.identifier())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(PlanError::MissingProjects {
                missing: missing.join(", "),
            })
        }
    }

    pub fn command_state(&self, id: &ProjectId, index: usize) -> Result<&CommandState, PlanError> {
        let project = self.project(id)?;
        project
            .commands
            .get(index)
            .map(|c| &c.state)
            .ok_or_else(|| PlanError::CommandIndexOutOfRange {
                id: id.clone(),
                index,
            })
    }

    /// Apply one validated state transition and refresh the aggregate
    /// release state.
    pub fn transition_command(
        &mut self,
        id: &ProjectId,
        index: usize,
        next: CommandState,
    ) -> Result<(), PlanError> {
        let project = self
            .projects
            .get_mut(id)
            .ok_or_else(|| PlanError::UnknownProject { id: id.clone() })?;
        let command =
            project
                .commands
                .get_mut(index)
                .ok_or_else(|| PlanError::CommandIndexOutOfRange {
                    id: id.clone(),
                    index,
                })?;
        command.set_state(next)?;
        self.state = self.compute_state();
        Ok(())
    }

    pub fn set_build_url(
        &mut self,
        id: &ProjectId,
        index: usize,
        build_url: String,
    ) -> Result<(), PlanError> {
        let project = self
            .projects
            .get_mut(id)
            .ok_or_else(|| PlanError::UnknownProject { id: id.clone() })?;
        let command =
            project
                .commands
                .get_mut(index)
                .ok_or_else(|| PlanError::CommandIndexOutOfRange {
                    id: id.clone(),
                    index,
                })?;
        command.build_url = Some(build_url);
        Ok(())
    }

    /// Record that `released` has fully released: drop it from every
    /// dependent command's Waiting set and promote drained Waiting states
    /// to Ready. Returns the commands that became Ready.
    ///
    /// Waiting sets wrapped inside Deactivated are drained too, so a later
    /// reactivation restores a state that reflects reality; the wrapped
    /// state is not promoted.
    pub fn mark_project_released(
        &mut self,
        released: &ProjectId,
    ) -> Result<Vec<(ProjectId, usize)>, PlanError> {
        let dependents: Vec<ProjectId> = self.dependents_of(released).cloned().collect();
        let mut promoted = Vec::new();

        for dependent in dependents {
            let project = self
                .projects
                .get_mut(&dependent)
                .ok_or_else(|| PlanError::UnknownProject {
                    id: dependent.clone(),
                })?;
            for (index, command) in project.commands.iter_mut().enumerate() {
                match &mut command.state {
                    CommandState::Waiting { dependencies } => {
                        if dependencies.remove(released) && dependencies.is_empty() {
                            command.set_state(CommandState::Ready)?;
                            promoted.push((dependent.clone(), index));
                        }
                    }
                    CommandState::Deactivated { previous } => {
                        if let CommandState::Waiting { dependencies } = previous.as_mut() {
                            dependencies.remove(released);
                        }
                    }
                    _ => {}
                }
            }
        }

        self.state = self.compute_state();
        Ok(promoted)
    }

    /// Record commands left Queueing or InProgress by an interrupted run
    /// as Failed, so the retrigger path can pick them up. The run that
    /// triggered them is gone and their builds cannot be re-attached.
    /// Returns how many commands were flipped.
    pub fn fail_interrupted_commands(&mut self) -> Result<usize, PlanError> {
        let mut flipped = 0;
        for project in self.projects.values_mut() {
            for command in &mut project.commands {
                if matches!(
                    command.state,
                    CommandState::Queueing | CommandState::InProgress
                ) {
                    command.set_state(CommandState::Failed {
                        message: Some("interrupted in a previous run".into()),
                    })?;
                    flipped += 1;
                }
            }
        }
        if flipped > 0 {
            self.state = self.compute_state();
        }
        Ok(flipped)
    }

    /// Flip every Failed command back to ReadyToRetrigger. Returns how many
    /// commands were flipped.
    pub fn retrigger_failed_commands(&mut self) -> Result<usize, PlanError> {
        let ids: Vec<ProjectId> = self.projects.keys().cloned().collect();
        let mut flipped = 0;
        for id in ids {
            flipped += self.retrigger_project(&id)?;
        }
        Ok(flipped)
    }

    /// Flip the Failed commands of one project back to ReadyToRetrigger.
    pub fn retrigger_project(&mut self, id: &ProjectId) -> Result<usize, PlanError> {
        let project = self
            .projects
            .get_mut(id)
            .ok_or_else(|| PlanError::UnknownProject { id: id.clone() })?;
        let mut flipped = 0;
        for command in &mut project.commands {
            if matches!(command.state, CommandState::Failed { .. }) {
                command.set_state(CommandState::ReadyToRetrigger)?;
                flipped += 1;
            }
        }
        if flipped > 0 {
            self.state = self.compute_state();
        }
        Ok(flipped)
    }

    /// Derive the aggregate state from the command states: Succeeded once
    /// every participating command succeeded, Failed once a failure exists
    /// and nothing is mid-flight, InProgress as soon as anything has left
    /// its start state.
    pub fn compute_state(&self) -> ReleaseState {
        let participating: Vec<&CommandState> = self
            .projects
            .values()
            .flat_map(|p| p.commands.iter())
            .map(|c| &c.state)
            .filter(|s| {
                !matches!(
                    s,
                    CommandState::Deactivated { .. } | CommandState::Disabled
                )
            })
            .collect();

        if participating
            .iter()
            .all(|s| matches!(s, CommandState::Succeeded))
        {
            return ReleaseState::Succeeded;
        }
        let any_failed = participating
            .iter()
            .any(|s| matches!(s, CommandState::Failed { .. }));
        let any_in_flight = participating
            .iter()
            .any(|s| matches!(s, CommandState::Queueing | CommandState::InProgress));
        if any_failed && !any_in_flight {
            return ReleaseState::Failed;
        }
        let any_started = participating.iter().any(|s| {
            !matches!(
                s,
                CommandState::Waiting { .. } | CommandState::Ready
            )
        });
        if any_started {
            ReleaseState::InProgress
        } else {
            ReleaseState::Ready
        }
    }
}

/// Analyser-facing constructor: collect projects, submodule grouping and
/// plan-wide settings, then [`build`](Self::build) computes the levels,
/// rejects cycles and produces the immutable-shape plan.
pub struct ReleasePlanBuilder {
    root_project_id: ProjectId,
    projects: Vec<Project>,
    submodules: BTreeMap<ProjectId, Vec<ProjectId>>,
    config: BTreeMap<ConfigKey, String>,
    warnings: Vec<String>,
    infos: Vec<String>,
    disable_release_for: Option<Regex>,
}

impl ReleasePlanBuilder {
    pub fn new(root_project_id: ProjectId) -> Self {
        Self {
            root_project_id,
            projects: Vec::new(),
            submodules: BTreeMap::new(),
            config: BTreeMap::new(),
            warnings: Vec::new(),
            infos: Vec::new(),
            disable_release_for: None,
        }
    }

    pub fn project(
        mut self,
        id: ProjectId,
        current_version: impl Into<String>,
        release_version: impl Into<String>,
        commands: Vec<Command>,
    ) -> Self {
        self.projects.push(Project {
            id,
            current_version: current_version.into(),
            release_version: release_version.into(),
            level: 0,
            is_submodule: false,
            commands,
        });
        self
    }

    /// A submodule shares its parent's release lifecycle: it is grouped
    /// under `parent` for display and inherits the parent's level.
    pub fn submodule(
        mut self,
        parent: &ProjectId,
        id: ProjectId,
        current_version: impl Into<String>,
        release_version: impl Into<String>,
        commands: Vec<Command>,
    ) -> Self {
        self.submodules
            .entry(parent.clone())
            .or_default()
            .push(id.clone());
        self.projects.push(Project {
            id,
            current_version: current_version.into(),
            release_version: release_version.into(),
            level: 0,
            is_submodule: true,
            commands,
        });
        self
    }

    pub fn config(mut self, key: ConfigKey, value: impl Into<String>) -> Self {
        self.config.insert(key, value.into());
        self
    }

    pub fn warning(mut self, message: impl Into<String>) -> Self {
        self.warnings.push(message.into());
        self
    }

    pub fn info(mut self, message: impl Into<String>) -> Self {
        self.infos.push(message.into());
        self
    }

    /// Release commands of projects whose identifier matches the pattern
    /// are constructed Disabled (irreversibly excluded).
    pub fn disable_release_for(mut self, pattern: Regex) -> Self {
        self.disable_release_for = Some(pattern);
        self
    }

    pub fn build(self) -> Result<ReleasePlan, PlanError> {
        let Self {
            root_project_id,
            mut projects,
            submodules,
            config,
            warnings,
            infos,
            disable_release_for,
        } = self;

        let mut by_id: BTreeMap<ProjectId, Project> = BTreeMap::new();
        for project in projects.drain(..) {
            for (index, command) in project.commands.iter().enumerate() {
                let legal_start = matches!(
                    command.state,
                    CommandState::Waiting { .. } | CommandState::Ready | CommandState::Disabled
                );
                if !legal_start {
                    return Err(PlanError::IllegalInitialState {
                        id: project.id.clone(),
                        index,
                        state: command.state.to_string(),
                    });
                }
            }
            let id = project.id.clone();
            if by_id.insert(id.clone(), project).is_some() {
                return Err(PlanError::DuplicateProject { id });
            }
        }

        let parent_of: HashMap<ProjectId, ProjectId> = submodules
            .iter()
            .flat_map(|(parent, children)| {
                children.iter().map(move |c| (c.clone(), parent.clone()))
            })
            .collect();

        assign_levels(&mut by_id, &parent_of)?;

        if let Some(pattern) = disable_release_for {
            for project in by_id.values_mut() {
                if pattern.is_match(&project.id.identifier()) {
                    for command in &mut project.commands {
                        if command.is_release() {
                            command.state = CommandState::Disabled;
                        }
                    }
                }
            }
        }

        ReleasePlan::from_parts(
            Uuid::new_v4(),
            root_project_id,
            by_id,
            submodules,
            config,
            warnings,
            infos,
            ReleaseState::Ready,
        )
    }
}

/// Dependencies a project's commands currently wait on, including sets
/// wrapped inside Deactivated.
fn dependencies_of(project: &Project) -> BTreeSet<&ProjectId> {
    let mut deps = BTreeSet::new();
    for command in &project.commands {
        let state = match &command.state {
            CommandState::Deactivated { previous } => previous.as_ref(),
            other => other,
        };
        if let CommandState::Waiting { dependencies } = state {
            deps.extend(dependencies.iter());
        }
    }
    deps
}

fn derive_dependents(
    projects: &BTreeMap<ProjectId, Project>,
) -> Result<BTreeMap<ProjectId, BTreeSet<ProjectId>>, PlanError> {
    let mut dependents: BTreeMap<ProjectId, BTreeSet<ProjectId>> = BTreeMap::new();
    for project in projects.values() {
        for dependency in dependencies_of(project) {
            if !projects.contains_key(dependency) {
                return Err(PlanError::UnknownDependency {
                    dependency: dependency.clone(),
                    required_by: project.id.clone(),
                });
            }
            dependents
                .entry(dependency.clone())
                .or_default()
                .insert(project.id.clone());
        }
    }
    Ok(dependents)
}

/// Compute each project's level. Submodules are collapsed into their
/// parent for the layering, which both pins a submodule's level to its
/// parent's and keeps every dependency edge strictly increasing in level.
fn assign_levels(
    projects: &mut BTreeMap<ProjectId, Project>,
    parent_of: &HashMap<ProjectId, ProjectId>,
) -> Result<(), PlanError> {
    // Resolve submodule chains to their outermost parent.
    let level_node = |id: &ProjectId| -> ProjectId {
        let mut current = id;
        while let Some(parent) = parent_of.get(current) {
            current = parent;
        }
        current.clone()
    };

    let mut graph: DiGraph<ProjectId, ()> = DiGraph::new();
    let mut nodes: HashMap<ProjectId, NodeIndex> = HashMap::new();
    for id in projects.keys() {
        let node = level_node(id);
        nodes
            .entry(node.clone())
            .or_insert_with(|| graph.add_node(node));
    }
    for project in projects.values() {
        let to = nodes[&level_node(&project.id)];
        for dependency in dependencies_of(project) {
            let from = *nodes
                .get(&level_node(dependency))
                .ok_or_else(|| PlanError::UnknownDependency {
                    dependency: dependency.clone(),
                    required_by: project.id.clone(),
                })?;
            if from != to {
                graph.add_edge(from, to, ());
            }
        }
    }

    let order = toposort(&graph, None).map_err(|cycle| PlanError::DependencyCycle {
        involving: graph[cycle.node_id()].clone(),
    })?;

    let mut levels: HashMap<NodeIndex, u32> = HashMap::new();
    for node in order {
        let level = graph
            .neighbors_directed(node, petgraph::Direction::Incoming)
            .map(|dep| levels.get(&dep).copied().unwrap_or(0) + 1)
            .max()
            .unwrap_or(0);
        levels.insert(node, level);
    }

    for project in projects.values_mut() {
        let node = nodes[&level_node(&project.id)];
        project.level = levels.get(&node).copied().unwrap_or(0);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CommandKind;

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
        // c depends on b depends on a
        ReleasePlanBuilder::new(id("a"))
            .project(id("a"), "1.0.0", "1.0.1", vec![release_command(&[])])
            .project(id("b"), "2.0.0", "2.0.1", vec![release_command(&["a"])])
            .project(id("c"), "3.0.0", "3.0.1", vec![release_command(&["b"])])
            .build()
            .unwrap()
    }

    #[test]
    fn test_levels_follow_dependencies() {
        let plan = chain_plan();
        assert_eq!(plan.project(&id("a")).unwrap().level, 0);
        assert_eq!(plan.project(&id("b")).unwrap().level, 1);
        assert_eq!(plan.project(&id("c")).unwrap().level, 2);

        // Every dependency edge increases the level strictly.
        for project in plan.projects() {
            for dep in dependencies_of(project) {
                assert!(project.level > plan.project(dep).unwrap().level);
            }
        }
    }

    #[test]
    fn test_submodule_inherits_parent_level() {
        let parent = id("parent");
        let plan = ReleasePlanBuilder::new(parent.clone())
            .project(id("lib"), "1.0.0", "1.0.1", vec![release_command(&[])])
            .project(
                parent.clone(),
                "5.0.0",
                "5.0.1",
                vec![release_command(&["lib"])],
            )
            .submodule(
                &parent,
                id("parent-sub"),
                "5.0.0",
                "5.0.1",
                vec![Command::new(
                    CommandKind::UpdateDependency {
                        dependency: id("lib"),
                    },
                    CommandState::waiting_on([id("lib")]),
                )],
            )
            .project(
                id("app"),
                "0.9.0",
                "1.0.0",
                vec![release_command(&["parent-sub"])],
            )
            .build()
            .unwrap();

        let parent_level = plan.project(&parent).unwrap().level;
        assert_eq!(plan.project(&id("parent-sub")).unwrap().level, parent_level);
        // A project waiting on the submodule still lands strictly above it.
        assert!(plan.project(&id("app")).unwrap().level > parent_level);
        assert_eq!(plan.submodules_of(&parent), &[id("parent-sub")]);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let result = ReleasePlanBuilder::new(id("a"))
            .project(id("a"), "1.0.0", "1.0.1", vec![release_command(&["b"])])
            .project(id("b"), "2.0.0", "2.0.1", vec![release_command(&["a"])])
            .build();
        assert!(matches!(result, Err(PlanError::DependencyCycle { .. })));
    }

    #[test]
    fn test_unknown_dependency_is_rejected() {
        let result = ReleasePlanBuilder::new(id("a"))
            .project(id("a"), "1.0.0", "1.0.1", vec![release_command(&["ghost"])])
            .build();
        assert!(matches!(result, Err(PlanError::UnknownDependency { .. })));
    }

    #[test]
    fn test_disable_release_for_pattern() {
        let plan = ReleasePlanBuilder::new(id("a"))
            .project(id("a"), "1.0.0", "1.0.1", vec![release_command(&[])])
            .project(
                id("dist-zip"),
                "1.0.0",
                "1.0.1",
                vec![release_command(&["a"])],
            )
            .disable_release_for(Regex::new(r"com\.example:dist.*").unwrap())
            .build()
            .unwrap();

        assert_eq!(
            plan.command_state(&id("dist-zip"), 0).unwrap(),
            &CommandState::Disabled
        );
        assert_eq!(
            plan.command_state(&id("a"), 0).unwrap(),
            &CommandState::Ready
        );
    }

    #[test]
    fn test_mark_project_released_promotes_drained_waiters() {
        let mut plan = chain_plan();
        assert!(matches!(
            plan.command_state(&id("b"), 0).unwrap(),
            CommandState::Waiting { .. }
        ));

        let promoted = plan.mark_project_released(&id("a")).unwrap();
        assert_eq!(promoted, vec![(id("b"), 0)]);
        assert_eq!(
            plan.command_state(&id("b"), 0).unwrap(),
            &CommandState::Ready
        );
        // c waits on b, not a: untouched.
        assert!(matches!(
            plan.command_state(&id("c"), 0).unwrap(),
            CommandState::Waiting { .. }
        ));
    }

    #[test]
    fn test_aggregate_state_derivation() {
        let mut plan = chain_plan();
        assert_eq!(plan.state(), ReleaseState::Ready);

        plan.transition_command(&id("a"), 0, CommandState::Queueing)
            .unwrap();
        assert_eq!(plan.state(), ReleaseState::InProgress);

        plan.transition_command(&id("a"), 0, CommandState::InProgress)
            .unwrap();
        plan.transition_command(
            &id("a"),
            0,
            CommandState::Failed {
                message: Some("job ended with FAILURE".into()),
            },
        )
        .unwrap();
        assert_eq!(plan.state(), ReleaseState::Failed);

        let flipped = plan.retrigger_failed_commands().unwrap();
        assert_eq!(flipped, 1);
        assert_eq!(
            plan.command_state(&id("a"), 0).unwrap(),
            &CommandState::ReadyToRetrigger
        );
    }

    #[test]
    fn test_fail_interrupted_commands_enables_retriggering() {
        let mut plan = chain_plan();
        plan.transition_command(&id("a"), 0, CommandState::Queueing)
            .unwrap();

        let flipped = plan.fail_interrupted_commands().unwrap();
        assert_eq!(flipped, 1);
        assert!(matches!(
            plan.command_state(&id("a"), 0).unwrap(),
            CommandState::Failed { message: Some(_) }
        ));
        assert_eq!(plan.state(), ReleaseState::Failed);

        // The flipped command is now reachable by the retrigger path.
        assert_eq!(plan.retrigger_failed_commands().unwrap(), 1);
        assert_eq!(
            plan.command_state(&id("a"), 0).unwrap(),
            &CommandState::ReadyToRetrigger
        );
    }

    #[test]
    fn test_succeeded_once_every_participating_command_succeeded() {
        let mut plan = ReleasePlanBuilder::new(id("a"))
            .project(id("a"), "1.0.0", "1.0.1", vec![release_command(&[])])
            .project(id("b"), "2.0.0", "2.0.1", vec![release_command(&["a"])])
            .build()
            .unwrap();

        for project in [id("a"), id("b")] {
            if project == id("b") {
                plan.mark_project_released(&id("a")).unwrap();
            }
            plan.transition_command(&project, 0, CommandState::Queueing)
                .unwrap();
            plan.transition_command(&project, 0, CommandState::InProgress)
                .unwrap();
            plan.transition_command(&project, 0, CommandState::Succeeded)
                .unwrap();
        }
        assert_eq!(plan.state(), ReleaseState::Succeeded);
    }

    #[test]
    fn test_transitions_are_validated() {
        let mut plan = chain_plan();
        let err = plan
            .transition_command(&id("a"), 0, CommandState::Succeeded)
            .unwrap_err();
        assert!(matches!(err, PlanError::Transition(_)));
    }
}
