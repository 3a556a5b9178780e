//! `Orchestrator`: the top-level driver that owns the phase state machine
//! and steps it forward until the milestone plan completes, fails, or
//! needs a human.
//!
//! Follows a "load state, loop phases, persist after every step, stop on
//! terminal status" shape, narrowed to a fixed six-phase sequence with an
//! explicit rewind edge from CEO-Approval back to Development. Six entry
//! points drive it: `start`, `resume`, `adopt`, and `status` cover the
//! whole-run lifecycle; `run_initial_phases` and `run_one_cycle` give a
//! caller finer-grained control over exactly how much of the state
//! machine a single call advances.

pub mod guidance;
pub mod status;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::agent::AgentRegistry;
use crate::config::AutonomaConfig;
use crate::context_watcher::ContextWatcher;
use crate::db::Db;
use crate::errors::{AgentError, OrchestratorError, PhaseError};
use crate::handoff::HandoffStore;
use crate::model::{Phase, PersistedState, StatusFile};
use crate::phases::{self, PhaseContext, PhaseOutcome};
use crate::retry::RetryContextStore;
use crate::state::StateStore;

use status::StatusWriter;

/// Process exit codes, per the external-interface contract: `0` the
/// milestone plan completed and was CEO-approved, `1` a phase failed
/// without recourse, `2` an agent or a verification step exceeded its
/// configured timeout, `3` the run is blocked on a human answer. `130`
/// (the conventional Unix `128 + SIGINT` status) falls outside that
/// four-value contract: it marks an operator-initiated interruption, not
/// a terminal orchestration outcome, so it never collides with `2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Complete = 0,
    Failed = 1,
    Timeout = 2,
    Blocked = 3,
    Interrupted = 130,
}

/// One phase-loop step's outcome, returned by [`Orchestrator::run_one_cycle`]
/// for a caller that wants to drive the state machine a single step at a
/// time instead of letting it run to a terminal phase on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The run reached a terminal or blocking state on this step.
    Terminal(ExitCode),
    /// The phase advanced or iterated; further steps remain.
    InProgress,
}

/// Upper bound on phase-loop iterations across a run's lifetime, guarding
/// against a runaway loop if a phase runner keeps returning `Continue`
/// without making progress (e.g. a Development batch that can never empty
/// its queue because every task keeps failing its retry budget).
const MAX_ITERATIONS_PER_CYCLE: u64 = 10_000;

pub struct Orchestrator {
    config: AutonomaConfig,
    working_dir: PathBuf,
    state_store: StateStore,
    handoffs: HandoffStore,
    db: Db,
    status_writer: StatusWriter,
    agents: AgentRegistry,
    retry_contexts: RetryContextStore,
    watchers: HashMap<String, ContextWatcher>,
    guidance_rx: UnboundedReceiver<String>,
    guidance_task: JoinHandle<()>,
}

impl Orchestrator {
    fn new(working_dir: PathBuf, config: AutonomaConfig) -> Result<Self, OrchestratorError> {
        let db = Db::open(&working_dir).map_err(OrchestratorError::Store)?;
        let (guidance_rx, guidance_task) = guidance::spawn_watcher(working_dir.clone());
        Ok(Self {
            state_store: StateStore::new(&working_dir),
            handoffs: HandoffStore::new(&working_dir),
            status_writer: StatusWriter::new(&working_dir),
            agents: AgentRegistry::new(),
            retry_contexts: RetryContextStore::new(),
            watchers: HashMap::new(),
            guidance_rx,
            guidance_task,
            db,
            config,
            working_dir,
        })
    }

    fn load_config(working_dir: &Path) -> Result<AutonomaConfig, OrchestratorError> {
        AutonomaConfig::load(working_dir).map_err(|e| OrchestratorError::Config(e.to_string()))
    }

    /// Starts a brand-new orchestration rooted at `requirements_path` and
    /// drives it indefinitely until it reaches a terminal or blocking
    /// state. Fails if `state.json` already exists — use
    /// [`Orchestrator::resume`] instead.
    pub async fn start(
        working_dir: PathBuf,
        requirements_path: String,
    ) -> Result<ExitCode, OrchestratorError> {
        let config = Self::load_config(&working_dir)?;
        let mut orchestrator = Self::new(working_dir, config)?;

        if orchestrator.state_store.exists() {
            return Err(OrchestratorError::Aborted(
                "state.json already exists; use `autonoma resume` instead".to_string(),
            ));
        }

        let state = crate::state::fresh_state(&requirements_path, false, Vec::new());
        orchestrator.state_store.save(&state).map_err(OrchestratorError::State)?;
        orchestrator.run_indefinite(state).await
    }

    /// Resumes an existing orchestration from `state.json` and drives it
    /// indefinitely until it reaches a terminal or blocking state.
    pub async fn resume(working_dir: PathBuf) -> Result<ExitCode, OrchestratorError> {
        let config = Self::load_config(&working_dir)?;
        let orchestrator = Self::new(working_dir, config)?;
        let state = orchestrator.state_store.load().map_err(OrchestratorError::State)?;
        orchestrator.run_indefinite(state).await
    }

    /// Adopts an existing codebase: marks `has_project_context`, attaches
    /// `context_paths` as extra project documents for Planning to read
    /// alongside `requirements_path`, and starts fresh from Planning. When
    /// `requirements_path` is omitted, a conventionally-named document is
    /// discovered by globbing over common filenames.
    pub async fn adopt(
        working_dir: PathBuf,
        requirements_path: Option<String>,
        context_paths: Vec<String>,
    ) -> Result<ExitCode, OrchestratorError> {
        let config = Self::load_config(&working_dir)?;
        let mut orchestrator = Self::new(working_dir.clone(), config)?;

        if orchestrator.state_store.exists() {
            return Err(OrchestratorError::Aborted(
                "state.json already exists; use `autonoma resume` instead".to_string(),
            ));
        }

        let requirements_path = match requirements_path {
            Some(path) => path,
            None => discover_requirements_path(&working_dir).ok_or_else(|| {
                OrchestratorError::Config(
                    "no requirements document found (looked for REQUIREMENTS.md, SPEC.md, spec.md)".to_string(),
                )
            })?,
        };

        let state = crate::state::fresh_state(&requirements_path, true, context_paths);
        orchestrator.state_store.save(&state).map_err(OrchestratorError::State)?;
        orchestrator.run_indefinite(state).await
    }

    /// Runs a fresh orchestration through Planning and Task-Breakdown only,
    /// then returns without entering Development — a checkpoint a caller
    /// can inspect (the generated plan and task batches) before deciding
    /// whether to keep driving the run with [`Orchestrator::resume`].
    pub async fn run_initial_phases(
        working_dir: PathBuf,
        requirements_path: String,
    ) -> Result<ExitCode, OrchestratorError> {
        let config = Self::load_config(&working_dir)?;
        let mut orchestrator = Self::new(working_dir, config)?;

        if orchestrator.state_store.exists() {
            return Err(OrchestratorError::Aborted(
                "state.json already exists; use `autonoma resume` instead".to_string(),
            ));
        }

        let state = crate::state::fresh_state(&requirements_path, false, Vec::new());
        orchestrator.state_store.save(&state).map_err(OrchestratorError::State)?;
        orchestrator
            .run_until(state, false, |s| {
                s.has_completed(Phase::Planning) && s.has_completed(Phase::TaskBreakdown)
            })
            .await
    }

    /// Advances an orchestration by exactly one phase-loop step: one
    /// guidance check, or one phase-runner dispatch. Unlike `start`/
    /// `resume`/`adopt`, this never loops on its own — a caller drives the
    /// run step by step, inspecting [`CycleOutcome`] between calls.
    /// Creates a fresh state at `requirements_path` if none exists yet.
    pub async fn run_one_cycle(
        working_dir: PathBuf,
        requirements_path: String,
    ) -> Result<CycleOutcome, OrchestratorError> {
        let config = Self::load_config(&working_dir)?;
        let mut orchestrator = Self::new(working_dir, config)?;

        let mut state = if orchestrator.state_store.exists() {
            orchestrator.state_store.load().map_err(OrchestratorError::State)?
        } else {
            let fresh = crate::state::fresh_state(&requirements_path, false, Vec::new());
            orchestrator.state_store.save(&fresh).map_err(OrchestratorError::State)?;
            fresh
        };

        orchestrator.step(&mut state, false).await
    }

    /// Injects `guidance` directly (bypassing the on-disk `guidance.txt`
    /// drop-in file), rewinding to Planning exactly as an externally
    /// dropped guidance file would, then drives the run indefinitely from
    /// there.
    pub async fn replan_with_guidance(
        working_dir: PathBuf,
        guidance: String,
        requirements_path: String,
    ) -> Result<ExitCode, OrchestratorError> {
        let config = Self::load_config(&working_dir)?;
        let mut orchestrator = Self::new(working_dir, config)?;

        let mut state = if orchestrator.state_store.exists() {
            orchestrator.state_store.load().map_err(OrchestratorError::State)?
        } else {
            crate::state::fresh_state(&requirements_path, false, Vec::new())
        };

        state.rewind_for_guidance(guidance);
        orchestrator.persist(&state)?;
        orchestrator.run_indefinite(state).await
    }

    /// Returns the current `status.json` snapshot without advancing the
    /// state machine.
    pub fn status(working_dir: &Path) -> Result<StatusFile, OrchestratorError> {
        let state_store = StateStore::new(working_dir);
        let state = state_store.load().map_err(OrchestratorError::State)?;
        Ok(status_from_state(&state, &HashMap::new()))
    }

    /// Drives phase transitions indefinitely until a terminal phase, a
    /// `Blocked` outcome, a timeout, or a SIGINT is observed.
    async fn run_indefinite(self, state: PersistedState) -> Result<ExitCode, OrchestratorError> {
        self.run_until(state, true, |_| false).await
    }

    /// Loops [`Self::step`] until `stop_early` reports true on an
    /// in-progress state, or the step itself reaches a terminal outcome.
    async fn run_until(
        mut self,
        mut state: PersistedState,
        indefinite: bool,
        stop_early: impl Fn(&PersistedState) -> bool,
    ) -> Result<ExitCode, OrchestratorError> {
        loop {
            match self.step(&mut state, indefinite).await? {
                CycleOutcome::Terminal(code) => return Ok(code),
                CycleOutcome::InProgress => {
                    if stop_early(&state) {
                        return Ok(ExitCode::Complete);
                    }
                }
            }
        }
    }

    /// The phase-loop body, extracted so both the looping entry points and
    /// [`Self::run_one_cycle`] share one implementation: checks for a
    /// terminal phase or iteration cap, drains one pending guidance
    /// message, otherwise dispatches exactly one phase runner (racing it
    /// against SIGINT), persists, and reports what happened.
    async fn step(
        &mut self,
        state: &mut PersistedState,
        indefinite: bool,
    ) -> Result<CycleOutcome, OrchestratorError> {
        if matches!(state.phase, Phase::Complete) {
            self.persist(state)?;
            return Ok(CycleOutcome::Terminal(ExitCode::Complete));
        }
        if matches!(state.phase, Phase::Failed) {
            self.persist(state)?;
            return Ok(CycleOutcome::Terminal(ExitCode::Failed));
        }
        if state.total_loop_iterations >= MAX_ITERATIONS_PER_CYCLE {
            warn!(
                iterations = state.total_loop_iterations,
                "orchestration exceeded max iterations for a single run"
            );
            state.phase = Phase::Failed;
            self.persist(state)?;
            return Ok(CycleOutcome::Terminal(ExitCode::Failed));
        }

        if let Ok(message) = self.guidance_rx.try_recv() {
            info!(guidance = %message, "consumed external guidance, rewinding to planning");
            state.rewind_for_guidance(message);
            self.persist(state)?;
            self.write_status(state);
            return Ok(CycleOutcome::InProgress);
        }

        let next_phase = advance_phase(state.phase);
        let phase_to_run = if state.has_completed(state.phase) {
            next_phase
        } else {
            state.phase
        };

        let step_result = {
            let mut ctx = PhaseContext {
                config: &self.config,
                working_dir: self.working_dir.clone(),
                state,
                agents: &mut self.agents,
                handoffs: &self.handoffs,
                db: &self.db,
                retry_contexts: &mut self.retry_contexts,
                watchers: &mut self.watchers,
                indefinite,
            };
            let dispatch = run_phase(phase_to_run, &mut ctx);
            tokio::select! {
                biased;
                _ = tokio::signal::ctrl_c() => None,
                result = dispatch => Some(result),
            }
        };

        let Some(result) = step_result else {
            info!("received interrupt signal, saving state and exiting");
            self.persist(state)?;
            return Ok(CycleOutcome::Terminal(ExitCode::Interrupted));
        };

        state.phase = phase_to_run;
        state.total_loop_iterations += 1;

        match result {
            Ok(PhaseOutcome::Advance) => {
                state.phase = advance_phase(phase_to_run);
            }
            Ok(PhaseOutcome::Continue) => {}
            Ok(PhaseOutcome::Rewind { feedback }) => {
                info!(%feedback, "CEO rejected milestone, rewinding to development");
                state.phase = Phase::Development;
            }
            Ok(PhaseOutcome::WaitingOnHuman) => {
                self.persist(state)?;
                return Ok(CycleOutcome::Terminal(ExitCode::Blocked));
            }
            Err(PhaseError::Agent {
                source: AgentError::Timeout { .. },
                ..
            }) => {
                warn!("agent exceeded its configured timeout");
                state.phase = Phase::Failed;
                self.persist(state)?;
                return Ok(CycleOutcome::Terminal(ExitCode::Timeout));
            }
            Err(PhaseError::Blocked { reason, .. }) => {
                warn!(%reason, "phase blocked on human input");
                self.persist(state)?;
                return Ok(CycleOutcome::Terminal(ExitCode::Blocked));
            }
            Err(PhaseError::RetriesExhausted { phase, attempts }) => {
                warn!(%phase, attempts, "phase exhausted retries without recourse");
                state.phase = Phase::Failed;
            }
            Err(e) => {
                warn!(error = %e, "phase runner returned a fatal error");
                state.phase = Phase::Failed;
            }
        }

        self.persist(state)?;
        self.write_status(state);

        if matches!(state.phase, Phase::Complete) {
            return Ok(CycleOutcome::Terminal(ExitCode::Complete));
        }
        if matches!(state.phase, Phase::Failed) {
            return Ok(CycleOutcome::Terminal(ExitCode::Failed));
        }
        Ok(CycleOutcome::InProgress)
    }

    fn persist(&self, state: &PersistedState) -> Result<(), OrchestratorError> {
        self.state_store.save(state).map_err(OrchestratorError::State)
    }

    fn write_status(&self, state: &PersistedState) {
        let status = status_from_state(state, &self.agents.status_snapshot());
        if let Err(e) = self.status_writer.write(&status) {
            warn!(error = %e, "failed to write status.json");
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.guidance_task.abort();
    }
}

fn status_from_state(state: &PersistedState, agents: &HashMap<String, crate::model::AgentStatus>) -> StatusFile {
    StatusFile {
        phase: state.phase,
        iteration: state.total_loop_iterations,
        progress_completed: state.completed_tasks(),
        progress_total: state.total_tasks(),
        agents: agents.clone(),
        last_update: state.updated_at,
    }
}

/// Maps each phase to its successor in the fixed pipeline. `Complete` and
/// `Failed` are terminal and map to themselves.
fn advance_phase(phase: Phase) -> Phase {
    match phase {
        Phase::Idle => Phase::Planning,
        Phase::Planning => Phase::TaskBreakdown,
        Phase::TaskBreakdown => Phase::Development,
        Phase::Development => Phase::Testing,
        Phase::Testing => Phase::Review,
        Phase::Review => Phase::CeoApproval,
        Phase::CeoApproval | Phase::Complete => Phase::Complete,
        Phase::Failed => Phase::Failed,
    }
}

fn run_phase<'a>(
    phase: Phase,
    ctx: &'a mut PhaseContext<'_>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<PhaseOutcome, PhaseError>> + 'a>> {
    Box::pin(async move {
        match phase {
            Phase::Idle => Ok(PhaseOutcome::Advance),
            Phase::Planning => phases::planning::run(ctx).await,
            Phase::TaskBreakdown => phases::task_breakdown::run(ctx).await,
            Phase::Development => phases::development::run(ctx).await,
            Phase::Testing => phases::testing::run(ctx).await,
            Phase::Review => phases::review::run(ctx).await,
            Phase::CeoApproval => phases::ceo_approval::run(ctx).await,
            Phase::Complete | Phase::Failed => Ok(PhaseOutcome::Advance),
        }
    })
}

/// Looks for a conventionally-named requirements document in
/// `working_dir`, in priority order.
fn discover_requirements_path(working_dir: &Path) -> Option<String> {
    const CANDIDATES: &[&str] = &["REQUIREMENTS.md", "SPEC.md", "spec.md", "docs/REQUIREMENTS.md"];
    CANDIDATES
        .iter()
        .map(|name| working_dir.join(name))
        .find(|path| path.exists())
        .map(|path| path.display().to_string())
}
