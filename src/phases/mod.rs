//! Phase runners: one module per node in the phase state machine
//! (Planning → Task-Breakdown → Development → Testing → Review →
//! CEO-Approval), each operating against a shared [`PhaseContext`]
//! capability bag.
//!
//! A sequential-phase-with-retry shape, narrowed from an arbitrary phase
//! DAG down to a fixed six-phase pipeline.

pub mod ceo_approval;
pub mod development;
pub mod planning;
pub mod review;
pub mod task_breakdown;
pub mod testing;

use std::path::PathBuf;

use chrono::Utc;

use crate::agent::{AgentRegistry, AgentSession};
use crate::config::AutonomaConfig;
use crate::context_watcher::{ContextSignal, ContextWatcher};
use crate::db::Db;
use crate::errors::PhaseError;
use crate::handoff::{render_continuation_prompt, HandoffStore};
use crate::model::{AgentStatus, Handoff, PersistedState, Role};
use crate::protocol::ProtocolParser;
use crate::retry::RetryContextStore;

/// The capability bag every phase runner receives. Bundling these as
/// `&mut` fields, rather than threading six separate arguments through
/// every function, keeps each phase runner's signature stable as the
/// set of shared collaborators grows.
pub struct PhaseContext<'a> {
    pub config: &'a AutonomaConfig,
    pub working_dir: PathBuf,
    pub state: &'a mut PersistedState,
    pub agents: &'a mut AgentRegistry,
    pub handoffs: &'a HandoffStore,
    pub db: &'a Db,
    pub retry_contexts: &'a mut RetryContextStore,
    pub watchers: &'a mut std::collections::HashMap<String, ContextWatcher>,
    /// True while running under the indefinite (loop-until-terminal)
    /// control mode; only then does a crossed context threshold get
    /// stamped onto the agent's very next prompt — a single `run_one_cycle`
    /// step has no "next prompt" of its own to stamp.
    pub indefinite: bool,
}

impl<'a> PhaseContext<'a> {
    pub fn watcher_for(&mut self, agent_id: &str) -> &mut ContextWatcher {
        self.watchers
            .entry(agent_id.to_string())
            .or_insert_with(|| ContextWatcher::new(self.config))
    }
}

/// What a phase runner reports back to the `Orchestrator`'s main loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseOutcome {
    /// Phase finished; orchestrator should advance to the next phase.
    Advance,
    /// Phase needs another iteration before it can advance (e.g.
    /// Development still has pending tasks, Review found issues to fix).
    Continue,
    /// CEO rejected the milestone; orchestrator should rewind.
    Rewind { feedback: String },
    /// A human answer is required before this phase can continue.
    WaitingOnHuman,
}

/// Runs one turn for the current (or freshly spawned) agent of `role`,
/// handling the context-budget handoff dance: if the agent was already
/// told on a prior turn that it's nearing its budget, this turn's prompt
/// is extended with a wrap-up instruction, its output is parsed for a
/// `===HANDOFF===` block, and the agent is replaced before returning.
///
/// Returns the raw turn output and the id of the agent that should be
/// used for the *next* turn of this role (identical to the id used for
/// this turn unless a handoff just happened).
pub async fn run_turn_with_handoff(
    ctx: &mut PhaseContext<'_>,
    phase_name: &str,
    role: Role,
    display_name: &str,
    base_prompt: String,
) -> Result<(String, String), PhaseError> {
    let agent_id = match ctx.agents.current_id_for(role) {
        Some(id) => id,
        None => ctx.agents.spawn(role, display_name).id.clone(),
    };

    let is_first_turn = ctx
        .agents
        .get(&agent_id)
        .map(|a| a.started_at.is_none())
        .unwrap_or(false);

    let mut prompt = base_prompt;

    // The successor's very first prompt carries the predecessor's replay
    // block, if this id was ever created via a handoff.
    if is_first_turn {
        if let Ok(Some(handoff)) = ctx.handoffs.for_replacement(&agent_id) {
            prompt = format!("{}\n\n---\n\n{prompt}", render_continuation_prompt(&handoff));
        }
    }

    // In indefinite mode only, a threshold crossed on a prior turn stamps
    // this agent's next prompt once with its canned message.
    if ctx.indefinite {
        if let Some(message) = ctx.watcher_for(&agent_id).take_pending_message() {
            prompt = format!("{prompt}\n\n---\n{message}");
        }
    }

    let should_wrap_up = ctx.watcher_for(&agent_id).must_handoff();
    let prompt = if should_wrap_up {
        format!(
            "{prompt}\n\n---\nYour context budget is nearly exhausted. Finish your \
             current thought, then emit a ===HANDOFF=== marker followed by a fenced JSON \
             continuation block describing files modified, files still to touch, current \
             state, blockers, and next steps."
        )
    } else {
        prompt
    };

    if let Some(agent) = ctx.agents.get_mut(&agent_id) {
        agent.status = AgentStatus::Running;
        agent.started_at.get_or_insert(Utc::now());
    }

    let session = AgentSession::new(ctx.config, ctx.working_dir.clone());
    let outcome = session
        .run_turn(&agent_id, role, &prompt)
        .await
        .map_err(|source| PhaseError::Agent {
            phase: phase_name.to_string(),
            source,
        })?;

    let signals = ctx.watcher_for(&agent_id).record(&outcome.token_usage);
    let _ = signals;

    if let Some(agent) = ctx.agents.get_mut(&agent_id) {
        agent.token_usage.input_tokens += outcome.token_usage.input_tokens;
        agent.token_usage.output_tokens += outcome.token_usage.output_tokens;
        agent.token_usage.cost_usd += outcome.token_usage.cost_usd;
        agent.last_output = outcome.raw_output.clone();
    }

    if should_wrap_up {
        let continuation = ProtocolParser::parse_continuation(&outcome.raw_output);
        let current_task_id = ctx.state.current_tasks_in_progress.first().cloned();
        let content_hash = crate::handoff::hash_continuation(&continuation);
        let mut handoff = Handoff {
            predecessor_id: agent_id.clone(),
            role,
            current_task_id,
            timestamp: Utc::now(),
            final_token_usage: outcome.token_usage,
            continuation,
            replacement_agent_id: None,
            content_hash,
        };
        ctx.handoffs.record(&handoff).map_err(|source| PhaseError::State {
            phase: phase_name.to_string(),
            source,
        })?;

        if let Some(agent) = ctx.agents.get_mut(&agent_id) {
            agent.status = AgentStatus::Complete;
            agent.ended_at = Some(Utc::now());
        }
        let replacement_id = ctx
            .agents
            .replace(&agent_id)
            .expect("predecessor was just looked up")
            .id
            .clone();
        ctx.handoffs
            .backfill_replacement(&agent_id, &replacement_id)
            .map_err(|source| PhaseError::State {
                phase: phase_name.to_string(),
                source,
            })?;
        handoff.replacement_agent_id = Some(replacement_id.clone());
        ctx.state.handoffs.push(handoff);
        return Ok((outcome.raw_output, replacement_id));
    }

    if let Some(agent) = ctx.agents.get_mut(&agent_id) {
        agent.status = AgentStatus::Complete;
        agent.ended_at = Some(Utc::now());
    }

    Ok((outcome.raw_output, agent_id))
}
