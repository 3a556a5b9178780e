//! Development: pops tasks from the current batch's [`WorkStealQueue`] and
//! runs them through a pool of Developer agents.
//!
//! Fans a fixed-size pool of independent subprocess runs out via
//! `futures::future::join_all` and aggregates their results once every
//! future resolves. Each worker here only touches data it owns (a cloned
//! config, the shared queue, a shared retry-context mutex) so no worker
//! needs a `&mut` borrow of the shared [`PhaseContext`] — results are
//! applied back into `ctx` sequentially after the join.

use chrono::Utc;
use futures::future::join_all;

use crate::agent::AgentSession;
use crate::context_watcher::{ContextSignal, ContextWatcher};
use crate::errors::PhaseError;
use crate::handoff::{render_continuation_prompt, HandoffStore};
use crate::model::{AgentStatus, Handoff, Phase, Role, TokenUsage, VerificationResult, WorkStatus};
use crate::protocol::ProtocolParser;
use crate::queue::WorkStealQueue;
use crate::retry::RetryContextStore;
use crate::verifier::{all_required_passed, default_commands, Verifier};

use super::{PhaseContext, PhaseOutcome};

const PHASE_NAME: &str = "development";

enum WorkerEvent {
    Completed {
        task_id: String,
        learnings: Option<String>,
    },
    Failed {
        task_id: String,
        reason: String,
        verification: Vec<VerificationResult>,
    },
    Blocked { task_id: String, question: String },
    HandedOff { predecessor_id: String, handoff: Box<Handoff> },
}

struct WorkerResult {
    agent_id: String,
    usage: TokenUsage,
    events: Vec<WorkerEvent>,
}

pub async fn run(ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome, PhaseError> {
    let Some(batch) = ctx.state.batches.get(ctx.state.current_batch_index) else {
        ctx.state.complete_phase(Phase::Development);
        return Ok(PhaseOutcome::Advance);
    };

    if batch.is_complete() {
        ctx.state.complete_phase(Phase::Development);
        return Ok(PhaseOutcome::Advance);
    }

    let worker_count = batch
        .developer_count()
        .min(ctx.config.max_parallel_developers);
    let pending_tasks: Vec<_> = batch
        .tasks
        .iter()
        .filter(|t| matches!(t.status, WorkStatus::Pending))
        .cloned()
        .collect();
    let batch_description = batch.description.clone();

    let queue = WorkStealQueue::new(pending_tasks);
    let retry_store: &RetryContextStore = ctx.retry_contexts;

    // Reuse any idle successor a prior handoff already created for this
    // role before spawning brand-new workers for the remaining slots —
    // otherwise a handed-off worker's queue slot is simply abandoned and
    // the replacement agent the handoff record names never takes a turn.
    let mut dev_ids: Vec<String> = ctx.agents.pending_continuations(Role::Developer);
    dev_ids.truncate(worker_count);
    while dev_ids.len() < worker_count {
        dev_ids.push(ctx.agents.spawn(Role::Developer, "Developer").id.clone());
    }

    let config = ctx.config.clone();
    let working_dir = ctx.working_dir.clone();
    let handoffs: &HandoffStore = ctx.handoffs;
    let indefinite = ctx.indefinite;

    let worker_futures = dev_ids.iter().map(|agent_id| {
        let queue = &queue;
        let config = config.clone();
        let working_dir = working_dir.clone();
        let agent_id = agent_id.clone();
        let batch_description = batch_description.clone();
        async move {
            run_worker(
                agent_id,
                config,
                working_dir,
                queue,
                retry_store,
                handoffs,
                indefinite,
                batch_description,
            )
            .await
        }
    });

    let results = join_all(worker_futures).await;

    let mut any_handoff = false;
    for result in results {
        let handed_off = result
            .events
            .iter()
            .any(|e| matches!(e, WorkerEvent::HandedOff { .. }));
        if let Some(agent) = ctx.agents.get_mut(&result.agent_id) {
            agent.started_at.get_or_insert(Utc::now());
            agent.token_usage.input_tokens += result.usage.input_tokens;
            agent.token_usage.output_tokens += result.usage.output_tokens;
            agent.token_usage.cost_usd += result.usage.cost_usd;
            if !handed_off {
                agent.status = AgentStatus::Complete;
                agent.ended_at = Some(Utc::now());
            }
        }

        for event in result.events {
            match event {
                WorkerEvent::Completed { task_id, learnings } => {
                    set_task_status(ctx, &task_id, WorkStatus::Complete, None, false);
                    if let Some(notes) = learnings {
                        let _ = ctx.db.insert_memory("developer", &task_id, &notes);
                    }
                    ctx.retry_contexts.clear(&task_id);
                }
                WorkerEvent::Failed {
                    task_id,
                    reason,
                    verification,
                } => {
                    ctx.retry_contexts
                        .record_failure(&task_id, reason.clone(), verification);
                    let can_retry = batch_task(ctx, &task_id).map(|t| t.can_retry()).unwrap_or(false);
                    if can_retry {
                        requeue_task(ctx, &task_id, reason);
                    } else {
                        set_task_status(ctx, &task_id, WorkStatus::Failed, Some(reason), true);
                    }
                }
                WorkerEvent::Blocked { task_id, question } => {
                    let _ = ctx
                        .db
                        .enqueue_human_question(PHASE_NAME, Some(&task_id), &question);
                    set_task_status(ctx, &task_id, WorkStatus::Pending, Some(question), false);
                }
                WorkerEvent::HandedOff {
                    predecessor_id,
                    handoff,
                } => {
                    any_handoff = true;
                    let _ = ctx.handoffs.record(&handoff);
                    if let Some(agent) = ctx.agents.get_mut(&predecessor_id) {
                        agent.status = crate::model::AgentStatus::Complete;
                    }
                    if let Some(replacement) = ctx.agents.replace(&predecessor_id) {
                        let replacement_id = replacement.id.clone();
                        let _ = ctx
                            .handoffs
                            .backfill_replacement(&predecessor_id, &replacement_id);
                        let mut handoff = *handoff;
                        handoff.replacement_agent_id = Some(replacement_id);
                        ctx.state.handoffs.push(handoff);
                    } else {
                        ctx.state.handoffs.push(*handoff);
                    }
                }
            }
        }
    }

    if let Some(batch) = ctx.state.batches.get_mut(ctx.state.current_batch_index) {
        batch.recompute_status();
    }

    let batch = &ctx.state.batches[ctx.state.current_batch_index];
    if batch.is_complete() {
        ctx.state.current_batch_index += 1;
        if ctx.state.current_batch_index >= ctx.state.batches.len() {
            ctx.state.complete_phase(Phase::Development);
            return Ok(PhaseOutcome::Advance);
        }
    }
    let _ = any_handoff;

    Ok(PhaseOutcome::Continue)
}

async fn run_worker(
    agent_id: String,
    config: crate::config::AutonomaConfig,
    working_dir: std::path::PathBuf,
    queue: &WorkStealQueue,
    retry_store: &RetryContextStore,
    handoffs: &HandoffStore,
    indefinite: bool,
    batch_description: String,
) -> WorkerResult {
    let mut watcher = ContextWatcher::new(&config);
    let mut total_usage = TokenUsage::default();
    let mut events = Vec::new();
    let current_agent_id = agent_id.clone();

    // If this id was created as a handoff's successor, its very first
    // prompt gets the predecessor's replay block prefixed exactly once.
    let mut continuation_prefix = handoffs
        .for_replacement(&agent_id)
        .ok()
        .flatten()
        .map(|h| render_continuation_prompt(&h));

    loop {
        if watcher.must_handoff() {
            break;
        }
        let Some(task) = queue.pop() else { break };

        let retry_context = retry_store.render_for_prompt(&task.id);

        let mut prompt = format!(
            "You are a developer working on batch \"{batch_description}\". Implement the \
             following task, then respond with '=== TASK COMPLETE ===' on its own line. If \
             you are blocked and need human input, include a <blocker>...</blocker> tag \
             instead.\n\nTask: {}\n{}\n{retry_context}",
            task.title, task.description
        );

        if let Some(prefix) = continuation_prefix.take() {
            prompt = format!("{prefix}\n\n---\n\n{prompt}");
        }
        if indefinite {
            if let Some(message) = watcher.take_pending_message() {
                prompt = format!("{prompt}\n\n---\n{message}");
            }
        }

        let session = AgentSession::new(&config, working_dir.clone());
        match session.run_turn(&current_agent_id, Role::Developer, &prompt).await {
            Ok(outcome) => {
                total_usage.input_tokens += outcome.token_usage.input_tokens;
                total_usage.output_tokens += outcome.token_usage.output_tokens;
                total_usage.cost_usd += outcome.token_usage.cost_usd;
                let signals = watcher.record(&outcome.token_usage);

                if let Some(blocker) = ProtocolParser::blocker(&outcome.raw_output) {
                    events.push(WorkerEvent::Blocked {
                        task_id: task.id.clone(),
                        question: blocker,
                    });
                } else if ProtocolParser::has_completion_marker(&outcome.raw_output) {
                    let verifier = Verifier::new(&config, working_dir.clone());
                    let results = verifier.run_all(&default_commands()).await;
                    if all_required_passed(&results) {
                        events.push(WorkerEvent::Completed {
                            task_id: task.id.clone(),
                            learnings: ProtocolParser::learnings(&outcome.raw_output),
                        });
                    } else {
                        events.push(WorkerEvent::Failed {
                            task_id: task.id.clone(),
                            reason: "verification failed after agent reported completion".into(),
                            verification: results,
                        });
                    }
                } else {
                    events.push(WorkerEvent::Failed {
                        task_id: task.id.clone(),
                        reason: "agent output carried neither a completion marker nor a blocker tag".into(),
                        verification: vec![],
                    });
                }

                if signals.contains(&ContextSignal::HandoffRequired) {
                    let continuation = ProtocolParser::parse_continuation(&outcome.raw_output);
                    let content_hash = crate::handoff::hash_continuation(&continuation);
                    let handoff = Handoff {
                        predecessor_id: current_agent_id.clone(),
                        role: Role::Developer,
                        current_task_id: Some(task.id.clone()),
                        timestamp: chrono::Utc::now(),
                        final_token_usage: outcome.token_usage,
                        continuation,
                        replacement_agent_id: None,
                        content_hash,
                    };
                    events.push(WorkerEvent::HandedOff {
                        predecessor_id: current_agent_id.clone(),
                        handoff: Box::new(handoff),
                    });
                    break;
                }
            }
            Err(e) => {
                events.push(WorkerEvent::Failed {
                    task_id: task.id.clone(),
                    reason: e.to_string(),
                    verification: vec![],
                });
            }
        }
    }

    WorkerResult {
        agent_id,
        usage: total_usage,
        events,
    }
}

fn batch_task<'s>(ctx: &'s PhaseContext<'_>, task_id: &str) -> Option<&'s crate::model::Task> {
    ctx.state.batches[ctx.state.current_batch_index]
        .tasks
        .iter()
        .find(|t| t.id == task_id)
}

fn set_task_status(
    ctx: &mut PhaseContext<'_>,
    task_id: &str,
    status: WorkStatus,
    failure_reason: Option<String>,
    bump_retry: bool,
) {
    let idx = ctx.state.current_batch_index;
    if let Some(task) = ctx.state.batches[idx].tasks.iter_mut().find(|t| t.id == task_id) {
        task.status = status;
        if bump_retry {
            task.retry_count += 1;
        }
        if let Some(reason) = failure_reason {
            task.last_failure_reason = Some(reason);
        }
    }
}

fn requeue_task(ctx: &mut PhaseContext<'_>, task_id: &str, reason: String) {
    let idx = ctx.state.current_batch_index;
    if let Some(task) = ctx.state.batches[idx].tasks.iter_mut().find(|t| t.id == task_id) {
        task.retry_count += 1;
        task.status = WorkStatus::Pending;
        task.last_failure_reason = Some(reason);
    }
}
