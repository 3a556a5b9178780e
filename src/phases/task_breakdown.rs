//! Task-Breakdown: the Staff Engineer decomposes the CEO's plan into an
//! ordered sequence of [`crate::model::Batch`]es of developer-sized
//! [`crate::model::Task`]s.

use serde::Deserialize;

use crate::errors::{PhaseError, ProtocolError};
use crate::model::{Batch, Complexity, Phase, Role, Task, WorkStatus};
use crate::protocol::ProtocolParser;

use super::{run_turn_with_handoff, PhaseContext, PhaseOutcome};

#[derive(Deserialize)]
struct RawBatches {
    batches: Vec<RawBatch>,
}

/// Legacy pre-batch Staff Engineer output: a flat task list with no
/// batching concept. Per the same Open Question resolution used for a
/// resumed v1 `state.json`, this always becomes a single
/// sequential, non-parallel batch — no attempt is made to infer
/// independence among the legacy tasks.
#[derive(Deserialize)]
struct RawLegacyTasks {
    tasks: Vec<RawTask>,
}

#[derive(Deserialize)]
struct RawBatch {
    batch_id: String,
    #[serde(default)]
    parallel: bool,
    #[serde(default)]
    max_parallel_tasks: Option<usize>,
    #[serde(default)]
    description: String,
    tasks: Vec<RawTask>,
}

#[derive(Deserialize)]
struct RawTask {
    id: String,
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    target_files: Option<Vec<String>>,
    #[serde(default)]
    complexity: Complexity,
    #[serde(default)]
    hint: String,
}

const PHASE_NAME: &str = "task-breakdown";

/// Staff Engineer output is LLM-generated JSON; ids are occasionally left
/// blank. Backfilling with a fresh UUID keeps batch/task ids usable as
/// stable map keys downstream (retry-context lookups, `assigned_to`)
/// without rejecting an otherwise-valid breakdown over a cosmetic slip.
fn non_empty_or_generated(id: String) -> String {
    if id.trim().is_empty() {
        uuid::Uuid::new_v4().to_string()
    } else {
        id
    }
}

pub async fn run(ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome, PhaseError> {
    let plan_summary = ctx
        .state
        .plan
        .milestones
        .iter()
        .map(|m| format!("- [{}] {}: {}", m.id, m.title, m.description))
        .collect::<Vec<_>>()
        .join("\n");

    let prompt = format!(
        "You are the Staff Engineer. Break the following milestone plan into an ordered \
         sequence of batches of developer tasks. Tasks within a batch that touch disjoint \
         files may be marked parallel; batches always run in order. Respond with \
         '=== TASK COMPLETE ===' followed by a fenced JSON block of the shape \
         {{\"batches\": [{{\"batch_id\": str, \"parallel\": bool, \"max_parallel_tasks\": int|null, \
         \"description\": str, \"tasks\": [{{\"id\": str, \"title\": str, \"description\": str, \
         \"target_files\": [str]|null, \"complexity\": \"simple\"|\"moderate\"|\"complex\"|\"very_complex\", \
         \"hint\": str}}]}}]}}.\n\n# Milestones\n\n{plan_summary}"
    );

    let (raw_output, _next_staff_id) =
        run_turn_with_handoff(ctx, PHASE_NAME, Role::Staff, "Staff Engineer", prompt).await?;

    let batches = match ProtocolParser::extract_json::<RawBatches>(&raw_output, None) {
        Ok(raw) if !raw.batches.is_empty() => raw.batches,
        _ => match ProtocolParser::extract_json::<RawLegacyTasks>(&raw_output, None) {
            Ok(legacy) if !legacy.tasks.is_empty() => vec![RawBatch {
                batch_id: String::new(),
                parallel: false,
                max_parallel_tasks: None,
                description: "Converted from a flat legacy task list".to_string(),
                tasks: legacy.tasks,
            }],
            _ => {
                return Err(PhaseError::Protocol {
                    phase: PHASE_NAME.to_string(),
                    source: ProtocolError::MissingField("batches"),
                })
            }
        },
    };

    ctx.state.batches = batches
        .into_iter()
        .map(|b| Batch {
            batch_id: non_empty_or_generated(b.batch_id),
            parallel: b.parallel,
            max_parallel_tasks: b.max_parallel_tasks,
            description: b.description,
            status: WorkStatus::Pending,
            tasks: b
                .tasks
                .into_iter()
                .map(|t| Task {
                    id: non_empty_or_generated(t.id),
                    title: t.title,
                    description: t.description,
                    target_files: t.target_files,
                    complexity: t.complexity,
                    hint: t.hint,
                    status: WorkStatus::Pending,
                    assigned_to: None,
                    retry_count: 0,
                    max_retries: 2,
                    last_failure_reason: None,
                })
                .collect(),
        })
        .collect();
    ctx.state.current_batch_index = 0;
    ctx.state.complete_phase(Phase::TaskBreakdown);

    Ok(PhaseOutcome::Advance)
}
