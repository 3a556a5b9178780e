//! CEO-Approval: the CEO agent signs off on the completed milestone, or
//! rejects it with feedback, triggering a full rewind back to Development.
//!
//! The single constant [`MAX_CEO_APPROVAL_ATTEMPTS`] resolves an
//! Open Question about two previously-duplicated retry-count constants —
//! both the phase runner and `Orchestrator`'s rewind bookkeeping read from
//! here.

use serde::Deserialize;

use crate::errors::PhaseError;
use crate::model::{Phase, Role};
use crate::protocol::ProtocolParser;

use super::{run_turn_with_handoff, PhaseContext, PhaseOutcome};

const PHASE_NAME: &str = "ceo-approval";

/// See module docs: the single source of truth for CEO-Approval retry budget.
pub const MAX_CEO_APPROVAL_ATTEMPTS: u32 = 3;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
enum Decision {
    Approve,
    Reject,
}

#[derive(Debug, Deserialize)]
struct RequiredChange {
    priority: String,
    what: String,
    #[serde(default)]
    #[allow(dead_code)]
    why: String,
    #[serde(default, rename = "where")]
    location: String,
    how: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDecision {
    decision: Decision,
    #[serde(default)]
    #[allow(dead_code)]
    confidence: f64,
    #[serde(default)]
    #[allow(dead_code)]
    summary: String,
    #[serde(default)]
    required_changes: Vec<RequiredChange>,
}

/// `[PRIORITY] where: what — how`, newline-joined across every required
/// change — the `ceoFeedback` wire format expected on rejection.
fn format_feedback(changes: &[RequiredChange]) -> String {
    changes
        .iter()
        .map(|c| {
            format!(
                "[{}] {}: {} — {}",
                c.priority.to_uppercase(),
                c.location,
                c.what,
                c.how
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub async fn run(ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome, PhaseError> {
    let milestone_summary = ctx
        .state
        .plan
        .milestones
        .iter()
        .map(|m| format!("- [{}] {}", m.id, m.title))
        .collect::<Vec<_>>()
        .join("\n");

    let test_tail = ctx.state.last_test_output.as_deref().unwrap_or("(none)");
    let qa_tail = ctx.state.last_qa_output.as_deref().unwrap_or("(none)");

    let prompt = format!(
        "You are the CEO. Development, testing, and review have completed for the current \
         milestone set. Approve if the work satisfies the milestones, or reject with specific, \
         actionable required changes if it doesn't. Respond with '=== TASK COMPLETE ===' \
         followed by a fenced JSON block of the shape {{\"decision\": \"APPROVE\"|\"REJECT\", \
         \"confidence\": number, \"summary\": str, \"requiredChanges\": \
         [{{\"priority\": str, \"what\": str, \"why\": str, \"where\": str, \"how\": str}}]}}.\
         \n\nMilestones:\n{milestone_summary}\n\nLast test output:\n{test_tail}\n\n\
         Last QA output:\n{qa_tail}"
    );

    let (raw_output, _next_ceo_id) =
        run_turn_with_handoff(ctx, PHASE_NAME, Role::Ceo, "CEO", prompt).await?;

    let decision: RawDecision = ProtocolParser::extract_json(&raw_output, None).map_err(|source| {
        PhaseError::Protocol {
            phase: PHASE_NAME.to_string(),
            source,
        }
    })?;

    ctx.state.ceo_approval_attempts += 1;

    if matches!(decision.decision, Decision::Approve) {
        ctx.state.ceo_feedback = None;
        ctx.state.complete_phase(Phase::CeoApproval);
        ctx.state.complete_phase(Phase::Complete);
        return Ok(PhaseOutcome::Advance);
    }

    let feedback = format_feedback(&decision.required_changes);
    ctx.state.ceo_feedback = Some(feedback.clone());

    if ctx.state.ceo_approval_attempts >= MAX_CEO_APPROVAL_ATTEMPTS {
        let question = format!(
            "CEO rejected the milestone {} times; latest feedback: {feedback}",
            ctx.state.ceo_approval_attempts
        );
        let _ = ctx.db.enqueue_human_question(PHASE_NAME, None, &question);
        return Err(PhaseError::Blocked {
            phase: PHASE_NAME.to_string(),
            reason: question,
        });
    }

    ctx.state.rewind_for_rejection();
    Ok(PhaseOutcome::Rewind { feedback })
}
