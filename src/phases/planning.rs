//! Planning: the CEO agent reads the requirements doc and produces an
//! ordered [`crate::model::Plan`] of milestones.

use serde::Deserialize;

use crate::errors::PhaseError;
use crate::model::{Milestone, Phase, Plan, Role};
use crate::protocol::ProtocolParser;

use super::{run_turn_with_handoff, PhaseContext, PhaseOutcome};

#[derive(Deserialize)]
struct RawPlan {
    milestones: Vec<RawMilestone>,
}

#[derive(Deserialize)]
struct RawMilestone {
    id: String,
    title: String,
    #[serde(default)]
    description: String,
}

const PHASE_NAME: &str = "planning";

pub async fn run(ctx: &mut PhaseContext<'_>) -> Result<PhaseOutcome, PhaseError> {
    let requirements = std::fs::read_to_string(&ctx.state.requirements_path).unwrap_or_default();
    let guidance = ctx.state.pending_guidance.take();

    let guidance_section = guidance
        .as_deref()
        .map(|g| format!("\n\n# Guidance from an external operator\n\n{g}"))
        .unwrap_or_default();

    let prompt = format!(
        "You are the CEO of an autonomous development organization. Read the requirements \
         below and produce a plan: an ordered list of milestones that together satisfy the \
         requirements. Respond with '=== TASK COMPLETE ===' followed by a fenced JSON block \
         of the shape {{\"milestones\": [{{\"id\": str, \"title\": str, \"description\": str}}]}}.\n\n\
         # Requirements\n\n{requirements}{guidance_section}"
    );

    let (raw_output, _next_ceo_id) =
        run_turn_with_handoff(ctx, PHASE_NAME, Role::Ceo, "CEO", prompt).await?;

    // A missing or empty `milestones` block never fails the phase: the
    // downstream Task-Breakdown agent can work from the requirements text
    // verbatim via a single catch-all milestone.
    let milestones = ProtocolParser::extract_json::<RawPlan>(&raw_output, None)
        .ok()
        .map(|raw| raw.milestones)
        .filter(|m| !m.is_empty())
        .map(|raw| {
            raw.into_iter()
                .map(|m| Milestone {
                    id: m.id,
                    title: m.title,
                    description: m.description,
                })
                .collect()
        })
        .unwrap_or_else(|| {
            vec![Milestone {
                id: "m0".to_string(),
                title: "Satisfy the requirements".to_string(),
                description: requirements,
            }]
        });

    ctx.state.plan = Plan { milestones };
    ctx.state.complete_phase(Phase::Planning);

    Ok(PhaseOutcome::Advance)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_plan_deserializes_minimal_milestone() {
        let json = r#"{"milestones": [{"id": "m1", "title": "Auth"}]}"#;
        let plan: RawPlan = serde_json::from_str(json).unwrap();
        assert_eq!(plan.milestones[0].description, "");
    }

    #[test]
    fn missing_milestones_block_falls_back_to_a_single_milestone() {
        let parsed = ProtocolParser::extract_json::<RawPlan>("no JSON here at all", None);
        assert!(parsed.is_err());
    }

    #[test]
    fn empty_milestones_array_is_treated_the_same_as_missing() {
        let raw: RawPlan = serde_json::from_str(r#"{"milestones": []}"#).unwrap();
        assert!(raw.milestones.is_empty());
    }

    #[test]
    fn pending_guidance_is_taken_so_it_only_folds_into_one_planning_prompt() {
        let mut state = crate::model::PersistedState::new("REQUIREMENTS.md", false);
        state.pending_guidance = Some("ship mobile first".to_string());
        let taken = state.pending_guidance.take();
        assert_eq!(taken.as_deref(), Some("ship mobile first"));
        assert!(state.pending_guidance.is_none());
    }
}
