//! In-place `state.json` schema migrations, v1 → [`crate::model::STATE_VERSION`].
//!
//! Each step only adds fields or reshapes what's already present; nothing
//! here ever drops information the running orchestrator still needs to
//! resume correctly.

use serde_json::{json, Value};

use super::MIGRATED_SENTINEL;

/// Applies every migration step needed to bring `raw` from `found_version`
/// up to the current schema, mutating `version` as it goes.
pub fn migrate(raw: &mut Value, found_version: u32) {
    let mut version = found_version;

    if version < 3 {
        // Embedded requirements/project-context content only ever appeared
        // in pre-v3 states; strip it before any other step touches the
        // object so later steps never see the stale blob fields.
        strip_embedded_content(raw);
    }
    if version < 2 {
        migrate_v1_to_v2(raw);
        version = 2;
    }
    if version < 3 {
        migrate_v2_to_v3(raw);
        version = 3;
    }
    if version < 4 {
        migrate_v3_to_v4(raw);
        version = 4;
    }
    if version < 5 {
        migrate_v4_to_v5(raw);
        version = 5;
    }
    if version < 6 {
        migrate_v5_to_v6(raw);
        version = 6;
    }
    if version < 7 {
        migrate_v6_to_v7(raw);
        version = 7;
    }

    if let Some(obj) = raw.as_object_mut() {
        obj.insert("version".to_string(), json!(version));
    }
}

/// An embedded `requirements_content` blob is replaced by
/// a path marker (the existing `requirements_path` if present, otherwise
/// [`MIGRATED_SENTINEL`] — unresumable); an embedded
/// `project_context` blob collapses to a boolean presence flag.
fn strip_embedded_content(raw: &mut Value) {
    let Some(obj) = raw.as_object_mut() else {
        return;
    };

    if obj.remove("requirements_content").is_some() {
        let has_path = obj
            .get("requirements_path")
            .and_then(Value::as_str)
            .map(|s| !s.is_empty())
            .unwrap_or(false);
        if !has_path {
            obj.insert("requirements_path".to_string(), json!(MIGRATED_SENTINEL));
        }
    }

    if obj.remove("project_context").is_some() {
        obj.insert("has_project_context".to_string(), json!(true));
    }
}

/// v1 stored a single flat `tasks: [Task]` array with no batching concept.
/// This is always
/// converted into one sequential, non-parallel batch — no attempt is made
/// to infer independence among the legacy tasks.
fn migrate_v1_to_v2(raw: &mut Value) {
    let Some(obj) = raw.as_object_mut() else {
        return;
    };

    if obj.contains_key("batches") {
        return;
    }

    let legacy_tasks = obj.remove("tasks").unwrap_or_else(|| json!([]));

    obj.insert(
        "batches".to_string(),
        json!([{
            "batch_id": "legacy-batch-0",
            "parallel": false,
            "max_parallel_tasks": null,
            "description": "Migrated from v1 flat task list",
            "status": "pending",
            "tasks": legacy_tasks,
        }]),
    );
    obj.insert("current_batch_index".to_string(), json!(0));
}

/// v2 had no CEO-Approval retry bookkeeping.
fn migrate_v2_to_v3(raw: &mut Value) {
    let Some(obj) = raw.as_object_mut() else {
        return;
    };
    obj.entry("ceo_approval_attempts").or_insert(json!(0));
    obj.entry("ceo_feedback").or_insert(Value::Null);
}

/// v3 had no handoff history and no project-context flag.
fn migrate_v3_to_v4(raw: &mut Value) {
    let Some(obj) = raw.as_object_mut() else {
        return;
    };
    obj.entry("handoffs").or_insert(json!([]));
    obj.entry("total_loop_iterations").or_insert(json!(0));
    obj.entry("has_project_context").or_insert(json!(false));
    obj.entry("current_tasks_in_progress").or_insert(json!([]));
    obj.entry("completed_phases").or_insert(json!([]));
    obj.entry("last_test_output").or_insert(Value::Null);
    obj.entry("last_qa_output").or_insert(Value::Null);
}

/// v4 had no per-cycle review round counter.
fn migrate_v4_to_v5(raw: &mut Value) {
    let Some(obj) = raw.as_object_mut() else {
        return;
    };
    obj.entry("review_rounds").or_insert(json!(0));
}

/// v5 had no slot for an external guidance message awaiting Planning.
fn migrate_v5_to_v6(raw: &mut Value) {
    let Some(obj) = raw.as_object_mut() else {
        return;
    };
    obj.entry("pending_guidance").or_insert(Value::Null);
}

/// v6 had no slot for `adopt`'s extra project-context paths.
fn migrate_v6_to_v7(raw: &mut Value) {
    let Some(obj) = raw.as_object_mut() else {
        return;
    };
    obj.entry("context_paths").or_insert(json!([]));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v1_flat_task_list_becomes_single_sequential_batch() {
        let mut raw = json!({
            "version": 1,
            "started_at": "2026-01-01T00:00:00Z",
            "updated_at": "2026-01-01T00:00:00Z",
            "phase": "idle",
            "requirements_path": "REQUIREMENTS.md",
            "plan": {"milestones": []},
            "tasks": [{"id": "t1", "title": "Do thing", "description": "", "status": "pending", "retry_count": 0, "max_retries": 2}],
        });

        migrate(&mut raw, 1);

        let batches = raw["batches"].as_array().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0]["parallel"], json!(false));
        assert_eq!(batches[0]["tasks"].as_array().unwrap().len(), 1);
        assert_eq!(raw["version"], json!(7));
    }

    #[test]
    fn embedded_requirements_content_without_a_path_becomes_the_migrated_sentinel() {
        let mut raw = json!({
            "version": 1,
            "started_at": "2026-01-01T00:00:00Z",
            "updated_at": "2026-01-01T00:00:00Z",
            "phase": "idle",
            "requirements_content": "Build a thing.",
            "plan": {"milestones": []},
            "tasks": [],
        });

        migrate(&mut raw, 1);

        assert_eq!(raw["requirements_path"], json!(MIGRATED_SENTINEL));
        assert!(raw.get("requirements_content").is_none());
    }

    #[test]
    fn embedded_requirements_content_with_a_path_keeps_the_path() {
        let mut raw = json!({
            "version": 1,
            "started_at": "2026-01-01T00:00:00Z",
            "updated_at": "2026-01-01T00:00:00Z",
            "phase": "idle",
            "requirements_path": "REQUIREMENTS.md",
            "requirements_content": "Build a thing.",
            "plan": {"milestones": []},
            "tasks": [],
        });

        migrate(&mut raw, 1);

        assert_eq!(raw["requirements_path"], json!("REQUIREMENTS.md"));
    }

    #[test]
    fn embedded_project_context_blob_becomes_presence_flag() {
        let mut raw = json!({
            "version": 2,
            "started_at": "2026-01-01T00:00:00Z",
            "updated_at": "2026-01-01T00:00:00Z",
            "phase": "idle",
            "requirements_path": "REQUIREMENTS.md",
            "project_context": {"docs": ["README.md"]},
            "plan": {"milestones": []},
            "batches": [],
            "current_batch_index": 0,
        });

        migrate(&mut raw, 2);

        assert_eq!(raw["has_project_context"], json!(true));
        assert!(raw.get("project_context").is_none());
    }

    #[test]
    fn v3_gains_handoffs_and_iteration_counter() {
        let mut raw = json!({
            "version": 3,
            "started_at": "2026-01-01T00:00:00Z",
            "updated_at": "2026-01-01T00:00:00Z",
            "phase": "idle",
            "requirements_path": "REQUIREMENTS.md",
            "plan": {"milestones": []},
            "batches": [],
            "current_batch_index": 0,
            "ceo_approval_attempts": 1,
            "ceo_feedback": null,
        });

        migrate(&mut raw, 3);

        assert_eq!(raw["handoffs"], json!([]));
        assert_eq!(raw["total_loop_iterations"], json!(0));
        assert_eq!(raw["has_project_context"], json!(false));
        assert_eq!(raw["version"], json!(7));
    }

    #[test]
    fn v4_gains_review_round_counter() {
        let mut raw = json!({
            "version": 4,
            "started_at": "2026-01-01T00:00:00Z",
            "updated_at": "2026-01-01T00:00:00Z",
            "phase": "idle",
            "requirements_path": "REQUIREMENTS.md",
            "plan": {"milestones": []},
            "batches": [],
            "current_batch_index": 0,
            "ceo_approval_attempts": 0,
            "ceo_feedback": null,
            "handoffs": [],
            "total_loop_iterations": 0,
            "has_project_context": false,
        });

        migrate(&mut raw, 4);

        assert_eq!(raw["review_rounds"], json!(0));
        assert_eq!(raw["version"], json!(7));
    }

    #[test]
    fn v5_gains_pending_guidance_slot() {
        let mut raw = json!({
            "version": 5,
            "started_at": "2026-01-01T00:00:00Z",
            "updated_at": "2026-01-01T00:00:00Z",
            "phase": "idle",
            "requirements_path": "REQUIREMENTS.md",
            "plan": {"milestones": []},
            "batches": [],
            "current_batch_index": 0,
            "ceo_approval_attempts": 0,
            "ceo_feedback": null,
            "handoffs": [],
            "total_loop_iterations": 0,
            "has_project_context": false,
            "review_rounds": 0,
        });

        migrate(&mut raw, 5);

        assert_eq!(raw["pending_guidance"], Value::Null);
        assert_eq!(raw["version"], json!(7));
    }

    #[test]
    fn v6_gains_context_paths_slot() {
        let mut raw = json!({
            "version": 6,
            "started_at": "2026-01-01T00:00:00Z",
            "updated_at": "2026-01-01T00:00:00Z",
            "phase": "idle",
            "requirements_path": "REQUIREMENTS.md",
            "plan": {"milestones": []},
            "batches": [],
            "current_batch_index": 0,
            "ceo_approval_attempts": 0,
            "ceo_feedback": null,
            "handoffs": [],
            "total_loop_iterations": 0,
            "has_project_context": false,
            "review_rounds": 0,
            "pending_guidance": null,
        });

        migrate(&mut raw, 6);

        assert_eq!(raw["context_paths"], json!([]));
        assert_eq!(raw["version"], json!(7));
    }

    #[test]
    fn already_current_version_is_left_alone_besides_version_stamp() {
        let mut raw = json!({"version": 7, "foo": "bar"});
        migrate(&mut raw, 7);
        assert_eq!(raw["foo"], json!("bar"));
        assert_eq!(raw["version"], json!(7));
    }
}
