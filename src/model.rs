//! Core data model: agents, plans, batches, tasks, handoffs, and the
//! persisted orchestration state.
//!
//! Every invariant named on these types is enforced by the owning component
//! (`Orchestrator`, `WorkStealQueue`, `StateStore`), not by the types
//! themselves — the types here are plain data, serializable end to end so
//! they can round-trip through `state.json` and `autonoma.db`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Current on-disk state schema version. `StateStore` migrates anything
/// older than this up to it; anything newer is reported as "no state".
pub const STATE_VERSION: u32 = 7;

/// Role an agent plays in the hierarchy. Exactly one CEO, one Staff, and one
/// QA are alive across the orchestration's lifetime; Developers come and go
/// per Development batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Ceo,
    Staff,
    Developer,
    Qa,
    E2e,
}

impl Role {
    /// Stable prefix embedded in every id of this role, so the orchestrator
    /// can redirect a prompt targeting a replaced predecessor to the
    /// current-generation agent.
    pub fn id_prefix(&self) -> &'static str {
        match self {
            Role::Ceo => "ceo",
            Role::Staff => "staff",
            Role::Developer => "dev",
            Role::Qa => "qa",
            Role::E2e => "e2e",
        }
    }

    /// Whether agents of this role may write to the working directory.
    pub fn can_write(&self) -> bool {
        matches!(self, Role::Developer | Role::Qa | Role::E2e)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id_prefix())
    }
}

/// Lifecycle state of a single agent subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Idle,
    Running,
    Complete,
    Error,
}

/// Cumulative token usage reported by an agent subprocess.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// One agent: identity, capability, and mutable runtime state.
///
/// `id` is generated by the owning registry as `"{role}-{generation}"` so a
/// replaced predecessor's id never collides with its successor's, while both
/// carry the same `role` and `display_name`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub role: Role,
    pub display_name: String,
    pub status: AgentStatus,
    pub token_usage: TokenUsage,
    pub last_output: String,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Agent {
    pub fn new(id: impl Into<String>, role: Role, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            display_name: display_name.into(),
            status: AgentStatus::Idle,
            token_usage: TokenUsage::default(),
            last_output: String::new(),
            started_at: None,
            ended_at: None,
        }
    }
}

/// A high-level objective emitted by the CEO during Planning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Milestone {
    pub id: String,
    pub title: String,
    pub description: String,
}

/// An ordered sequence of milestones, owned by the CEO.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    pub milestones: Vec<Milestone>,
}

/// Status of a batch or task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    #[default]
    Pending,
    Running,
    Complete,
    Failed,
}

/// Developer complexity estimate for a task, as emitted by the Staff
/// Engineer during Task-Breakdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    #[default]
    Moderate,
    Complex,
    VeryComplex,
}

/// A single developer task within a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_files: Option<Vec<String>>,
    #[serde(default)]
    pub complexity: Complexity,
    #[serde(default)]
    pub hint: String,
    #[serde(default)]
    pub status: WorkStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_reason: Option<String>,
}

fn default_max_retries() -> u32 {
    2
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: description.into(),
            target_files: None,
            complexity: Complexity::default(),
            hint: String::new(),
            status: WorkStatus::default(),
            assigned_to: None,
            retry_count: 0,
            max_retries: default_max_retries(),
            last_failure_reason: None,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Returns true if this task's target files overlap with `other`'s.
    pub fn conflicts_with(&self, other: &Task) -> bool {
        match (&self.target_files, &other.target_files) {
            (Some(a), Some(b)) => a.iter().any(|f| b.contains(f)),
            _ => false,
        }
    }
}

/// A totally-ordered unit of scheduling. A later batch may only begin once
/// the previous batch's status is `Complete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: String,
    pub parallel: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel_tasks: Option<usize>,
    pub description: String,
    #[serde(default)]
    pub status: WorkStatus,
    pub tasks: Vec<Task>,
}

impl Batch {
    /// Number of developer subprocesses this batch should run:
    /// `parallel ? (maxParallelTasks ?? |pending|) : 1`.
    pub fn developer_count(&self) -> usize {
        let pending = self
            .tasks
            .iter()
            .filter(|t| matches!(t.status, WorkStatus::Pending | WorkStatus::Running))
            .count()
            .max(1);
        if self.parallel {
            self.max_parallel_tasks.unwrap_or(pending).max(1)
        } else {
            1
        }
    }

    pub fn is_complete(&self) -> bool {
        self.tasks.iter().all(|t| t.status == WorkStatus::Complete)
    }

    pub fn recompute_status(&mut self) {
        if self.tasks.iter().all(|t| t.status == WorkStatus::Complete) {
            self.status = WorkStatus::Complete;
        } else if self.tasks.iter().any(|t| t.status == WorkStatus::Failed) {
            self.status = WorkStatus::Failed;
        }
    }
}

/// A structured continuation record written when an agent hands off mid-task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handoff {
    pub predecessor_id: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub final_token_usage: TokenUsage,
    pub continuation: ContinuationBlock,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replacement_agent_id: Option<String>,
    /// SHA-256 of the continuation block's serialized form, computed at
    /// write time. Lets a reader of `handoffs.jsonl` (e.g. after a crash
    /// mid-write) tell a truncated trailing record from a genuine one
    /// without re-running the agent that produced it.
    #[serde(default)]
    pub content_hash: String,
}

/// The structured continuation block parsed from an agent's handoff output,
/// or the "minimal" fallback (identity + token usage only) when the agent's
/// output lacked one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContinuationBlock {
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub files_to_touch: Vec<String>,
    #[serde(default)]
    pub current_state: String,
    #[serde(default)]
    pub blockers: Vec<String>,
    #[serde(default)]
    pub next_steps: Vec<String>,
    #[serde(default)]
    pub context: String,
    /// `true` when nothing but identity/usage could be recovered — the
    /// "minimal handoff" shape.
    #[serde(default)]
    pub minimal: bool,
}

/// One criterion's outcome from a verification run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriterionType {
    TestsPass,
    BuildSucceeds,
    LintClean,
    TypesCheck,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub criterion: CriterionType,
    pub required: bool,
    pub passed: bool,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub output: String,
    pub command: String,
}

/// Externally observable, eventually-consistent status snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusFile {
    pub phase: Phase,
    pub iteration: u64,
    pub progress_completed: usize,
    pub progress_total: usize,
    pub agents: HashMap<String, AgentStatus>,
    pub last_update: DateTime<Utc>,
}

/// A node in the phase state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    #[default]
    Idle,
    Planning,
    TaskBreakdown,
    Development,
    Testing,
    Review,
    CeoApproval,
    Complete,
    Failed,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());
        write!(f, "{s}")
    }
}

/// The four mutable phases a CEO rejection rewinds.
pub const REWOUND_PHASES: [Phase; 4] = [
    Phase::Development,
    Phase::Testing,
    Phase::Review,
    Phase::CeoApproval,
];

/// Top-level persisted orchestration state (schema version 4).
///
/// Invariants: requirements content is never persisted, only
/// `requirements_path`; project-context content is never persisted, only
/// `has_project_context`; `completed_phases` only grows except on CEO
/// rejection, which atomically removes [`REWOUND_PHASES`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub phase: Phase,
    pub requirements_path: String,
    pub has_project_context: bool,
    pub plan: Plan,
    pub batches: Vec<Batch>,
    pub current_batch_index: usize,
    pub current_tasks_in_progress: Vec<String>,
    pub completed_phases: BTreeSet<Phase>,
    pub last_test_output: Option<String>,
    pub last_qa_output: Option<String>,
    pub ceo_approval_attempts: u32,
    pub ceo_feedback: Option<String>,
    pub handoffs: Vec<Handoff>,
    pub total_loop_iterations: u64,
    /// Review rounds consumed against `MAX_REVIEW_ROUNDS` since the current
    /// batch set last entered Review; reset to 0 on pass or on a fresh CEO
    /// rewind ("up to two review rounds" per batch set).
    pub review_rounds: u32,
    /// Set when the orchestrator has consumed an external `guidance.txt`
    /// rendezvous file but hasn't yet run Planning with it; cleared once
    /// Planning folds it into the next plan prompt.
    pub pending_guidance: Option<String>,
    /// Extra project documents named at `adopt` time (beyond the
    /// requirements document itself), enumerated into Planning's context
    /// section alongside `has_project_context`'s auto-discovered set.
    pub context_paths: Vec<String>,
}

impl PersistedState {
    pub fn new(requirements_path: impl Into<String>, has_project_context: bool) -> Self {
        let now = Utc::now();
        Self {
            version: STATE_VERSION,
            started_at: now,
            updated_at: now,
            phase: Phase::Idle,
            requirements_path: requirements_path.into(),
            has_project_context,
            plan: Plan::default(),
            batches: Vec::new(),
            current_batch_index: 0,
            current_tasks_in_progress: Vec::new(),
            completed_phases: BTreeSet::new(),
            last_test_output: None,
            last_qa_output: None,
            ceo_approval_attempts: 0,
            ceo_feedback: None,
            handoffs: Vec::new(),
            total_loop_iterations: 0,
            review_rounds: 0,
            pending_guidance: None,
            context_paths: Vec::new(),
        }
    }

    /// Idempotent: marking an already-completed phase complete again is a
    /// no-op.
    pub fn complete_phase(&mut self, phase: Phase) {
        self.completed_phases.insert(phase);
        self.updated_at = Utc::now();
    }

    pub fn has_completed(&self, phase: Phase) -> bool {
        self.completed_phases.contains(&phase)
    }

    /// Full rewind on CEO rejection: removes the four
    /// mutable phases from `completed_phases`, rewinds `current_batch_index`
    /// to 0, and resets every batch/task to pending.
    pub fn rewind_for_rejection(&mut self) {
        for phase in REWOUND_PHASES {
            self.completed_phases.remove(&phase);
        }
        self.current_batch_index = 0;
        self.current_tasks_in_progress.clear();
        self.review_rounds = 0;
        for batch in &mut self.batches {
            batch.status = WorkStatus::Pending;
            for task in &mut batch.tasks {
                task.status = WorkStatus::Pending;
                task.assigned_to = None;
            }
        }
        self.updated_at = Utc::now();
    }

    /// An external `guidance.txt` message rewinds further than a CEO
    /// rejection: the plan itself may be wrong, not just its
    /// implementation, so Planning and Task-Breakdown un-complete too.
    /// `pending_guidance` carries the message into the next Planning
    /// prompt; Planning clears it once read.
    pub fn rewind_for_guidance(&mut self, guidance: String) {
        self.pending_guidance = Some(guidance);
        self.completed_phases.remove(&Phase::Planning);
        self.completed_phases.remove(&Phase::TaskBreakdown);
        for phase in REWOUND_PHASES {
            self.completed_phases.remove(&phase);
        }
        self.phase = Phase::Planning;
        self.current_batch_index = 0;
        self.current_tasks_in_progress.clear();
        self.review_rounds = 0;
        self.batches.clear();
        self.updated_at = Utc::now();
    }

    pub fn total_tasks(&self) -> usize {
        self.batches.iter().map(|b| b.tasks.len()).sum()
    }

    pub fn completed_tasks(&self) -> usize {
        self.batches
            .iter()
            .flat_map(|b| &b.tasks)
            .filter(|t| t.status == WorkStatus::Complete)
            .count()
    }
}
