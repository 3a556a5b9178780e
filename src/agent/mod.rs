//! Agent identity and subprocess execution.

pub mod session;
pub mod stream;

pub use session::{AgentSession, TurnOutcome};

use std::collections::HashMap;

use crate::model::{Agent, AgentStatus, Role};

/// Tracks the live generation of each singleton role (CEO, Staff, QA) and
/// the set of currently-active Developers.
///
/// A handoff replaces an agent with a new generation under a new id
/// (`"{role}-{generation}"`); the registry is what lets the orchestrator
/// redirect work addressed to a stale id to its successor.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    generations: HashMap<Role, u32>,
    agents: HashMap<String, Agent>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next id for `role` (e.g. `"staff-2"` if `"staff-1"`
    /// already exists) and registers a fresh [`Agent`] under it.
    pub fn spawn(&mut self, role: Role, display_name: impl Into<String>) -> &Agent {
        let generation = self.generations.entry(role).or_insert(0);
        *generation += 1;
        let id = format!("{}-{}", role.id_prefix(), generation);
        let agent = Agent::new(id.clone(), role, display_name);
        self.agents.insert(id.clone(), agent);
        self.agents.get(&id).expect("just inserted")
    }

    /// Replaces `predecessor_id` with a new generation of the same role,
    /// carrying forward the same display name. Used after a handoff.
    pub fn replace(&mut self, predecessor_id: &str) -> Option<&Agent> {
        let predecessor = self.agents.get(predecessor_id)?.clone();
        Some(self.spawn(predecessor.role, predecessor.display_name))
    }

    pub fn get(&self, id: &str) -> Option<&Agent> {
        self.agents.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Agent> {
        self.agents.get_mut(id)
    }

    /// Current (highest-generation) id for a singleton role, if any agent
    /// of that role has ever been spawned.
    pub fn current_id_for(&self, role: Role) -> Option<String> {
        let generation = *self.generations.get(&role)?;
        Some(format!("{}-{}", role.id_prefix(), generation))
    }

    pub fn status_snapshot(&self) -> HashMap<String, AgentStatus> {
        self.agents
            .iter()
            .map(|(id, agent)| (id.clone(), agent.status))
            .collect()
    }

    pub fn all(&self) -> impl Iterator<Item = &Agent> {
        self.agents.values()
    }

    /// Ids of `role` agents created by a prior [`Self::replace`] that have
    /// never taken a turn (`started_at.is_none()`) — a handoff's successor
    /// sitting idle because no subsequent phase pass has claimed it yet.
    /// Ordered by generation so the oldest replacement is claimed first.
    pub fn pending_continuations(&self, role: Role) -> Vec<String> {
        let mut ids: Vec<&Agent> = self
            .agents
            .values()
            .filter(|a| a.role == role && a.started_at.is_none() && a.status == AgentStatus::Idle)
            .collect();
        ids.sort_by_key(|a| generation_of(&a.id));
        ids.into_iter().map(|a| a.id.clone()).collect()
    }
}

/// Parses the numeric generation suffix off a role-prefixed agent id
/// (`"dev-3"` -> `3`), falling back to `0` for anything unexpected so a
/// malformed id sorts first rather than panicking.
fn generation_of(id: &str) -> u32 {
    id.rsplit('-').next().and_then(|s| s.parse().ok()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_increments_generation_per_role() {
        let mut registry = AgentRegistry::new();
        let first = registry.spawn(Role::Staff, "Staff Engineer").id.clone();
        let second_role_first = registry.spawn(Role::Developer, "Developer").id.clone();
        assert_eq!(first, "staff-1");
        assert_eq!(second_role_first, "dev-1");
    }

    #[test]
    fn replace_allocates_next_generation_of_same_role() {
        let mut registry = AgentRegistry::new();
        let original = registry.spawn(Role::Staff, "Staff Engineer").id.clone();
        let replacement = registry.replace(&original).unwrap();
        assert_eq!(replacement.id, "staff-2");
        assert_eq!(replacement.role, Role::Staff);
        assert_eq!(registry.current_id_for(Role::Staff).unwrap(), "staff-2");
        // the predecessor's own record is untouched
        assert!(registry.get(&original).is_some());
    }

    #[test]
    fn replace_of_unknown_id_returns_none() {
        let mut registry = AgentRegistry::new();
        assert!(registry.replace("nonexistent").is_none());
    }

    #[test]
    fn pending_continuations_lists_unstarted_replacements_oldest_first() {
        let mut registry = AgentRegistry::new();
        let dev1 = registry.spawn(Role::Developer, "Developer").id.clone();
        registry.get_mut(&dev1).unwrap().started_at = Some(chrono::Utc::now());
        let dev2 = registry.replace(&dev1).unwrap().id.clone();
        let _dev3 = registry.replace(&dev2).unwrap().id.clone();

        let pending = registry.pending_continuations(Role::Developer);
        assert_eq!(pending, vec!["dev-2".to_string(), "dev-3".to_string()]);
    }
}
