//! Memory key namespace.
//!
//! ```text
//! {root}/tasks/{id}/state|lock|progress|agents/{agent_id}
//! {root}/workers/{id}/status|heartbeat|capacity
//! {root}/coordination/queue|assignments|metrics
//! ```

#[must_use]
pub fn task_state(root: &str, task_id: &str) -> String {
    format!("{root}/tasks/{task_id}/state")
}

#[must_use]
pub fn task_lock(root: &str, task_id: &str) -> String {
    format!("{root}/tasks/{task_id}/lock")
}

#[must_use]
pub fn task_progress(root: &str, task_id: &str) -> String {
    format!("{root}/tasks/{task_id}/progress")
}

#[must_use]
pub fn task_agent(root: &str, task_id: &str, agent_id: &str) -> String {
    format!("{root}/tasks/{task_id}/agents/{agent_id}")
}

#[must_use]
pub fn worker_status(root: &str, worker_id: &str) -> String {
    format!("{root}/workers/{worker_id}/status")
}

#[must_use]
pub fn worker_heartbeat(root: &str, worker_id: &str) -> String {
    format!("{root}/workers/{worker_id}/heartbeat")
}

#[must_use]
pub fn worker_capacity(root: &str, worker_id: &str) -> String {
    format!("{root}/workers/{worker_id}/capacity")
}

/// Glob matching every worker's heartbeat key.
#[must_use]
pub fn all_worker_heartbeats(root: &str) -> String {
    format!("{root}/workers/*/heartbeat")
}

#[must_use]
pub fn coordination_queue(root: &str) -> String {
    format!("{root}/coordination/queue")
}

#[must_use]
pub fn coordination_assignments(root: &str) -> String {
    format!("{root}/coordination/assignments")
}

#[must_use]
pub fn coordination_metrics(root: &str) -> String {
    format!("{root}/coordination/metrics")
}

/// Worker id embedded in a `{root}/workers/{id}/...` key.
#[must_use]
pub fn worker_id_of<'a>(root: &str, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(root)?
        .strip_prefix("/workers/")?
        .split('/')
        .next()
        .filter(|id| !id.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::pattern::KeyPattern;

    #[test]
    fn test_layout() {
        assert_eq!(task_lock("muster", "t1"), "muster/tasks/t1/lock");
        assert_eq!(task_agent("muster", "t1", "a1"), "muster/tasks/t1/agents/a1");
        assert_eq!(worker_capacity("muster", "w1"), "muster/workers/w1/capacity");
        assert_eq!(coordination_assignments("muster"), "muster/coordination/assignments");
    }

    #[test]
    fn test_heartbeat_glob_matches_only_heartbeats() -> crate::Result<()> {
        let glob = KeyPattern::new(&all_worker_heartbeats("muster"))?;
        assert!(glob.matches(&worker_heartbeat("muster", "w1")));
        assert!(!glob.matches(&worker_status("muster", "w1")));
        Ok(())
    }

    #[test]
    fn test_worker_id_of() {
        assert_eq!(worker_id_of("muster", "muster/workers/w1/heartbeat"), Some("w1"));
        assert_eq!(worker_id_of("muster", "muster/tasks/t1/state"), None);
        assert_eq!(worker_id_of("other", "muster/workers/w1/heartbeat"), None);
    }
}
