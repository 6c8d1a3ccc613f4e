use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A queued shell command.
///
/// `argv[0]` is the executable path; the remaining entries are its
/// arguments. Jobs are immutable once admitted: the slot set a running job
/// holds is tracked by the allocator, not on the job itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub argv: Vec<String>,
    pub priority: bool,
    /// Number of resource slots the job needs while running.
    pub slots: u32,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(argv: Vec<String>, priority: bool, slots: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            argv,
            priority,
            slots: slots.max(1),
            created_at: Utc::now(),
        }
    }

    /// The executable path, used in log lines to identify the job.
    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or("<empty>")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_defaults_to_one_slot() {
        let job = Job::new(vec!["/bin/true".to_string()], false, 0);
        assert_eq!(job.slots, 1);
        assert!(!job.priority);
        assert_eq!(job.program(), "/bin/true");
    }

    #[test]
    fn job_keeps_argv_order() {
        let argv = vec!["/bin/echo".to_string(), "a".to_string(), "b".to_string()];
        let job = Job::new(argv.clone(), true, 2);
        assert_eq!(job.argv, argv);
        assert_eq!(job.slots, 2);
        assert!(job.priority);
    }
}
