//! Activity execution context

use uuid::Uuid;

use crate::workflow::ActivityInvocation;

/// What an activity knows about the attempt it is running
#[derive(Debug, Clone)]
pub struct ActivityContext {
    /// Run that scheduled the activity
    pub run_id: Uuid,

    /// Activity ID within the run
    pub activity_id: String,

    /// Registered activity type
    pub activity_type: String,

    /// Current attempt number (1-based)
    pub attempt: u32,

    /// Maximum attempts allowed
    pub max_attempts: u32,

    /// Queue the task was polled from
    pub task_queue: String,
}

impl ActivityContext {
    pub fn new(run_id: Uuid, activity_id: impl Into<String>, invocation: &ActivityInvocation) -> Self {
        Self {
            run_id,
            activity_id: activity_id.into(),
            activity_type: invocation.activity_type.clone(),
            attempt: invocation.attempt,
            max_attempts: invocation.max_attempts(),
            task_queue: invocation.task_queue.clone(),
        }
    }

    /// Whether a failure now is final
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reliability::RetryPolicy;

    fn invocation(attempt: u32) -> ActivityInvocation {
        ActivityInvocation {
            activity_type: "process".to_string(),
            input: serde_json::json!({}),
            attempt,
            retry_policy: RetryPolicy::fixed(std::time::Duration::ZERO, 3),
            task_queue: "default".to_string(),
            start_to_close_timeout: None,
        }
    }

    #[test]
    fn test_activity_context_creation() {
        let run_id = Uuid::now_v7();
        let ctx = ActivityContext::new(run_id, "step-1", &invocation(1));

        assert_eq!(ctx.run_id, run_id);
        assert_eq!(ctx.activity_id, "step-1");
        assert_eq!(ctx.activity_type, "process");
        assert_eq!(ctx.attempt, 1);
        assert_eq!(ctx.max_attempts, 3);
        assert!(!ctx.is_last_attempt());
    }

    #[test]
    fn test_is_last_attempt() {
        let ctx = ActivityContext::new(Uuid::now_v7(), "step-1", &invocation(3));
        assert!(ctx.is_last_attempt());
    }
}
