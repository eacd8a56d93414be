//! Activity registry
//!
//! Maps activity type names to type-erased async handlers. Handlers take and
//! return JSON so the executor never needs the concrete activity types.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use super::{Activity, ActivityContext, ActivityError};

/// Future returned by an activity handler
pub type ActivityFuture = Pin<Box<dyn Future<Output = Result<Value, ActivityError>> + Send>>;

/// Type-erased activity handler
pub type ActivityHandler = Arc<dyn Fn(ActivityContext, Value) -> ActivityFuture + Send + Sync>;

/// Registry of activity handlers
#[derive(Clone, Default)]
pub struct ActivityRegistry {
    handlers: HashMap<String, ActivityHandler>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an [`Activity`] implementation under `A::TYPE`
    ///
    /// Input that does not deserialize into `A::Input` fails the attempt with
    /// a non-retryable `invalid_input` error.
    pub fn register<A: Activity>(&mut self, activity: A) {
        let activity = Arc::new(activity);
        let handler: ActivityHandler =
            Arc::new(move |ctx: ActivityContext, input: Value| -> ActivityFuture {
                let activity = Arc::clone(&activity);
                Box::pin(async move {
                    let typed: A::Input = serde_json::from_value(input).map_err(|e| {
                        ActivityError::non_retryable(format!(
                            "invalid input for activity {}: {e}",
                            A::TYPE
                        ))
                        .with_type("invalid_input")
                    })?;

                    let output = activity.execute(&ctx, typed).await?;

                    serde_json::to_value(output).map_err(|e| {
                        ActivityError::non_retryable(format!(
                            "failed to serialize output of activity {}: {e}",
                            A::TYPE
                        ))
                        .with_type("serialization")
                    })
                })
            });

        self.handlers.insert(A::TYPE.to_string(), handler);
    }

    /// Register a closure working directly on JSON
    ///
    /// # Example
    ///
    /// ```ignore
    /// registry.register_fn("echo", |_ctx, input| async move { Ok(input) });
    /// ```
    pub fn register_fn<F, Fut>(&mut self, activity_type: impl Into<String>, handler: F)
    where
        F: Fn(ActivityContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ActivityError>> + Send + 'static,
    {
        let handler: ActivityHandler =
            Arc::new(move |ctx: ActivityContext, input: Value| -> ActivityFuture {
                Box::pin(handler(ctx, input))
            });
        self.handlers.insert(activity_type.into(), handler);
    }

    pub fn get(&self, activity_type: &str) -> Option<ActivityHandler> {
        self.handlers.get(activity_type).cloned()
    }

    pub fn contains(&self, activity_type: &str) -> bool {
        self.handlers.contains_key(activity_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn activity_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for ActivityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityRegistry")
            .field("activity_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
