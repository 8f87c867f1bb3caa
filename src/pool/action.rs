//! Job actions and the registry that rebuilds them from snapshots.

use super::error::PoolError;
use super::job::Job;
use super::link::{LinkError, WorkerLink};
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Reason a job action rejected.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{0}")]
pub struct JobFailure(pub String);

impl JobFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

impl From<LinkError> for JobFailure {
    fn from(err: LinkError) -> Self {
        Self(err.to_string())
    }
}

pub type ActionFuture = BoxFuture<'static, Result<Value, JobFailure>>;

/// The asynchronous unit of work attached to a job.
///
/// Actions are described by a `kind` tag and JSON `params` so that a queued
/// job can be persisted and rebuilt through an [`ActionRegistry`].
pub trait JobAction: Send + Sync {
    fn kind(&self) -> &str;

    fn params(&self) -> Value;

    fn run(&self, job: Arc<Job>, link: Arc<dyn WorkerLink>) -> ActionFuture;
}

type ActionFactory = Arc<dyn Fn(Value) -> Result<Arc<dyn JobAction>, String> + Send + Sync>;

/// Factories keyed by action kind.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    factories: HashMap<String, ActionFactory>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(Value) -> Result<Arc<dyn JobAction>, String> + Send + Sync + 'static,
    {
        self.factories.insert(kind.into(), Arc::new(factory));
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Rebuild an action. Unknown kinds are `AsyncActionMissing`.
    pub fn build(&self, kind: &str, params: Value) -> Result<Arc<dyn JobAction>, PoolError> {
        let factory = self
            .factories
            .get(kind)
            .ok_or(PoolError::AsyncActionMissing)?;
        factory(params).map_err(|reason| PoolError::ArgumentsInvalid {
            field: "params",
            reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    struct EchoAction {
        params: Value,
    }

    impl JobAction for EchoAction {
        fn kind(&self) -> &str {
            "echo"
        }

        fn params(&self) -> Value {
            self.params.clone()
        }

        fn run(&self, _job: Arc<Job>, _link: Arc<dyn WorkerLink>) -> ActionFuture {
            let params = self.params.clone();
            async move { Ok(params) }.boxed()
        }
    }

    fn registry() -> ActionRegistry {
        let mut registry = ActionRegistry::new();
        registry.register("echo", |params| {
            if params.is_object() {
                Ok(Arc::new(EchoAction { params }) as Arc<dyn JobAction>)
            } else {
                Err("expected an object".to_string())
            }
        });
        registry
    }

    #[test]
    fn builds_registered_kind() {
        let action = registry()
            .build("echo", serde_json::json!({"a": 1}))
            .unwrap();
        assert_eq!(action.kind(), "echo");
        assert_eq!(action.params()["a"], 1);
    }

    #[test]
    fn unknown_kind_is_missing_action() {
        let result = registry().build("nope", Value::Null);
        assert!(matches!(result, Err(PoolError::AsyncActionMissing)));
    }

    #[test]
    fn factory_rejection_names_params() {
        let result = registry().build("echo", Value::Null);
        assert!(matches!(
            result,
            Err(PoolError::ArgumentsInvalid {
                field: "params",
                ..
            })
        ));
    }
}
