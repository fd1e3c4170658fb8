//! Submission helpers
//!
//! Package an operation name and its arguments into a task without
//! building a [`TaskSpec`] by hand, fan a list of inputs out as parallel
//! tasks, or chain tasks into a [`Pipeline`].

use std::time::Duration;

use futures::future::try_join_all;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::handle::TaskHandle;
use crate::task::{Payload, TaskSpec};
use crate::worker::{Orchestrator, OrchestratorError};

fn to_args<A: Serialize + ?Sized>(args: &A) -> Result<Value, OrchestratorError> {
    serde_json::to_value(args).map_err(|e| OrchestratorError::Serialization(e.to_string()))
}

/// Builder returned by [`Orchestrator::task`]
///
/// The resource type defaults to the operation name.
#[derive(Debug, Clone)]
pub struct TaskBuilder<'a> {
    orchestrator: &'a Orchestrator,
    spec: TaskSpec,
    enqueue_deadline: Option<Duration>,
}

impl<'a> TaskBuilder<'a> {
    fn new(orchestrator: &'a Orchestrator, operation: String) -> Self {
        Self {
            orchestrator,
            spec: TaskSpec::new(operation.clone(), Payload::operation(operation)),
            enqueue_deadline: None,
        }
    }

    pub fn args(mut self, args: Value) -> Self {
        self.spec.payload.args = args;
        self
    }

    pub fn resource(mut self, resource_type: impl Into<String>) -> Self {
        self.spec.resource_type = resource_type.into();
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.spec = self.spec.with_priority(priority);
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.spec = self.spec.with_max_attempts(max_attempts);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.spec = self.spec.with_timeout(timeout);
        self
    }

    /// Bound how long submission may block on a full queue
    pub fn enqueue_deadline(mut self, deadline: Duration) -> Self {
        self.enqueue_deadline = Some(deadline);
        self
    }

    /// The spec this builder would submit
    pub fn spec(&self) -> &TaskSpec {
        &self.spec
    }

    pub async fn submit(self) -> Result<TaskHandle, OrchestratorError> {
        self.orchestrator
            .submit_with_deadline(self.spec, self.enqueue_deadline)
            .await
    }

    /// Submit one task per item and wait for all of them
    ///
    /// Results come back in input order. The first failure is returned and
    /// the remaining tasks are cancelled.
    pub async fn parallel_map<I, A>(
        self,
        items: I,
        wait: Duration,
    ) -> Result<Vec<Value>, OrchestratorError>
    where
        I: IntoIterator<Item = A>,
        A: Serialize,
    {
        let specs = items
            .into_iter()
            .map(|item| {
                let mut spec = self.spec.clone();
                spec.payload.args = to_args(&item)?;
                Ok(spec)
            })
            .collect::<Result<Vec<_>, OrchestratorError>>()?;
        fan_out(self.orchestrator, specs, self.enqueue_deadline, wait).await
    }
}

impl Orchestrator {
    /// Start building a task for `operation`
    pub fn task(&self, operation: impl Into<String>) -> TaskBuilder<'_> {
        TaskBuilder::new(self, operation.into())
    }

    /// Submit `operation` with any serializable arguments
    pub async fn submit_call<A: Serialize + ?Sized>(
        &self,
        operation: impl Into<String>,
        args: &A,
    ) -> Result<TaskHandle, OrchestratorError> {
        self.task(operation).args(to_args(args)?).submit().await
    }
}

async fn fan_out(
    orchestrator: &Orchestrator,
    specs: Vec<TaskSpec>,
    enqueue_deadline: Option<Duration>,
    wait: Duration,
) -> Result<Vec<Value>, OrchestratorError> {
    let mut handles = Vec::with_capacity(specs.len());
    for spec in specs {
        match orchestrator.submit_with_deadline(spec, enqueue_deadline).await {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                cancel_all(&handles).await;
                return Err(e);
            }
        }
    }

    match try_join_all(handles.iter().map(|h| h.wait(wait))).await {
        Ok(values) => Ok(values),
        Err(e) => {
            cancel_all(&handles).await;
            Err(e.into())
        }
    }
}

async fn cancel_all(handles: &[TaskHandle]) {
    for handle in handles {
        handle.cancel().await;
    }
}

#[derive(Debug, Clone)]
struct Stage {
    spec: TaskSpec,
    parallel: bool,
}

/// Tasks run one after another, each stage receiving the previous result
///
/// A parallel stage given a JSON array runs one task per element and
/// passes the array of results on.
///
/// # Example
///
/// ```no_run
/// use hackgpt_orchestrator::{Orchestrator, Payload, Pipeline, TaskSpec};
/// use serde_json::json;
/// use std::time::Duration;
///
/// # async fn run(orchestrator: Orchestrator) -> Result<(), Box<dyn std::error::Error>> {
/// let report = Pipeline::new()
///     .stage(TaskSpec::new("nmap", Payload::operation("discover_hosts")))
///     .parallel_stage(TaskSpec::new("nmap", Payload::operation("port_scan")))
///     .stage(TaskSpec::new("openai", Payload::operation("summarize")))
///     .run(&orchestrator, json!({"cidr": "10.0.0.0/24"}), Duration::from_secs(600))
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a stage; its payload args are replaced by the stage input
    pub fn stage(mut self, spec: TaskSpec) -> Self {
        self.stages.push(Stage {
            spec,
            parallel: false,
        });
        self
    }

    pub fn parallel_stage(mut self, spec: TaskSpec) -> Self {
        self.stages.push(Stage {
            spec,
            parallel: true,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run every stage; `wait` bounds each stage
    pub async fn run(
        &self,
        orchestrator: &Orchestrator,
        input: Value,
        wait: Duration,
    ) -> Result<Value, OrchestratorError> {
        let mut current = input;
        for (index, stage) in self.stages.iter().enumerate() {
            current = match (stage.parallel, current) {
                (true, Value::Array(items)) => {
                    let specs = items
                        .into_iter()
                        .map(|item| stage.with_input(item))
                        .collect();
                    Value::Array(fan_out(orchestrator, specs, None, wait).await?)
                }
                (_, input) => {
                    orchestrator
                        .submit(stage.with_input(input))
                        .await?
                        .wait(wait)
                        .await?
                }
            };
            debug!(
                stage = index,
                operation = %stage.spec.payload.operation,
                "Pipeline stage finished"
            );
        }
        Ok(current)
    }
}

impl Stage {
    fn with_input(&self, input: Value) -> TaskSpec {
        let mut spec = self.spec.clone();
        spec.payload.args = input;
        spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::executor::{ExecutionContext, ExecutorError, ExecutorRegistry};
    use crate::worker::PoolConfig;
    use crate::handle::WaitError;
    use crate::task::TaskErrorKind;
    use serde_json::json;

    async fn orchestrator() -> Orchestrator {
        let mut executors = ExecutorRegistry::new();
        executors
            .register_fn("double", |args: Value, _ctx: ExecutionContext| async move {
                let n = args.as_i64().ok_or_else(|| ExecutorError::permanent("not a number"))?;
                Ok(json!(n * 2))
            })
            .register_fn("range", |args: Value, _ctx: ExecutionContext| async move {
                let n = args.as_u64().unwrap_or(0);
                Ok(json!((1..=n).collect::<Vec<_>>()))
            })
            .register_fn("sum", |args: Value, _ctx: ExecutionContext| async move {
                let items: Vec<i64> = serde_json::from_value(args)?;
                Ok(json!(items.iter().sum::<i64>()))
            });

        let config = OrchestratorConfig::default().with_pool(PoolConfig::fixed(4));
        let orchestrator = Orchestrator::new(config, executors).unwrap();
        orchestrator.start().await.unwrap();
        orchestrator
    }

    #[tokio::test]
    async fn test_builder_defaults_resource_to_operation() {
        let orchestrator = orchestrator().await;
        let builder = orchestrator.task("double").args(json!(4)).priority(7);
        assert_eq!(builder.spec().resource_type, "double");
        assert_eq!(builder.spec().priority, 7);

        let handle = builder.submit().await.unwrap();
        assert_eq!(handle.wait(Duration::from_secs(5)).await.unwrap(), json!(8));
        orchestrator.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_call_serializes_args() {
        let orchestrator = orchestrator().await;
        let handle = orchestrator.submit_call("sum", &[1, 2, 3]).await.unwrap();
        let total: i64 = handle.wait_as(Duration::from_secs(5)).await.unwrap();
        assert_eq!(total, 6);
        orchestrator.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_parallel_map_keeps_order() {
        let orchestrator = orchestrator().await;
        let results = orchestrator
            .task("double")
            .parallel_map(1..=5, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(results, vec![json!(2), json!(4), json!(6), json!(8), json!(10)]);
        orchestrator.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_parallel_map_first_failure_wins() {
        let orchestrator = orchestrator().await;
        let err = orchestrator
            .task("double")
            .parallel_map(vec![json!(1), json!("x"), json!(3)], Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            OrchestratorError::Wait(WaitError::Failed(e)) => {
                assert_eq!(e.kind, TaskErrorKind::Permanent)
            }
            other => panic!("unexpected error: {other}"),
        }
        orchestrator.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_pipeline_fans_out_arrays() {
        let orchestrator = orchestrator().await;
        let pipeline = Pipeline::new()
            .stage(TaskSpec::new("local", Payload::operation("range")))
            .parallel_stage(TaskSpec::new("local", Payload::operation("double")))
            .stage(TaskSpec::new("local", Payload::operation("sum")));
        assert_eq!(pipeline.len(), 3);

        let result = pipeline
            .run(&orchestrator, json!(4), Duration::from_secs(5))
            .await
            .unwrap();
        // (1 + 2 + 3 + 4) * 2
        assert_eq!(result, json!(20));
        orchestrator.shutdown(Duration::from_secs(1)).await.unwrap();
    }
}
