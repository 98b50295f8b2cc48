// Actor execution pipeline
// Runs a resolved step list against the capability invoker

//! # Actor Execution Pipeline
//!
//! Executes an ordered list of [`ChainStep`]s. Each step moves through
//! `Pending → Running → {Succeeded, Failed, Skipped}`.
//!
//! ## Step Rules
//!
//! - An unknown or disabled capability fails the step with `CapabilityDisabled`.
//! - A capability whose `depends_on` entries have not succeeded earlier in the
//!   same run fails the step with `StepFailed`.
//! - `wait_for_result = false` hands the call to the
//!   [`DetachedTaskSupervisor`] and records the step as succeeded with the task id.
//! - `stream = true` forwards partial outputs to the display channel (when the
//!   capability and the invoker both support streaming) and keeps them on the
//!   step result so they survive a later failure.
//! - `on_error`: `fail` and `continue` both record the failure, `retry`
//!   re-attempts while the pipeline-wide retry budget lasts and then behaves
//!   like `fail`.
//! - Only a failed `required` step aborts; every remaining step is skipped. A
//!   non-required step that ends failed never aborts, whatever its `on_error`.
//! - Running past the pipeline deadline aborts with `PipelineAborted`.
//!
//! Outputs of earlier steps are visible to later steps under
//! `context.steps.<function>`.
//!
//! ## Rust Learning Notes:
//!
//! ### Timeouts Without Losing Partial Work
//! `tokio::time::timeout` drops the inner future when time runs out. Partial
//! streaming output is pushed into a `&mut Vec` owned by the caller, so whatever
//! arrived before the timeout is still there after the future is dropped.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::events::{EventBus, OrchestratorEvent};
use super::invoker::{CapabilityInvoker, InvocationOutput, StreamChunk};
use super::registry::RegistrySnapshot;
use super::supervisor::DetachedTaskSupervisor;
use crate::config::OrchestratorConfig;
use crate::models::{
    Capability, CapabilityKey, ChainStep, DisplayMode, ErrorKind, OnError, QueueError, TokenUsage,
};
use crate::{OrchestratorError, Result};

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub step_timeout: Duration,
    pub pipeline_timeout: Duration,
    /// Total re-attempts allowed across all `retry` steps in one run
    pub retry_budget: u32,
}

impl From<&OrchestratorConfig> for PipelineSettings {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            step_timeout: config.step_timeout(),
            pipeline_timeout: config.pipeline_timeout(),
            retry_budget: config.pipeline_retry_budget,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from(&OrchestratorConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedAttempt {
    pub attempt: u32,
    pub error: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub function: CapabilityKey,
    pub state: StepState,
    pub output: Option<Value>,
    pub error: Option<QueueError>,
    pub failed_attempts: Vec<FailedAttempt>,
    /// Partial outputs already delivered, kept even if the step later failed
    pub partials: Vec<Value>,
    pub detached_task_id: Option<Uuid>,
    pub usage: TokenUsage,
    pub target: Option<String>,
    pub duration_ms: u64,
}

impl StepResult {
    fn pending(function: CapabilityKey) -> Self {
        Self {
            function,
            state: StepState::Pending,
            output: None,
            error: None,
            failed_attempts: Vec::new(),
            partials: Vec::new(),
            detached_task_id: None,
            usage: TokenUsage::default(),
            target: None,
            duration_ms: 0,
        }
    }
}

/// Progress surfaced to the caller according to the display mode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DisplayEvent {
    StepStarted { function: CapabilityKey },
    Partial { function: CapabilityKey, chunk: Value },
    StepFinished { function: CapabilityKey, state: StepState },
}

/// Everything a single run needs besides the steps
#[derive(Debug, Clone, Default)]
pub struct PipelineInput {
    pub request_id: Option<Uuid>,
    pub context: Map<String, Value>,
    /// Extracted parameters; step `args` override them
    pub parameters: Map<String, Value>,
    pub display_mode: DisplayMode,
    pub display: Option<mpsc::UnboundedSender<DisplayEvent>>,
}

impl PipelineInput {
    pub fn new(context: Map<String, Value>) -> Self {
        Self {
            context,
            ..Default::default()
        }
    }

    pub fn for_request(mut self, request_id: Uuid) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_display(
        mut self,
        mode: DisplayMode,
        sender: mpsc::UnboundedSender<DisplayEvent>,
    ) -> Self {
        self.display_mode = mode;
        self.display = Some(sender);
        self
    }

    fn show(&self, event: DisplayEvent) {
        let visible = match (self.display_mode, &event) {
            (DisplayMode::Silent, _) => false,
            (DisplayMode::Minimal, DisplayEvent::StepFinished { .. }) => true,
            (DisplayMode::Minimal, _) => false,
            (DisplayMode::Ui, _) => true,
        };
        if let (true, Some(display)) = (visible, &self.display) {
            let _ = display.send(event);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub success: bool,
    pub steps: Vec<StepResult>,
    /// Output of every succeeded synchronous step, keyed by function
    pub outputs: Map<String, Value>,
    /// Output of the last succeeded synchronous step
    pub output: Value,
    pub usage: TokenUsage,
    pub error: Option<QueueError>,
    pub retries_used: u32,
    pub selected_target: Option<String>,
    pub duration_ms: u64,
}

impl PipelineResult {
    pub fn step(&self, function: &str) -> Option<&StepResult> {
        self.steps.iter().find(|step| step.function == function)
    }

    /// Partial outputs per step, for steps that produced any
    pub fn partials(&self) -> Map<String, Value> {
        self.steps
            .iter()
            .filter(|step| !step.partials.is_empty())
            .map(|step| (step.function.to_string(), Value::Array(step.partials.clone())))
            .collect()
    }

    /// The value stored as a queue item's result
    pub fn result_value(&self) -> Value {
        serde_json::json!({
            "output": self.output,
            "steps": self.outputs,
        })
    }

    pub fn into_outcome(self) -> std::result::Result<Value, QueueError> {
        if self.success {
            return Ok(self.result_value());
        }
        Err(self
            .error
            .unwrap_or_else(|| QueueError::new(ErrorKind::Internal, "pipeline failed without an error")))
    }
}

enum StepOutcome {
    Completed(InvocationOutput),
    Detached(Uuid),
    Failed(QueueError),
    DeadlinePassed,
}

pub struct ActorPipeline {
    invoker: Arc<dyn CapabilityInvoker>,
    supervisor: Arc<DetachedTaskSupervisor>,
    events: EventBus,
    settings: PipelineSettings,
}

impl ActorPipeline {
    pub fn new(
        invoker: Arc<dyn CapabilityInvoker>,
        supervisor: Arc<DetachedTaskSupervisor>,
        events: EventBus,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            invoker,
            supervisor,
            events,
            settings,
        }
    }

    pub fn supervisor(&self) -> &Arc<DetachedTaskSupervisor> {
        &self.supervisor
    }

    pub async fn execute(
        &self,
        snapshot: &RegistrySnapshot,
        steps: &[ChainStep],
        input: PipelineInput,
    ) -> PipelineResult {
        let started = Instant::now();
        let deadline = started + self.settings.pipeline_timeout;

        let mut results: Vec<StepResult> = steps
            .iter()
            .map(|step| StepResult::pending(step.function.clone()))
            .collect();
        let mut succeeded: HashSet<CapabilityKey> = HashSet::new();
        let mut outputs = Map::new();
        let mut last_output = Value::Null;
        let mut usage = TokenUsage::default();
        let mut selected_target: Option<String> = None;
        let mut retries_left = self.settings.retry_budget;
        let mut abort: Option<(usize, QueueError)> = None;

        for (index, step) in steps.iter().enumerate() {
            if abort.is_some() {
                results[index].state = StepState::Skipped;
                continue;
            }

            let step_started = Instant::now();
            results[index].state = StepState::Running;
            input.show(DisplayEvent::StepStarted {
                function: step.function.clone(),
            });

            let outcome = self
                .run_step(
                    snapshot,
                    step,
                    &input,
                    &outputs,
                    &succeeded,
                    deadline,
                    &mut retries_left,
                    &mut results[index],
                )
                .await;

            let result = &mut results[index];
            match outcome {
                StepOutcome::Completed(output) => {
                    result.state = StepState::Succeeded;
                    usage.accumulate(&output.usage);
                    if selected_target.is_none() {
                        selected_target = output.target.clone();
                    }
                    outputs.insert(step.function.to_string(), output.result.clone());
                    last_output = output.result.clone();
                    result.output = Some(output.result.clone());
                    result.usage = output.usage;
                    result.target = output.target;
                    succeeded.insert(step.function.clone());

                    if let Some(capability) = snapshot.capability(&step.function) {
                        publish_capability_events(&self.events, capability, input.request_id, &output.result);
                    }
                }
                StepOutcome::Detached(task_id) => {
                    result.state = StepState::Succeeded;
                    result.detached_task_id = Some(task_id);
                }
                StepOutcome::Failed(error) => {
                    result.state = StepState::Failed;
                    result.error = Some(error.clone());
                    if step.required {
                        warn!(capability = %step.function, error = %error, "Step failed, aborting pipeline");
                        abort = Some((index, abort_error(step, &error)));
                    } else {
                        debug!(capability = %step.function, error = %error, "Optional step failed, continuing");
                    }
                }
                StepOutcome::DeadlinePassed => {
                    let error = QueueError::new(
                        ErrorKind::PipelineAborted,
                        format!(
                            "pipeline timed out after {} ms during '{}'",
                            self.settings.pipeline_timeout.as_millis(),
                            step.function
                        ),
                    );
                    warn!(capability = %step.function, "Pipeline deadline passed");
                    result.state = StepState::Failed;
                    result.error = Some(error.clone());
                    abort = Some((index, error));
                }
            }

            result.duration_ms = step_started.elapsed().as_millis() as u64;
            input.show(DisplayEvent::StepFinished {
                function: step.function.clone(),
                state: result.state,
            });
        }

        let mut pipeline = PipelineResult {
            success: abort.is_none(),
            steps: results,
            outputs,
            output: last_output,
            usage,
            error: None,
            retries_used: self.settings.retry_budget - retries_left,
            selected_target,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        if let Some((index, error)) = abort {
            let skipped: Vec<String> = pipeline
                .steps
                .iter()
                .filter(|step| step.state == StepState::Skipped)
                .map(|step| step.function.to_string())
                .collect();
            let details = serde_json::json!({
                "failed_step": pipeline.steps[index].function,
                "skipped": skipped,
                "partials": pipeline.partials(),
            });
            pipeline.error = Some(error.with_details(details));
        }

        info!(
            request_id = ?input.request_id,
            success = pipeline.success,
            steps = pipeline.steps.len(),
            retries = pipeline.retries_used,
            duration_ms = pipeline.duration_ms,
            "Pipeline finished"
        );
        pipeline
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_step(
        &self,
        snapshot: &RegistrySnapshot,
        step: &ChainStep,
        input: &PipelineInput,
        outputs: &Map<String, Value>,
        succeeded: &HashSet<CapabilityKey>,
        deadline: Instant,
        retries_left: &mut u32,
        result: &mut StepResult,
    ) -> StepOutcome {
        let capability = match snapshot.capability(&step.function) {
            Some(capability) if capability.enabled => capability,
            Some(_) => {
                return StepOutcome::Failed(QueueError::new(
                    ErrorKind::CapabilityDisabled,
                    format!("capability '{}' is disabled", step.function),
                ))
            }
            None => {
                return StepOutcome::Failed(QueueError::new(
                    ErrorKind::CapabilityDisabled,
                    format!("capability '{}' is not registered", step.function),
                ))
            }
        };

        if let Some(missing) = capability
            .depends_on
            .iter()
            .find(|dependency| !succeeded.contains(*dependency))
        {
            return StepOutcome::Failed(QueueError::new(
                ErrorKind::StepFailed,
                format!(
                    "unmet dependency: '{}' requires '{}' to succeed first",
                    step.function, missing
                ),
            ));
        }

        let mut args = input.parameters.clone();
        for (key, value) in &step.args {
            args.insert(key.clone(), value.clone());
        }
        let mut context = input.context.clone();
        context.insert("steps".to_string(), Value::Object(outputs.clone()));

        if !step.wait_for_result {
            return StepOutcome::Detached(self.dispatch_detached(capability, input.request_id, args, context));
        }

        let mut attempt = 0;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return StepOutcome::DeadlinePassed;
            }
            let remaining = deadline - now;
            let limit = remaining.min(self.settings.step_timeout);
            attempt += 1;

            let call = self.attempt(step, capability, &args, &context, input, &mut result.partials);
            let message = match tokio::time::timeout(limit, call).await {
                Ok(Ok(output)) => return StepOutcome::Completed(output),
                Ok(Err(OrchestratorError::StepFailed { message, .. })) => message,
                Ok(Err(e)) => e.to_string(),
                Err(_) if remaining <= self.settings.step_timeout => {
                    return StepOutcome::DeadlinePassed;
                }
                Err(_) => format!("timed out after {} ms", limit.as_millis()),
            };

            warn!(capability = %step.function, attempt, error = %message, "Step attempt failed");
            result.failed_attempts.push(FailedAttempt {
                attempt,
                error: message.clone(),
                at: Utc::now(),
            });

            if step.on_error == OnError::Retry && *retries_left > 0 {
                *retries_left -= 1;
                debug!(capability = %step.function, retries_left = *retries_left, "Retrying step");
                continue;
            }

            return StepOutcome::Failed(QueueError::new(
                ErrorKind::StepFailed,
                format!("'{}' failed after {} attempt(s): {}", step.function, attempt, message),
            ));
        }
    }

    async fn attempt(
        &self,
        step: &ChainStep,
        capability: &Capability,
        args: &Map<String, Value>,
        context: &Map<String, Value>,
        input: &PipelineInput,
        partials: &mut Vec<Value>,
    ) -> Result<InvocationOutput> {
        let streaming = step.stream
            && capability.supports_streaming
            && self.invoker.supports_streaming(&step.function);
        if !streaming {
            return self.invoker.invoke(&step.function, args, context).await;
        }

        let mut stream = self.invoker.invoke_stream(&step.function, args, context).await?;
        let mut final_output = None;
        while let Some(chunk) = stream.next().await {
            match chunk? {
                StreamChunk::Partial(value) => {
                    input.show(DisplayEvent::Partial {
                        function: step.function.clone(),
                        chunk: value.clone(),
                    });
                    partials.push(value);
                }
                StreamChunk::Final(output) => final_output = Some(output),
            }
        }

        final_output.ok_or_else(|| OrchestratorError::StepFailed {
            capability: step.function.to_string(),
            message: "stream ended without a final result".to_string(),
        })
    }

    fn dispatch_detached(
        &self,
        capability: &Capability,
        request_id: Option<Uuid>,
        args: Map<String, Value>,
        context: Map<String, Value>,
    ) -> Uuid {
        let invoker = self.invoker.clone();
        let events = self.events.clone();
        let capability = capability.clone();
        let key = capability.key.clone();

        self.supervisor.spawn(key.clone(), request_id, async move {
            let output = invoker.invoke(&key, &args, &context).await?;
            publish_capability_events(&events, &capability, request_id, &output.result);
            Ok(output)
        })
    }
}

fn abort_error(step: &ChainStep, error: &QueueError) -> QueueError {
    let kind = match error.kind {
        ErrorKind::CapabilityDisabled => ErrorKind::CapabilityDisabled,
        _ => ErrorKind::StepFailed,
    };
    QueueError::new(
        kind,
        format!("step '{}' failed: {}", step.function, error.message),
    )
}

fn publish_capability_events(
    events: &EventBus,
    capability: &Capability,
    request_id: Option<Uuid>,
    output: &Value,
) {
    for name in &capability.events_emitted {
        events.publish(OrchestratorEvent::Capability {
            name: name.clone(),
            capability: capability.key.clone(),
            request_id,
            output: output.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::invoker::ChunkStream;
    use crate::engine::registry::RegistryDocument;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Scripted invoker: per-capability failure counts, optional delays and chunks
    #[derive(Default)]
    struct Scripted {
        failures: Mutex<HashMap<String, u32>>,
        delays: HashMap<String, Duration>,
        chunks: HashMap<String, Vec<Value>>,
        fail_stream_after_chunks: HashSet<String>,
        calls: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn failing(mut self, key: &str, times: u32) -> Self {
            self.failures.get_mut().unwrap().insert(key.to_string(), times);
            self
        }

        fn slow(mut self, key: &str, delay: Duration) -> Self {
            self.delays.insert(key.to_string(), delay);
            self
        }

        fn streaming(mut self, key: &str, chunks: Vec<Value>, then_fail: bool) -> Self {
            self.chunks.insert(key.to_string(), chunks);
            if then_fail {
                self.fail_stream_after_chunks.insert(key.to_string());
            }
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CapabilityInvoker for Scripted {
        async fn invoke(
            &self,
            capability: &CapabilityKey,
            args: &Map<String, Value>,
            context: &Map<String, Value>,
        ) -> Result<InvocationOutput> {
            self.calls.lock().unwrap().push(capability.to_string());
            if let Some(delay) = self.delays.get(capability.as_str()) {
                tokio::time::sleep(*delay).await;
            }
            {
                let mut failures = self.failures.lock().unwrap();
                if let Some(remaining) = failures.get_mut(capability.as_str()) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Err(OrchestratorError::StepFailed {
                            capability: capability.to_string(),
                            message: "upstream unavailable".to_string(),
                        });
                    }
                }
            }
            Ok(InvocationOutput::new(serde_json::json!({
                "from": capability.as_str(),
                "args": args,
                "seen_steps": context.get("steps").cloned().unwrap_or(Value::Null),
            }))
            .with_usage(TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
                cost: 0.01,
                ..Default::default()
            }))
        }

        async fn invoke_stream(
            &self,
            capability: &CapabilityKey,
            _args: &Map<String, Value>,
            _context: &Map<String, Value>,
        ) -> Result<ChunkStream> {
            let mut items: Vec<Result<StreamChunk>> = self
                .chunks
                .get(capability.as_str())
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .map(|chunk| Ok(StreamChunk::Partial(chunk)))
                .collect();
            if self.fail_stream_after_chunks.contains(capability.as_str()) {
                items.push(Err(OrchestratorError::StepFailed {
                    capability: capability.to_string(),
                    message: "connection reset".to_string(),
                }));
            } else {
                items.push(Ok(StreamChunk::Final(InvocationOutput::new(Value::from("done")))));
            }
            Ok(futures::stream::iter(items).boxed())
        }

        fn supports_streaming(&self, capability: &CapabilityKey) -> bool {
            self.chunks.contains_key(capability.as_str())
        }
    }

    fn snapshot(capabilities: Vec<Capability>) -> RegistrySnapshot {
        RegistrySnapshot::build(
            RegistryDocument {
                capabilities,
                ..Default::default()
            },
            1,
        )
        .unwrap()
    }

    fn pipeline(invoker: Arc<Scripted>, settings: PipelineSettings) -> (ActorPipeline, EventBus) {
        let events = EventBus::new(64);
        let supervisor = Arc::new(DetachedTaskSupervisor::new(events.clone()));
        (
            ActorPipeline::new(invoker, supervisor, events.clone(), settings),
            events,
        )
    }

    fn settings(retry_budget: u32) -> PipelineSettings {
        PipelineSettings {
            step_timeout: Duration::from_secs(5),
            pipeline_timeout: Duration::from_secs(30),
            retry_budget,
        }
    }

    #[tokio::test]
    async fn test_retry_step_recovers_within_budget() {
        let invoker = Arc::new(Scripted::default().failing("fetch", 2));
        let (pipeline, _) = pipeline(invoker.clone(), settings(3));
        let snapshot = snapshot(vec![Capability::new("fetch")]);
        let steps = vec![ChainStep::required("fetch").on_error(OnError::Retry)];

        let result = pipeline.execute(&snapshot, &steps, PipelineInput::default()).await;

        assert!(result.success);
        let step = result.step("fetch").unwrap();
        assert_eq!(step.state, StepState::Succeeded);
        assert_eq!(step.failed_attempts.len(), 2);
        assert_eq!(result.retries_used, 2);
        assert_eq!(invoker.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_budget_falls_through_to_fail() {
        let invoker = Arc::new(Scripted::default().failing("fetch", 5));
        let (pipeline, _) = pipeline(invoker, settings(1));
        let snapshot = snapshot(vec![Capability::new("fetch"), Capability::new("render")]);
        let steps = vec![
            ChainStep::required("fetch").on_error(OnError::Retry),
            ChainStep::required("render"),
        ];

        let result = pipeline.execute(&snapshot, &steps, PipelineInput::default()).await;

        assert!(!result.success);
        assert_eq!(result.steps[0].failed_attempts.len(), 2);
        assert_eq!(result.steps[1].state, StepState::Skipped);
        assert_eq!(result.error.unwrap().kind, ErrorKind::StepFailed);
    }

    #[tokio::test]
    async fn test_optional_continue_step_does_not_abort() {
        let invoker = Arc::new(Scripted::default().failing("enrich", 1));
        let (pipeline, _) = pipeline(invoker, settings(0));
        let snapshot = snapshot(vec![Capability::new("enrich"), Capability::new("answer")]);
        let steps = vec![ChainStep::optional("enrich"), ChainStep::required("answer")];

        let result = pipeline.execute(&snapshot, &steps, PipelineInput::default()).await;

        assert!(result.success);
        assert_eq!(result.steps[0].state, StepState::Failed);
        assert_eq!(result.steps[1].state, StepState::Succeeded);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_optional_fail_step_is_recorded_but_does_not_abort() {
        let invoker = Arc::new(Scripted::default().failing("enrich", 3));
        let (pipeline, _) = pipeline(invoker.clone(), settings(1));
        let snapshot = snapshot(vec![Capability::new("enrich"), Capability::new("answer")]);
        let steps = vec![
            ChainStep::optional("enrich").on_error(OnError::Fail),
            ChainStep::required("answer"),
        ];

        let result = pipeline.execute(&snapshot, &steps, PipelineInput::default()).await;

        assert!(result.success);
        assert_eq!(result.steps[0].state, StepState::Failed);
        assert_eq!(result.steps[0].failed_attempts.len(), 1);
        assert_eq!(result.steps[1].state, StepState::Succeeded);
        assert_eq!(invoker.calls(), vec!["enrich".to_string(), "answer".to_string()]);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_disabled_capability_fails_and_skips_the_rest() {
        let invoker = Arc::new(Scripted::default());
        let (pipeline, _) = pipeline(invoker.clone(), settings(0));
        let snapshot = snapshot(vec![Capability::new("deploy").disabled(), Capability::new("notify")]);
        let steps = vec![ChainStep::required("deploy"), ChainStep::required("notify")];

        let result = pipeline.execute(&snapshot, &steps, PipelineInput::default()).await;

        assert!(!result.success);
        assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::CapabilityDisabled);
        assert_eq!(result.steps[1].state, StepState::Skipped);
        assert!(invoker.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unmet_dependency_fails_the_step() {
        let invoker = Arc::new(Scripted::default());
        let (pipeline, _) = pipeline(invoker, settings(0));
        let snapshot = snapshot(vec![
            Capability::new("build"),
            Capability::new("deploy").with_dependency("build"),
        ]);

        let out_of_order = vec![ChainStep::required("deploy"), ChainStep::required("build")];
        let result = pipeline.execute(&snapshot, &out_of_order, PipelineInput::default()).await;
        assert!(!result.success);
        assert!(result.steps[0].error.as_ref().unwrap().message.contains("unmet dependency"));

        let in_order = vec![ChainStep::required("build"), ChainStep::required("deploy")];
        let result = pipeline.execute(&snapshot, &in_order, PipelineInput::default()).await;
        assert!(result.success);
    }

    #[tokio::test]
    async fn test_later_steps_see_earlier_outputs_and_usage_accumulates() {
        let invoker = Arc::new(Scripted::default());
        let (pipeline, _) = pipeline(invoker, settings(0));
        let snapshot = snapshot(vec![Capability::new("search"), Capability::new("answer")]);
        let steps = vec![
            ChainStep::required("search"),
            ChainStep::required("answer").with_arg("style", Value::from("short")),
        ];
        let mut parameters = Map::new();
        parameters.insert("style".into(), Value::from("long"));
        parameters.insert("topic".into(), Value::from("rust"));

        let result = pipeline
            .execute(&snapshot, &steps, PipelineInput::default().with_parameters(parameters))
            .await;

        let answer = result.step("answer").unwrap().output.as_ref().unwrap();
        assert_eq!(answer["seen_steps"]["search"]["from"], Value::from("search"));
        assert_eq!(answer["args"]["style"], Value::from("short"));
        assert_eq!(answer["args"]["topic"], Value::from("rust"));
        assert_eq!(result.usage.input_tokens, 20);
    }

    #[tokio::test]
    async fn test_detached_step_is_recorded_with_task_id() {
        let invoker = Arc::new(Scripted::default());
        let (pipeline, events) = pipeline(invoker, settings(0));
        let mut receiver = events.subscribe();
        let snapshot = snapshot(vec![Capability::new("audit").emitting("audit.logged")]);
        let steps = vec![ChainStep::required("audit").detached()];

        let result = pipeline.execute(&snapshot, &steps, PipelineInput::default()).await;
        let task_id = result.steps[0].detached_task_id.unwrap();
        assert_eq!(result.steps[0].state, StepState::Succeeded);

        let mut saw_event = false;
        let mut saw_finish = false;
        while !(saw_event && saw_finish) {
            let event = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
                .await
                .unwrap()
                .unwrap();
            match event {
                OrchestratorEvent::Capability { name, .. } => saw_event = name == "audit.logged",
                OrchestratorEvent::DetachedStepFinished { task_id: id, success, .. } => {
                    assert_eq!(id, task_id);
                    assert!(success);
                    saw_finish = true;
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_streaming_partials_survive_failure() {
        let invoker = Arc::new(Scripted::default().streaming(
            "chat",
            vec![Value::from("Hel"), Value::from("lo")],
            true,
        ));
        let (pipeline, _) = pipeline(invoker, settings(0));
        let snapshot = snapshot(vec![Capability::new("chat").streaming()]);
        let steps = vec![ChainStep::required("chat").streaming()];
        let (tx, mut rx) = mpsc::unbounded_channel();

        let result = pipeline
            .execute(
                &snapshot,
                &steps,
                PipelineInput::default().with_display(DisplayMode::Ui, tx),
            )
            .await;

        assert!(!result.success);
        assert_eq!(result.steps[0].partials, vec![Value::from("Hel"), Value::from("lo")]);
        let details = result.error.unwrap().details.unwrap();
        assert_eq!(details["partials"]["chat"], serde_json::json!(["Hel", "lo"]));

        let mut partials = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, DisplayEvent::Partial { .. }) {
                partials += 1;
            }
        }
        assert_eq!(partials, 2);
    }

    #[tokio::test]
    async fn test_minimal_display_only_sees_completions() {
        let invoker = Arc::new(Scripted::default().streaming("chat", vec![Value::from("x")], false));
        let (pipeline, _) = pipeline(invoker, settings(0));
        let snapshot = snapshot(vec![Capability::new("chat").streaming()]);
        let steps = vec![ChainStep::required("chat").streaming()];
        let (tx, mut rx) = mpsc::unbounded_channel();

        let result = pipeline
            .execute(
                &snapshot,
                &steps,
                PipelineInput::default().with_display(DisplayMode::Minimal, tx),
            )
            .await;
        assert!(result.success);

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        assert_eq!(seen.len(), 1);
        assert!(matches!(seen[0], DisplayEvent::StepFinished { state: StepState::Succeeded, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pipeline_timeout_aborts() {
        let invoker = Arc::new(Scripted::default().slow("slow", Duration::from_secs(10)));
        let (pipeline, _) = pipeline(
            invoker,
            PipelineSettings {
                step_timeout: Duration::from_secs(30),
                pipeline_timeout: Duration::from_secs(2),
                retry_budget: 0,
            },
        );
        let snapshot = snapshot(vec![Capability::new("slow"), Capability::new("after")]);
        let steps = vec![ChainStep::optional("slow"), ChainStep::required("after")];

        let result = pipeline.execute(&snapshot, &steps, PipelineInput::default()).await;

        assert!(!result.success);
        assert_eq!(result.error.unwrap().kind, ErrorKind::PipelineAborted);
        assert_eq!(result.steps[1].state, StepState::Skipped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_timeout_counts_as_failed_attempt() {
        let invoker = Arc::new(Scripted::default().slow("slow", Duration::from_secs(10)));
        let (pipeline, _) = pipeline(
            invoker,
            PipelineSettings {
                step_timeout: Duration::from_secs(1),
                pipeline_timeout: Duration::from_secs(60),
                retry_budget: 0,
            },
        );
        let snapshot = snapshot(vec![Capability::new("slow"), Capability::new("after")]);
        let steps = vec![ChainStep::optional("slow"), ChainStep::required("after")];

        let result = pipeline.execute(&snapshot, &steps, PipelineInput::default()).await;

        assert!(result.success);
        assert_eq!(result.steps[0].state, StepState::Failed);
        assert!(result.steps[0].failed_attempts[0].error.contains("timed out"));
    }
}
