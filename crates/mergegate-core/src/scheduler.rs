use std::{collections::BTreeMap, sync::Arc, time::Duration};

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, instrument, warn};

use crate::adapter::{
    InvocationOutcome, InvocationStatus, InvocationTimer, ToolAdapter,
};
use crate::config::{RunConfig, ToolConfig, ToolKind};
use crate::resolver::ScanTarget;

/// Executes tool invocations with bounded parallelism.
///
/// Each invocation runs as an independent external process; the only shared
/// resource is the pool's concurrency counter (a semaphore). Invocation
/// failures never abort sibling invocations.
pub struct Scheduler {
    config: Arc<RunConfig>,
    adapters: BTreeMap<ToolKind, Arc<dyn ToolAdapter>>,
}

impl Scheduler {
    pub fn new(config: RunConfig) -> Self {
        Self {
            config: Arc::new(config),
            adapters: BTreeMap::new(),
        }
    }

    /// Register the adapter responsible for its tool kind.
    pub fn register(&mut self, adapter: Arc<dyn ToolAdapter>) {
        self.adapters.insert(adapter.tool(), adapter);
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Create a cancellation pair; flip the sender to `true` to cancel a run.
    pub fn cancellation() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    /// Run every target to completion and return the outcomes in stable
    /// (tool, path) order, independent of completion order.
    ///
    /// Cancellation kills in-flight tool processes and marks not-yet-started
    /// invocations as `Cancelled`.
    #[instrument(name = "scheduler_run", skip_all, fields(targets = targets.len()))]
    pub async fn run(
        &self,
        targets: Vec<ScanTarget>,
        cancel: watch::Receiver<bool>,
    ) -> Vec<InvocationOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel.max(1)));
        let mut tasks = JoinSet::new();

        for target in targets {
            let Some(adapter) = self.adapters.get(&target.tool).cloned() else {
                warn!(tool = %target.tool, "no adapter registered for target; skipping");
                continue;
            };
            let Some(tool_config) = self.config.tool(target.tool).cloned() else {
                continue;
            };
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                run_one(adapter, target, tool_config, semaphore, cancel).await
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => warn!(error = %err, "invocation task panicked"),
            }
        }

        outcomes.sort_by(|a, b| {
            (a.invocation.tool, &a.invocation.path).cmp(&(b.invocation.tool, &b.invocation.path))
        });
        outcomes
    }
}

async fn run_one(
    adapter: Arc<dyn ToolAdapter>,
    target: ScanTarget,
    config: ToolConfig,
    semaphore: Arc<Semaphore>,
    cancel: watch::Receiver<bool>,
) -> InvocationOutcome {
    // Not-yet-started invocations are skipped outright on cancellation.
    let permit = tokio::select! {
        permit = semaphore.acquire_owned() => permit.expect("semaphore never closes"),
        _ = cancelled(cancel.clone()) => {
            return InvocationTimer::start(target.tool, &target).finish(
                InvocationStatus::Cancelled,
                None,
                Vec::new(),
            );
        }
    };
    let _permit = permit;

    let max_retries = if target.tool.is_deterministic() {
        0
    } else {
        config.max_retries
    };

    let mut attempt = 0u32;
    let mut backoff = Duration::from_millis(200);
    loop {
        let outcome = tokio::select! {
            result = adapter.invoke(&target, &config) => match result {
                Ok(outcome) => outcome,
                // Internal adapter fault; degrade to a failure marker rather
                // than aborting the run.
                Err(err) => {
                    warn!(tool = %target.tool, error = %err, "adapter returned internal error");
                    InvocationTimer::start(target.tool, &target).finish(
                        InvocationStatus::ProcessFailure,
                        Some(err.to_string()),
                        Vec::new(),
                    )
                }
            },
            // Dropping the invoke future kills the child via kill_on_drop.
            _ = cancelled(cancel.clone()) => {
                return InvocationTimer::start(target.tool, &target).finish(
                    InvocationStatus::Cancelled,
                    None,
                    Vec::new(),
                );
            }
        };

        if outcome.invocation.status.is_transient() && attempt < max_retries {
            attempt += 1;
            debug!(
                tool = %target.tool,
                path = %target.path.display(),
                attempt,
                "retrying transient failure"
            );
            sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(5));
            continue;
        }
        return outcome;
    }
}

/// Resolve once the cancellation flag flips; pend forever otherwise.
async fn cancelled(mut cancel: watch::Receiver<bool>) {
    if *cancel.borrow() {
        return;
    }
    while cancel.changed().await.is_ok() {
        if *cancel.borrow() {
            return;
        }
    }
    // Sender dropped without cancelling; this run can no longer be cancelled.
    std::future::pending::<()>().await;
}
