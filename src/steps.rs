/* Copyright (C) 2025 Pedro Henrique / phkaiser13
 * File: src/steps.rs
 *
 * The step engine (part of C7): a `BootstrapStep` is a named, typed unit of
 * work over a caller-supplied context `Ctx`, with an optional rollback.
 * `StepEngine::run` executes steps in declaration order, accumulating a
 * timing/outcome record per step and a LIFO rollback stack pushed to the
 * front on success; a `required` step's failure unwinds that stack (each
 * rollback's own errors logged, never propagated) before returning the
 * original error, an optional step's failure is logged and execution
 * continues.
 *
 * Grounded on `multi_cluster_orchestrator/src/cluster_manager.rs::execute_action`'s
 * staged-execution-with-halt-condition loop, generalized from "a failing
 * stage halts the whole run" to the required/optional split this
 * single-cluster pipeline needs.
 *
 * SPDX-License-Identifier: Apache-2.0 */

use crate::error::Result;
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

type Exec<Ctx> = Box<dyn for<'c> Fn(&'c Ctx) -> BoxFuture<'c, Result<()>> + Send + Sync>;

pub struct BootstrapStep<Ctx> {
    pub name: &'static str,
    pub description: &'static str,
    pub required: bool,
    execute: Exec<Ctx>,
    rollback: Option<Exec<Ctx>>,
}

impl<Ctx> BootstrapStep<Ctx> {
    pub fn new(name: &'static str, description: &'static str, required: bool, execute: Exec<Ctx>) -> Self {
        Self {
            name,
            description,
            required,
            execute,
            rollback: None,
        }
    }

    pub fn with_rollback(mut self, rollback: Exec<Ctx>) -> Self {
        self.rollback = Some(rollback);
        self
    }
}

/// One step's outcome, recorded regardless of success or failure so the
/// closing timing summary is always complete.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub name: String,
    pub required: bool,
    pub duration: Duration,
    pub success: bool,
    pub message: Option<String>,
}

pub struct StepEngine<Ctx> {
    steps: Vec<BootstrapStep<Ctx>>,
}

impl<Ctx> StepEngine<Ctx> {
    pub fn new(steps: Vec<BootstrapStep<Ctx>>) -> Self {
        Self { steps }
    }

    /// Runs every step in order. Returns the full set of per-step records
    /// (for the timing summary) paired with the first fatal error, if any.
    pub async fn run(&self, ctx: &Ctx) -> (Vec<StepRecord>, Option<crate::error::Error>) {
        let mut records = Vec::with_capacity(self.steps.len());
        let mut rollback_stack: VecDeque<&BootstrapStep<Ctx>> = VecDeque::new();

        for step in &self.steps {
            let started = Instant::now();
            let result = (step.execute)(ctx).await;
            let duration = started.elapsed();

            match result {
                Ok(()) => {
                    records.push(StepRecord {
                        name: step.name.to_string(),
                        required: step.required,
                        duration,
                        success: true,
                        message: None,
                    });
                    if step.rollback.is_some() {
                        rollback_stack.push_front(step);
                    }
                }
                Err(e) => {
                    records.push(StepRecord {
                        name: step.name.to_string(),
                        required: step.required,
                        duration,
                        success: false,
                        message: Some(e.to_string()),
                    });

                    if step.required && e.is_fatal_for_required_step() {
                        self.unwind(&rollback_stack, ctx).await;
                        return (records, Some(e));
                    }
                    tracing::warn!(step = step.name, error = %e, "step failed; continuing");
                }
            }
        }

        (records, None)
    }

    async fn unwind(&self, stack: &VecDeque<&BootstrapStep<Ctx>>, ctx: &Ctx) {
        for step in stack {
            if let Some(rollback) = &step.rollback {
                if let Err(e) = rollback(ctx).await {
                    tracing::warn!(step = step.name, error = %e, "rollback failed; continuing unwind");
                }
            }
        }
    }
}

/// Renders the closing timing summary spec §7 requires: one line per step,
/// success/failure marker, duration; always emitted regardless of outcome.
pub fn render_summary(records: &[StepRecord]) -> String {
    let mut out = String::from("step timing summary:\n");
    for record in records {
        let marker = if record.success { "ok" } else { "FAIL" };
        out.push_str(&format!(
            "  [{:>4}] {:<28} {:>7.2?}{}\n",
            marker,
            record.name,
            record.duration,
            record
                .message
                .as_ref()
                .map(|m| format!(" — {}", m))
                .unwrap_or_default()
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Ctx;

    #[tokio::test]
    async fn required_step_failure_unwinds_rollback_stack_in_reverse_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let order1 = order.clone();
        let step1 = BootstrapStep::new("one", "", true, Box::new(move |_ctx: &Ctx| Box::pin(async { Ok(()) })))
            .with_rollback(Box::new(move |_ctx: &Ctx| {
                let order1 = order1.clone();
                Box::pin(async move {
                    order1.lock().unwrap().push("one");
                    Ok(())
                })
            }));

        let order2 = order.clone();
        let step2 = BootstrapStep::new("two", "", true, Box::new(move |_ctx: &Ctx| Box::pin(async { Ok(()) })))
            .with_rollback(Box::new(move |_ctx: &Ctx| {
                let order2 = order2.clone();
                Box::pin(async move {
                    order2.lock().unwrap().push("two");
                    Ok(())
                })
            }));

        let step3 = BootstrapStep::new(
            "three",
            "",
            true,
            Box::new(|_ctx: &Ctx| Box::pin(async { Err(crate::error::Error::Other(anyhow::anyhow!("boom"))) })),
        );

        let engine = StepEngine::new(vec![step1, step2, step3]);
        let (records, err) = engine.run(&Ctx).await;

        assert!(err.is_some());
        assert_eq!(records.len(), 3);
        assert!(!records[2].success);
        assert_eq!(*order.lock().unwrap(), vec!["two", "one"]);
    }

    #[tokio::test]
    async fn optional_step_failure_does_not_halt_the_run() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();

        let failing = BootstrapStep::new(
            "optional-fails",
            "",
            false,
            Box::new(|_ctx: &Ctx| Box::pin(async { Err(crate::error::Error::Other(anyhow::anyhow!("soft failure"))) })),
        );
        let after = BootstrapStep::new(
            "after",
            "",
            true,
            Box::new(move |_ctx: &Ctx| {
                let calls2 = calls2.clone();
                Box::pin(async move {
                    calls2.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        );

        let engine = StepEngine::new(vec![failing, after]);
        let (records, err) = engine.run(&Ctx).await;

        assert!(err.is_none());
        assert_eq!(records.len(), 2);
        assert!(!records[0].success);
        assert!(records[1].success);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
