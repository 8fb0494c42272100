//! Declarative pass/fail step tables, for functional checks that don't
//! search a load interval. A concrete suite builds an ordered slice of
//! [`Step`]s over its own context type; steps run in order, each with its
//! optional setup and teardown hooks, and the run's KPI is the pass count.

use anyhow::Result;
use futures::future::BoxFuture;
use tracing::info;

/// Verdict of one step.
#[derive(Debug, Clone)]
pub struct StepVerdict {
    pub pass: bool,
    pub details: String,
}

impl StepVerdict {
    pub fn pass(details: impl Into<String>) -> Self {
        Self {
            pass: true,
            details: details.into(),
        }
    }

    pub fn fail(details: impl Into<String>) -> Self {
        Self {
            pass: false,
            details: details.into(),
        }
    }
}

type StepFn<C> = for<'a> fn(&'a mut C) -> BoxFuture<'a, Result<StepVerdict>>;
type HookFn<C> = for<'a> fn(&'a mut C) -> BoxFuture<'a, Result<()>>;

/// One entry of a pass/fail table.
pub struct Step<C> {
    pub name: &'static str,
    pub description: &'static str,
    pub run: StepFn<C>,
    pub setup: Option<HookFn<C>>,
    pub teardown: Option<HookFn<C>>,
}

#[derive(Debug, Clone)]
pub struct StepResult {
    pub name: &'static str,
    pub description: &'static str,
    pub pass: bool,
    pub details: String,
}

#[derive(Debug, Clone, Default)]
pub struct PassFailReport {
    pub results: Vec<StepResult>,
}

impl PassFailReport {
    pub fn passed(&self) -> usize {
        self.results.iter().filter(|r| r.pass).count()
    }

    pub fn kpi(&self) -> String {
        format!("{}/{} succeeded", self.passed(), self.results.len())
    }
}

/// Run every step of the table against the shared context, in order.
pub async fn run_steps<C>(ctx: &mut C, steps: &[Step<C>]) -> Result<PassFailReport> {
    let mut report = PassFailReport::default();
    for step in steps {
        info!(step = step.name, "running step");

        if let Some(setup) = step.setup {
            setup(ctx).await?;
        }
        let verdict = (step.run)(ctx).await?;
        if let Some(teardown) = step.teardown {
            teardown(ctx).await?;
        }

        report.results.push(StepResult {
            name: step.name,
            description: step.description,
            pass: verdict.pass,
            details: verdict.details,
        });
    }
    Ok(report)
}
