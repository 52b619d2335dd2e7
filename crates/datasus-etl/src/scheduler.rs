//! Period scheduler
//!
//! Expands a `since..=until` window into identifiers and runs them with
//! bounded concurrency. Identifiers are submitted in ascending date order;
//! they may finish in any order. One identifier failing never cancels its
//! siblings: every outcome is collected and reported once the window is
//! exhausted.

use crate::error::{EtlError, Result};
use crate::identifier::{DatasetIdentifier, IdentifierTemplate, YearMonth};
use crate::runner::{settle_not_found, PipelineRunner, RunReport, RunStatus};
use crate::stage::PipelineOptions;
use futures::stream::{self, StreamExt};
use std::num::NonZeroUsize;
use tracing::{error, info, warn};

/// Inclusive calendar window and concurrency cap for a period run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleWindow {
    pub since: YearMonth,
    pub until: YearMonth,
    pub concurrency: NonZeroUsize,
}

impl ScheduleWindow {
    pub fn new(since: YearMonth, until: YearMonth, concurrency: usize) -> Result<Self> {
        let concurrency = NonZeroUsize::new(concurrency).ok_or_else(|| {
            EtlError::Other(anyhow::anyhow!("Concurrency must be a positive integer."))
        })?;
        Ok(Self {
            since,
            until,
            concurrency,
        })
    }
}

/// One step of an expanded window
#[derive(Debug)]
pub struct PlannedRun {
    pub period: YearMonth,
    pub identifier: Result<DatasetIdentifier>,
}

/// What happened to one planned run
#[derive(Debug)]
pub struct PeriodOutcome {
    /// Identifier text, or `<template>@<YYYYMM>` when no valid identifier
    /// could be built for the period
    pub label: String,
    pub result: Result<RunReport>,
}

/// Outcomes of a period run, in submission order
#[derive(Debug, Default)]
pub struct PeriodReport {
    pub outcomes: Vec<PeriodOutcome>,
}

impl PeriodReport {
    /// Runs that hit a fatal condition
    pub fn failures(&self) -> impl Iterator<Item = (&str, &EtlError)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (o.label.as_str(), e)))
    }

    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }

    fn count(&self, predicate: impl Fn(&RunStatus) -> bool) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(&o.result, Ok(report) if predicate(&report.status)))
            .count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(|s| matches!(s, RunStatus::Succeeded { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| matches!(s, RunStatus::Skipped { .. }))
    }

    pub fn not_found(&self) -> usize {
        self.count(|s| matches!(s, RunStatus::NotFound))
    }

    /// One-line tally for logs and terminal output
    pub fn summary(&self) -> String {
        format!(
            "{} identifiers: {} succeeded, {} skipped (already processed), {} not found, {} failed",
            self.outcomes.len(),
            self.succeeded(),
            self.skipped(),
            self.not_found(),
            self.failures().count()
        )
    }
}

/// Runs a window of identifiers through a [`PipelineRunner`]
#[derive(Debug, Clone)]
pub struct PeriodScheduler {
    runner: PipelineRunner,
}

impl PeriodScheduler {
    pub fn new(runner: PipelineRunner) -> Self {
        Self { runner }
    }

    /// Expand the window into one planned run per step of the template's
    /// family, in ascending order
    pub fn plan(window: &ScheduleWindow, template: &IdentifierTemplate) -> Vec<PlannedRun> {
        let family = template.family();
        let mut planned = Vec::new();

        let mut cursor = window.since;
        while cursor <= window.until {
            planned.push(PlannedRun {
                period: cursor,
                identifier: template.at(cursor),
            });
            cursor = family.step(cursor);
        }

        planned
    }

    /// Run every identifier in the window, at most `window.concurrency` at a
    /// time
    pub async fn run(
        &self,
        window: &ScheduleWindow,
        template: &IdentifierTemplate,
        options: &PipelineOptions,
    ) -> PeriodReport {
        let planned = Self::plan(window, template);
        let total = planned.len();

        if total == 0 {
            warn!(since = %window.since, until = %window.until, "Empty period, nothing to do");
            return PeriodReport::default();
        }

        info!(
            template = %template,
            since = %window.since,
            until = %window.until,
            concurrency = window.concurrency.get(),
            "Processing {} identifiers",
            total
        );

        let mut outcomes: Vec<(usize, PeriodOutcome)> = stream::iter(planned.into_iter().enumerate())
            .map(|(index, planned)| {
                let runner = &self.runner;
                async move {
                    let label = match &planned.identifier {
                        Ok(identifier) => identifier.to_string(),
                        Err(_) => format!("{}@{}", template, planned.period),
                    };
                    info!("Processing {} ({} / {})", label, index + 1, total);

                    let result = match planned.identifier {
                        Ok(identifier) => {
                            settle_not_found(&identifier, runner.run(&identifier, options).await)
                        }
                        Err(e) => Err(e),
                    };

                    if let Err(e) = &result {
                        error!(identifier = %label, error = %e, "✗ ETL process failed");
                    }

                    (index, PeriodOutcome { label, result })
                }
            })
            .buffer_unordered(window.concurrency.get())
            .collect()
            .await;

        outcomes.sort_by_key(|(index, _)| *index);
        let report = PeriodReport {
            outcomes: outcomes.into_iter().map(|(_, outcome)| outcome).collect(),
        };

        info!("Period complete: {}", report.summary());
        report
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn window(since: &str, until: &str, concurrency: usize) -> ScheduleWindow {
        ScheduleWindow::new(since.parse().unwrap(), until.parse().unwrap(), concurrency).unwrap()
    }

    fn labels(planned: &[PlannedRun]) -> Vec<String> {
        planned
            .iter()
            .map(|p| p.identifier.as_ref().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_plan_monthly_window() {
        let template: IdentifierTemplate = "PAAB".parse().unwrap();
        let planned = PeriodScheduler::plan(&window("200801", "200803", 2), &template);
        assert_eq!(labels(&planned), ["PAAB0801", "PAAB0802", "PAAB0803"]);
    }

    #[test]
    fn test_plan_crosses_year_boundary() {
        let template: IdentifierTemplate = "PAMS".parse().unwrap();
        let planned = PeriodScheduler::plan(&window("202411", "202502", 1), &template);
        assert_eq!(labels(&planned), ["PAMS2411", "PAMS2412", "PAMS2501", "PAMS2502"]);
    }

    #[test]
    fn test_plan_yearly_window_steps_by_year() {
        let template: IdentifierTemplate = "POPSBR".parse().unwrap();
        let planned = PeriodScheduler::plan(&window("202206", "202501", 1), &template);
        assert_eq!(labels(&planned), ["POPSBR22", "POPSBR23", "POPSBR24", "POPSBR25"]);
    }

    #[test]
    fn test_plan_agrees_with_identifier_next() {
        let template: IdentifierTemplate = "PAMS".parse().unwrap();
        let planned = PeriodScheduler::plan(&window("202410", "202503", 1), &template);

        let mut current = template.at("202410".parse().unwrap()).unwrap();
        let mut expected = Vec::new();
        for _ in 0..planned.len() {
            expected.push(current.to_string());
            current = current.next();
        }
        assert_eq!(labels(&planned), expected);
    }

    #[test]
    fn test_plan_keeps_invalid_periods_as_failures() {
        let template: IdentifierTemplate = "PAMS".parse().unwrap();
        let planned = PeriodScheduler::plan(&window("200712", "200801", 1), &template);
        assert_eq!(planned.len(), 2);
        assert!(planned[0].identifier.is_err());
        assert!(planned[1].identifier.is_ok());
    }

    #[test]
    fn test_empty_when_since_after_until() {
        let template: IdentifierTemplate = "PAMS".parse().unwrap();
        assert!(PeriodScheduler::plan(&window("202502", "202501", 1), &template).is_empty());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        assert!(ScheduleWindow::new("202501".parse().unwrap(), "202501".parse().unwrap(), 0).is_err());
    }
}
