//! Output formatting and reporting
//!
//! Plans and run reports are printed either as colored text or as JSON.

use colored::*;
use kensa_core::{
    Result, SequenceReport, SuiteReport, TestOutcome, TestResult, TestSpecification,
};
use serde::Serialize;
use std::time::Duration;

use crate::OutputFormat;

/// Compiled plan of one profile, as printed by `kensa plan`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSummary {
    pub profile: String,
    pub title: String,
    pub delayed: bool,
    pub tests: Vec<TestSpecification>,
}

/// Output formatter for different formats
pub struct OutputFormatter {
    format: OutputFormat,
}

impl OutputFormatter {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn print_plans(&self, plans: &[PlanSummary], failures: &[(String, String)]) -> Result<()> {
        if self.format == OutputFormat::Json {
            let failures: Vec<_> = failures
                .iter()
                .map(|(profile, message)| {
                    serde_json::json!({ "profile": profile, "message": message })
                })
                .collect();
            let document = serde_json::json!({ "plans": plans, "compileFailures": failures });
            println!("{}", serde_json::to_string_pretty(&document)?);
            return Ok(());
        }

        for plan in plans {
            let marker = if plan.delayed {
                " (delayed)".dimmed().to_string()
            } else {
                String::new()
            };
            println!(
                "{} {}{}",
                plan.title.bold(),
                format!("[{}]", plan.profile).dimmed(),
                marker
            );
            for test in &plan.tests {
                let optional = if test.optional {
                    " optional".yellow().to_string()
                } else {
                    String::new()
                };
                println!("  {:>3}. {}{}", test.index, test.key, optional);
                println!("       {}", test.title.dimmed());
            }
            println!();
        }
        for (profile, message) in failures {
            println!("{} {}: {}", "error".red().bold(), profile, message);
        }

        let tests: usize = plans.iter().map(|p| p.tests.len()).sum();
        println!("{} profiles, {} tests", plans.len(), tests);
        Ok(())
    }

    pub fn print_report(&self, report: &SuiteReport, elapsed: Duration) -> Result<()> {
        if self.format == OutputFormat::Json {
            println!("{}", serde_json::to_string_pretty(report)?);
            return Ok(());
        }

        for sequence in &report.sequences {
            print_sequence(sequence);
        }
        for failure in &report.compile_failures {
            println!("{} {}: {}", "error".red().bold(), failure.profile, failure.message);
        }

        let count = |outcome| {
            report
                .sequences
                .iter()
                .map(|s| s.count(outcome))
                .sum::<usize>()
        };
        println!(
            "{} passed, {} failed, {} skipped, {} omitted, {} todo ({:.2}s)",
            count(TestOutcome::Pass).to_string().green(),
            count(TestOutcome::Fail).to_string().red(),
            count(TestOutcome::Skip).to_string().yellow(),
            count(TestOutcome::Omit),
            count(TestOutcome::Todo),
            elapsed.as_secs_f64()
        );
        if report.failed() {
            println!("{}", "Conformance run failed".red().bold());
        } else {
            println!("{}", "Conformance run passed".green().bold());
        }
        Ok(())
    }
}

fn print_sequence(sequence: &SequenceReport) {
    let status = if sequence.failed() {
        "FAIL".red().bold()
    } else {
        "ok".green().bold()
    };
    println!(
        "{} {} {}",
        sequence.resource_type.bold(),
        format!("[{}]", sequence.profile).dimmed(),
        status
    );
    for result in &sequence.results {
        print_result(result);
    }
    println!();
}

fn print_result(result: &TestResult) {
    let label = match result.outcome {
        TestOutcome::Pass => "pass".green(),
        TestOutcome::Fail if result.optional => "fail".yellow(),
        TestOutcome::Fail => "fail".red(),
        TestOutcome::Skip => "skip".yellow(),
        TestOutcome::Omit => "omit".dimmed(),
        TestOutcome::Todo => "todo".blue(),
    };
    println!("  {:<4} {}", label, result.title);
    if let Some(message) = &result.message {
        println!("       {}", message.dimmed());
    }
    for warning in &result.warnings {
        println!("       {} {}", "warning:".yellow(), warning);
    }
}
