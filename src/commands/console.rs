//! Terminal rendering of test progress.

use colored::Colorize;

use crate::driver::{EventSink, RunReport, TestEvent, TestOutcome, TestResult};

/// Prints test events as they arrive.
#[derive(Debug, Default)]
pub struct ConsoleSink {
    /// Show test output for passing tests too
    pub verbose: bool,
}

impl EventSink for ConsoleSink {
    fn publish(&self, event: TestEvent) {
        match event {
            TestEvent::Log { message } => println!("  {}", message.dimmed()),
            TestEvent::TestStarted { test } => {
                if self.verbose {
                    println!("{} {}", "→".cyan(), test.name);
                }
            }
            TestEvent::TestFinished { result } => print_result(&result, self.verbose),
        }
    }
}

fn print_result(result: &TestResult, verbose: bool) {
    let timing = format!("({}ms)", result.duration_ms).dimmed();
    match result.outcome {
        TestOutcome::Passed => println!("{} {} {timing}", "✓".green().bold(), result.test.name),
        TestOutcome::Failed => println!("{} {} {timing}", "✗".red().bold(), result.test.name),
        TestOutcome::TimedOut => println!(
            "{} {} {}",
            "✗".red().bold(),
            result.test.name,
            "(timed out)".yellow()
        ),
    }

    let show_output = verbose || result.outcome != TestOutcome::Passed;
    if show_output {
        for line in result.output.lines() {
            println!("    {}", line.dimmed());
        }
    }
}

/// One-line totals for a finished run.
pub fn print_summary(report: &RunReport) {
    let elapsed = report
        .finished_at
        .signed_duration_since(report.started_at)
        .num_milliseconds();
    println!();
    if report.is_success() {
        println!(
            "{} {} passed {}",
            "✓".green().bold(),
            report.passed(),
            format!("in {elapsed}ms").dimmed()
        );
    } else {
        println!(
            "{} {} passed, {} failed {}",
            "✗".red().bold(),
            report.passed(),
            report.failed().to_string().red(),
            format!("in {elapsed}ms").dimmed()
        );
    }
}
