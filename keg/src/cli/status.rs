// keg/src/cli/status.rs
use std::collections::HashMap;
use std::time::Instant;

use colored::*;
use keg_common::pipeline::{BuildPhase, PipelineEvent};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobStatus {
    Downloading,
    Downloaded,
    Building(BuildPhase),
    Success,
    Failed,
    Skipped,
}

impl JobStatus {
    fn colored_state(&self) -> ColoredString {
        match self {
            JobStatus::Downloading => "downloading".yellow(),
            JobStatus::Downloaded => "downloaded".green(),
            JobStatus::Building(BuildPhase::Installing) => "installing".magenta(),
            JobStatus::Building(phase) => phase.to_string().blue(),
            JobStatus::Success => "success".green().bold(),
            JobStatus::Failed => "failed".red().bold(),
            JobStatus::Skipped => "skipped".dimmed(),
        }
    }
}

struct JobInfo {
    status: JobStatus,
    size_bytes: Option<u64>,
    pool_id: usize,
}

/// Prints one line per job status change and a summary at the end.
struct StatusDisplay {
    jobs: HashMap<String, JobInfo>,
    next_pool_id: usize,
    total_jobs: usize,
    start_time: Instant,
}

impl StatusDisplay {
    fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            next_pool_id: 1,
            total_jobs: 0,
            start_time: Instant::now(),
        }
    }

    fn update(&mut self, target_id: &str, status: JobStatus, size_bytes: Option<u64>) {
        let next_id = self.next_pool_id;
        let job = self.jobs.entry(target_id.to_string()).or_insert_with(|| JobInfo {
            status,
            size_bytes: None,
            pool_id: next_id,
        });
        if job.pool_id == next_id {
            self.next_pool_id += 1;
        } else if job.status == status {
            return;
        }
        job.status = status;
        if size_bytes.is_some() {
            job.size_bytes = size_bytes;
        }
        let size = job.size_bytes.map(format_bytes).unwrap_or_else(|| "–".to_string());
        println!(
            "{:<6} {:<12} {:<24} {:>8}",
            format!("#{:02}", job.pool_id).cyan(),
            job.status.colored_state(),
            target_id.cyan(),
            size
        );
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "kB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit_idx = 0;

    while value >= 1000.0 && unit_idx < UNITS.len() - 1 {
        value /= 1000.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{bytes}B")
    } else {
        format!("{:.1}{}", value, UNITS[unit_idx])
    }
}

pub async fn handle_events(mut event_rx: broadcast::Receiver<PipelineEvent>) {
    let mut display = StatusDisplay::new();
    let mut logs_buffer = Vec::new();

    loop {
        match event_rx.recv().await {
            Ok(event) => match event {
                PipelineEvent::PlanningStarted => {
                    println!("{}", "Resolving dependencies...".cyan());
                }
                PipelineEvent::PlanningFinished { job_count } => {
                    println!("{} {}", "Planning finished. Jobs:".bold(), job_count);
                }
                PipelineEvent::PipelineStarted { total_jobs } => {
                    display.total_jobs = total_jobs;
                    println!(
                        "{:<6} {:<12} {:<24} {:>8}",
                        "IID".bold().dimmed(),
                        "STATE".bold().dimmed(),
                        "PKG".bold().dimmed(),
                        "SIZE".bold().dimmed()
                    );
                }
                PipelineEvent::DownloadStarted { target_id, .. } => {
                    display.update(&target_id, JobStatus::Downloading, None);
                }
                PipelineEvent::DownloadFinished {
                    target_id,
                    size_bytes,
                    ..
                } => {
                    display.update(&target_id, JobStatus::Downloaded, Some(size_bytes));
                }
                PipelineEvent::DownloadFailed {
                    target_id, error, ..
                } => {
                    display.update(&target_id, JobStatus::Failed, None);
                    logs_buffer.push(format!(
                        "{} {}: {}",
                        "Download failed:".red(),
                        target_id.cyan(),
                        error.red()
                    ));
                }
                PipelineEvent::JobDispatchedToCore { target_id } => {
                    display.update(&target_id, JobStatus::Building(BuildPhase::Pending), None);
                }
                PipelineEvent::PhaseChanged { target_id, phase } => {
                    if !phase.is_terminal() {
                        display.update(&target_id, JobStatus::Building(phase), None);
                    }
                }
                PipelineEvent::JobSuccess {
                    target_id,
                    version,
                    kind,
                } => {
                    display.update(&target_id, JobStatus::Success, None);
                    logs_buffer.push(format!(
                        "{}: {} {} ({})",
                        "Installed".green(),
                        target_id.cyan(),
                        version,
                        kind
                    ));
                }
                PipelineEvent::JobFailed { target_id, error } => {
                    // Download failures were already reported above.
                    let already_reported = display
                        .jobs
                        .get(&target_id)
                        .is_some_and(|j| j.status == JobStatus::Failed);
                    display.update(&target_id, JobStatus::Failed, None);
                    if !already_reported {
                        logs_buffer.push(format!(
                            "{} {}: {}",
                            "✗".red().bold(),
                            target_id.cyan(),
                            error.red()
                        ));
                    }
                }
                PipelineEvent::JobSkipped { target_id, reason } => {
                    display.update(&target_id, JobStatus::Skipped, None);
                    logs_buffer.push(format!(
                        "{} {}: {}",
                        "Skipped".yellow(),
                        target_id.cyan(),
                        reason
                    ));
                }
                PipelineEvent::LogInfo { message } => {
                    logs_buffer.push(message);
                }
                PipelineEvent::LogWarn { message } => {
                    logs_buffer.push(message.yellow().to_string());
                }
                PipelineEvent::PipelineFinished {
                    duration_secs,
                    success_count,
                    fail_count,
                    skipped_count,
                } => {
                    if display.total_jobs > 0 {
                        println!(
                            "\n{} in {:.2}s ({} succeeded, {} failed, {} skipped)",
                            "Pipeline finished".bold(),
                            duration_secs,
                            success_count,
                            fail_count,
                            skipped_count
                        );
                    }
                    if !logs_buffer.is_empty() {
                        println!();
                        for log in &logs_buffer {
                            println!("{log}");
                        }
                    }
                    if display.total_jobs > 0 {
                        println!(
                            "\n{}: {}  {}: {}  {}: {}  {}: {:.2}s",
                            "Total jobs".bold(),
                            display.total_jobs,
                            "Completed".green().bold(),
                            success_count,
                            "Failed".red().bold(),
                            fail_count,
                            "Elapsed".bold(),
                            display.start_time.elapsed().as_secs_f64()
                        );
                    }
                    break;
                }
            },
            Err(broadcast::error::RecvError::Closed) => {
                break;
            }
            Err(broadcast::error::RecvError::Lagged(_)) => {
                // Ignore lag for now
            }
        }
    }
}
