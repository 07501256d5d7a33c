use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::process::{Command, Stdio};
use std::thread;

use crate::error::{DatagenError, Result};
use crate::invocation::{build_plan, CompletionPolicy, JobInvocation, ScaleFactor};
use crate::RunConfig;

pub const DEFAULT_TAIL_LINES: usize = 200;

// Last `capacity` lines of a stream; older lines are counted, not kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputTail {
    lines: VecDeque<String>,
    dropped: usize,
    #[serde(skip)]
    capacity: usize,
}

impl OutputTail {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            dropped: 0,
            capacity: capacity.max(1),
        }
    }

    pub fn from_text(text: &str) -> Self {
        let mut tail = Self::with_capacity(DEFAULT_TAIL_LINES);
        for line in text.lines() {
            tail.push(line.to_string());
        }
        tail
    }

    pub fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
            self.dropped += 1;
        }
        self.lines.push_back(line);
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn last_lines(&self, n: usize) -> Vec<&str> {
        let skip = self.lines.len().saturating_sub(n);
        self.lines().skip(skip).collect()
    }

    pub fn text(&self) -> String {
        self.lines().collect::<Vec<_>>().join("\n")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    // None when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: OutputTail,
    pub stderr: OutputTail,
}

pub trait JobExecutor {
    fn execute(&mut self, invocation: &JobInvocation) -> std::io::Result<ProcessOutput>;
}

#[derive(Debug)]
pub struct ProcessExecutor {
    tail_lines: usize,
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::with_tail_lines(DEFAULT_TAIL_LINES)
    }
}

impl ProcessExecutor {
    pub fn with_tail_lines(tail_lines: usize) -> Self {
        Self { tail_lines }
    }
}

impl JobExecutor for ProcessExecutor {
    fn execute(&mut self, invocation: &JobInvocation) -> std::io::Result<ProcessOutput> {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        let mut child = cmd.spawn()?;

        let capacity = self.tail_lines;
        let scale_factor = invocation.scale_factor.get();
        let stderr_reader = child
            .stderr
            .take()
            .map(|err| thread::spawn(move || forward_lines(err, "stderr", scale_factor, capacity)));
        let stdout = child
            .stdout
            .take()
            .map(|out| forward_lines(out, "stdout", scale_factor, capacity))
            .transpose();
        let stderr = match stderr_reader {
            Some(handle) => handle.join().map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::Other, "stderr reader panicked")
            })?,
            None => Ok(OutputTail::with_capacity(capacity)),
        };
        let status = child.wait()?;

        Ok(ProcessOutput {
            code: status.code(),
            stdout: stdout?.unwrap_or_else(|| OutputTail::with_capacity(capacity)),
            stderr: stderr?,
        })
    }
}

// Logs each line as it arrives and keeps a bounded tail of it.
fn forward_lines<R: Read>(
    reader: R,
    stream: &'static str,
    scale_factor: u32,
    capacity: usize,
) -> std::io::Result<OutputTail> {
    let mut reader = BufReader::new(reader);
    let mut tail = OutputTail::with_capacity(capacity);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        let raw = String::from_utf8_lossy(&buf);
        let line = raw.trim_end_matches(['\n', '\r']);
        tracing::info!(target: "spark_submit", scale_factor, stream, "{}", line);
        tail.push(line.to_string());
    }
    Ok(tail)
}

#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub scale_factor: ScaleFactor,
    pub command: String,
    pub fingerprint: String,
    pub destination: String,
    pub exit_code: Option<i32>,
    pub stdout: OutputTail,
    pub stderr: OutputTail,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl JobOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn status_label(&self) -> String {
        self.exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BatchState {
    Done,
    Failed { scale_factor: ScaleFactor },
}

#[derive(Debug)]
enum BatchFailure {
    Exit {
        scale_factor: ScaleFactor,
        command: String,
        status: String,
    },
    Spawn {
        scale_factor: ScaleFactor,
        error: DatagenError,
    },
}

#[derive(Debug)]
pub struct BatchReport {
    outcomes: Vec<JobOutcome>,
    failure: Option<BatchFailure>,
}

impl BatchReport {
    fn done(outcomes: Vec<JobOutcome>) -> Self {
        Self {
            outcomes,
            failure: None,
        }
    }

    fn exited(mut outcomes: Vec<JobOutcome>, failed: JobOutcome) -> Self {
        let failure = BatchFailure::Exit {
            scale_factor: failed.scale_factor,
            command: failed.command.clone(),
            status: failed.status_label(),
        };
        outcomes.push(failed);
        Self {
            outcomes,
            failure: Some(failure),
        }
    }

    fn unspawnable(outcomes: Vec<JobOutcome>, scale_factor: ScaleFactor, error: DatagenError) -> Self {
        Self {
            outcomes,
            failure: Some(BatchFailure::Spawn {
                scale_factor,
                error,
            }),
        }
    }

    pub fn outcomes(&self) -> &[JobOutcome] {
        &self.outcomes
    }

    pub fn state(&self) -> BatchState {
        match &self.failure {
            None => BatchState::Done,
            Some(BatchFailure::Exit { scale_factor, .. })
            | Some(BatchFailure::Spawn { scale_factor, .. }) => BatchState::Failed {
                scale_factor: *scale_factor,
            },
        }
    }

    pub fn is_done(&self) -> bool {
        self.failure.is_none()
    }

    pub fn into_result(self) -> Result<Vec<JobOutcome>> {
        match self.failure {
            None => Ok(self.outcomes),
            Some(BatchFailure::Spawn { error, .. }) => Err(error),
            Some(BatchFailure::Exit {
                scale_factor,
                command,
                status,
            }) => Err(DatagenError::JobFailed {
                scale_factor: scale_factor.get(),
                command,
                status,
            }),
        }
    }
}

pub struct Launcher<'a, E: JobExecutor> {
    config: &'a RunConfig,
    policy: CompletionPolicy,
    executor: E,
}

impl<'a, E: JobExecutor> Launcher<'a, E> {
    pub fn new(config: &'a RunConfig, policy: CompletionPolicy, executor: E) -> Self {
        Self {
            config,
            policy,
            executor,
        }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn into_executor(self) -> E {
        self.executor
    }

    // One job per scale factor, in order; nothing after the first failure runs.
    pub fn run(&mut self, factors: &[ScaleFactor]) -> BatchReport {
        let plan = build_plan(self.config, factors, self.policy);
        let mut outcomes = Vec::with_capacity(plan.len());

        for invocation in &plan {
            let command = invocation.display();
            tracing::info!(
                scale_factor = invocation.scale_factor.get(),
                destination = %invocation.destination,
                app_name = %invocation.app_name,
                "submitting data generation job"
            );
            tracing::debug!(%command, "job command");

            let started_at = Utc::now();
            let output = match self.executor.execute(invocation) {
                Ok(output) => output,
                Err(source) => {
                    tracing::warn!(scale_factor = invocation.scale_factor.get(), error = %source, "failed to start job");
                    return BatchReport::unspawnable(
                        outcomes,
                        invocation.scale_factor,
                        DatagenError::Spawn { command, source },
                    );
                }
            };
            let outcome = JobOutcome {
                scale_factor: invocation.scale_factor,
                fingerprint: invocation.fingerprint(),
                destination: invocation.destination.clone(),
                command,
                exit_code: output.code,
                stdout: output.stdout,
                stderr: output.stderr,
                started_at,
                finished_at: Utc::now(),
            };
            if !outcome.succeeded() {
                tracing::warn!(
                    scale_factor = invocation.scale_factor.get(),
                    status = %outcome.status_label(),
                    "job exited non-zero, stopping batch"
                );
                return BatchReport::exited(outcomes, outcome);
            }
            tracing::info!(
                scale_factor = invocation.scale_factor.get(),
                policy = self.policy.as_str(),
                "job finished"
            );
            outcomes.push(outcome);
        }

        BatchReport::done(outcomes)
    }
}
