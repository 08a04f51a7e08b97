use std::io::{ErrorKind, Write};
use std::process::{Command, Stdio};
use std::thread;

use anyhow::{anyhow, Context, Result};
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct CliRunOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CliRunOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// One-line summary of a failed invocation, preferring stderr.
    pub fn failure_summary(&self, program: &str) -> String {
        let code = self.exit_code.unwrap_or(-1);
        let stderr = self.stderr.trim();
        let stdout = self.stdout.trim();
        if !stderr.is_empty() {
            format!("{} exited with code {}: {}", program, code, sanitize_output(stderr))
        } else if !stdout.is_empty() {
            format!("{} exited with code {}: {}", program, code, sanitize_output(stdout))
        } else {
            format!("{} exited with code {}", program, code)
        }
    }
}

/// Executes external programs. Non-zero exits are returned as output, not
/// errors; `Err` means the program could not be run at all.
///
/// Secrets belong in `input`, which is fed to the child's stdin. Arguments
/// are visible to every local user through the process table.
pub trait CliRunner: Send + Sync {
    fn run_with_input(
        &self,
        program: &str,
        args: &[String],
        input: Option<&str>,
    ) -> Result<CliRunOutput>;

    fn run(&self, program: &str, args: &[String]) -> Result<CliRunOutput> {
        self.run_with_input(program, args, None)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCliRunner;

impl CliRunner for SystemCliRunner {
    fn run_with_input(
        &self,
        program: &str,
        args: &[String],
        input: Option<&str>,
    ) -> Result<CliRunOutput> {
        // Arguments may carry tokens; only their count is logged.
        debug!(
            program = program,
            arg_count = args.len(),
            stdin = input.is_some(),
            "running command"
        );
        let mut child = Command::new(program)
            .args(args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to execute '{}'", program))?;

        let writer = match (input, child.stdin.take()) {
            (Some(input), Some(mut stdin)) => {
                let input = input.to_string();
                Some(thread::spawn(move || match stdin.write_all(input.as_bytes()) {
                    Err(err) if err.kind() != ErrorKind::BrokenPipe => Err(err),
                    _ => Ok(()),
                }))
            }
            _ => None,
        };

        let output = child
            .wait_with_output()
            .with_context(|| format!("failed waiting for '{}'", program))?;
        if let Some(writer) = writer {
            writer
                .join()
                .map_err(|_| anyhow!("stdin writer for '{}' panicked", program))?
                .with_context(|| format!("failed writing stdin of '{}'", program))?;
        }

        Ok(CliRunOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

fn sanitize_output(raw: &str) -> String {
    let collapsed = raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" | ");
    if collapsed.chars().count() > 400 {
        let truncated = collapsed.chars().take(400).collect::<String>();
        format!("{}...", truncated)
    } else {
        collapsed
    }
}
