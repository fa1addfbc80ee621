//! External command invocation.

use std::process::Command;

use anyhow::{Context, Result, bail};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub status: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Runs a program to completion and reports its stdout and exit status.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;

    /// Runs a command line given as `[program, args...]`.
    fn run_line(&self, line: &[String]) -> Result<CommandOutput> {
        let Some((program, args)) = line.split_first() else {
            bail!("empty command line");
        };
        self.run(program, args)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let output = Command::new(program)
            .args(args)
            .output()
            .with_context(|| format!("Failed to spawn {program}"))?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            // killed by a signal
            status: output.status.code().unwrap_or(-1),
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeRunner;
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn process_runner_captures_stdout_and_status() {
        let out = ProcessRunner
            .run("sh", &["-c".to_string(), "echo hello; exit 3".to_string()])
            .unwrap();
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.status, 3);
        assert!(!out.success());
    }

    #[test]
    fn missing_program_is_an_error() {
        assert!(ProcessRunner.run("/nonexistent/program", &[]).is_err());
    }

    #[test]
    fn run_line_splits_program_and_args() {
        let runner = FakeRunner::default();
        runner
            .run_line(&["poweroff".to_string(), "-f".to_string()])
            .unwrap();
        assert!(runner.run_line(&[]).is_err());
        assert_eq!(runner.calls(), vec![vec!["poweroff".to_string(), "-f".to_string()]]);
    }
}
