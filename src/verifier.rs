//! `Verifier`: runs the Testing phase's build/lint/type/test commands as
//! subprocesses, each under its own timeout, and reports a
//! [`VerificationResult`] per criterion.
//!
//! Races process completion against a timeout future for each
//! verification command, same as an agent subprocess turn.

use std::time::{Duration, Instant};

use tokio::process::Command;

use crate::config::AutonomaConfig;
use crate::model::{CriterionType, VerificationResult};

/// One command this project wants run for a given criterion, e.g.
/// `cargo test` for `TestsPass`. `required` controls whether a failure
/// blocks phase advancement or is merely reported (some criteria allow
/// lint/type-check to be advisory in projects that don't enforce them).
#[derive(Debug, Clone)]
pub struct VerificationCommand {
    pub criterion: CriterionType,
    pub required: bool,
    pub program: String,
    pub args: Vec<String>,
}

pub struct Verifier<'a> {
    config: &'a AutonomaConfig,
    working_dir: std::path::PathBuf,
}

impl<'a> Verifier<'a> {
    pub fn new(config: &'a AutonomaConfig, working_dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            config,
            working_dir: working_dir.into(),
        }
    }

    /// Runs every command in `commands` sequentially (verification
    /// commands commonly share a build cache / lockfile and are not safe
    /// to run concurrently), stopping early only if a *required* criterion
    /// fails — later advisory-only criteria are still worth reporting, but
    /// there is no point running the rest of the required gate once one
    /// has already failed.
    pub async fn run_all(&self, commands: &[VerificationCommand]) -> Vec<VerificationResult> {
        let mut results = Vec::with_capacity(commands.len());
        let mut required_failed = false;

        for cmd in commands {
            if required_failed && cmd.required {
                continue;
            }
            let result = self.run_one(cmd).await;
            if cmd.required && !result.passed {
                required_failed = true;
            }
            results.push(result);
        }

        results
    }

    async fn run_one(&self, cmd: &VerificationCommand) -> VerificationResult {
        let timeout = Duration::from_secs(self.config.verification_timeout_secs);
        let command_display = format!("{} {}", cmd.program, cmd.args.join(" "));
        let started = Instant::now();

        let spawn_result = Command::new(&cmd.program)
            .args(&cmd.args)
            .current_dir(&self.working_dir)
            .output();

        match tokio::time::timeout(timeout, spawn_result).await {
            Ok(Ok(output)) => VerificationResult {
                criterion: cmd.criterion,
                required: cmd.required,
                passed: output.status.success(),
                exit_code: output.status.code(),
                duration_ms: started.elapsed().as_millis() as u64,
                output: merge_output(&output.stdout, &output.stderr),
                command: command_display,
            },
            Ok(Err(e)) => VerificationResult {
                criterion: cmd.criterion,
                required: cmd.required,
                passed: false,
                exit_code: None,
                duration_ms: started.elapsed().as_millis() as u64,
                output: format!("failed to spawn `{command_display}`: {e}"),
                command: command_display,
            },
            Err(_elapsed) => VerificationResult {
                criterion: cmd.criterion,
                required: cmd.required,
                passed: false,
                exit_code: None,
                duration_ms: timeout.as_millis() as u64,
                output: format!("timed out after {}s", timeout.as_secs()),
                command: command_display,
            },
        }
    }
}

fn merge_output(stdout: &[u8], stderr: &[u8]) -> String {
    let mut combined = String::from_utf8_lossy(stdout).into_owned();
    let stderr = String::from_utf8_lossy(stderr);
    if !stderr.trim().is_empty() {
        if !combined.is_empty() {
            combined.push('\n');
        }
        combined.push_str(&stderr);
    }
    combined
}

/// True if every *required* result passed. Advisory failures don't block.
pub fn all_required_passed(results: &[VerificationResult]) -> bool {
    results.iter().filter(|r| r.required).all(|r| r.passed)
}

/// Default verification gate shared by per-task Development checks and the
/// phase-level Testing gate: a cargo project's build and test pass
/// required, clippy advisory. Real-world projects vary; a future iteration
/// could read these from `autonoma.toml`, but build-system detection is
/// scoped out as a non-goal for now.
pub fn default_commands() -> Vec<VerificationCommand> {
    vec![
        VerificationCommand {
            criterion: CriterionType::BuildSucceeds,
            required: true,
            program: "cargo".to_string(),
            args: vec!["build".to_string()],
        },
        VerificationCommand {
            criterion: CriterionType::TestsPass,
            required: true,
            program: "cargo".to_string(),
            args: vec!["test".to_string()],
        },
        VerificationCommand {
            criterion: CriterionType::LintClean,
            required: false,
            program: "cargo".to_string(),
            args: vec![
                "clippy".to_string(),
                "--".to_string(),
                "-D".to_string(),
                "warnings".to_string(),
            ],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_one_reports_success_for_passing_command() {
        let config = AutonomaConfig::default();
        let dir = tempfile::tempdir().unwrap();
        let verifier = Verifier::new(&config, dir.path());
        let cmd = VerificationCommand {
            criterion: CriterionType::BuildSucceeds,
            required: true,
            program: "true".to_string(),
            args: vec![],
        };
        let result = verifier.run_one(&cmd).await;
        assert!(result.passed);
        assert_eq!(result.exit_code, Some(0));
    }

    #[tokio::test]
    async fn run_one_reports_failure_for_failing_command() {
        let config = AutonomaConfig::default();
        let dir = tempfile::tempdir().unwrap();
        let verifier = Verifier::new(&config, dir.path());
        let cmd = VerificationCommand {
            criterion: CriterionType::TestsPass,
            required: true,
            program: "false".to_string(),
            args: vec![],
        };
        let result = verifier.run_one(&cmd).await;
        assert!(!result.passed);
    }

    #[tokio::test]
    async fn required_failure_skips_later_required_commands() {
        let mut config = AutonomaConfig::default();
        config.verification_timeout_secs = 5;
        let dir = tempfile::tempdir().unwrap();
        let verifier = Verifier::new(&config, dir.path());
        let commands = vec![
            VerificationCommand {
                criterion: CriterionType::BuildSucceeds,
                required: true,
                program: "false".to_string(),
                args: vec![],
            },
            VerificationCommand {
                criterion: CriterionType::TestsPass,
                required: true,
                program: "true".to_string(),
                args: vec![],
            },
            VerificationCommand {
                criterion: CriterionType::LintClean,
                required: false,
                program: "true".to_string(),
                args: vec![],
            },
        ];
        let results = verifier.run_all(&commands).await;
        // the required TestsPass command after the failed required build is skipped
        assert_eq!(results.len(), 2);
        assert!(!all_required_passed(&results));
    }

    #[test]
    fn all_required_passed_ignores_advisory_failures() {
        let results = vec![
            VerificationResult {
                criterion: CriterionType::TestsPass,
                required: true,
                passed: true,
                exit_code: Some(0),
                duration_ms: 1,
                output: String::new(),
                command: String::new(),
            },
            VerificationResult {
                criterion: CriterionType::LintClean,
                required: false,
                passed: false,
                exit_code: Some(1),
                duration_ms: 1,
                output: String::new(),
                command: String::new(),
            },
        ];
        assert!(all_required_passed(&results));
    }
}
