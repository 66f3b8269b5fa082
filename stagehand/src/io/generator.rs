//! Generator abstraction for the text-generation subsystem.
//!
//! The [`Generator`] trait decouples stages from the actual backend (a CLI
//! such as `codex exec -` that reads a prompt on stdin). Tests use scripted
//! generators that return canned responses without spawning processes.

use std::path::PathBuf;
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Result, anyhow};
use regex::Regex;
use tracing::{debug, info, instrument, warn};

use crate::errors::GenerateError;
use crate::io::config::GeneratorConfig;
use crate::io::process::{SpawnFailed, run_command_with_timeout};
use crate::retry::{Idempotency, RetryExecutor, is_transient_io};

/// Characters of generator stderr kept in [`GenerateError::Exit`].
const STDERR_TAIL_CHARS: usize = 2_000;

/// Stderr signatures of failures that usually clear on a later attempt.
static TRANSIENT_STDERR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(busy|unavailable|overloaded|rate[ _-]?limit(?:ed)?|too many requests|try again|temporar(?:y|ily)|timed? ?out|connection reset|429|502|503|529)\b",
    )
    .expect("transient stderr regex is valid")
});

/// Abstraction over generative backends.
pub trait Generator {
    /// Produce free-form text for `prompt`, giving up after `timeout`.
    fn generate(&self, prompt: &str, timeout: Duration) -> Result<String>;
}

/// Generator that spawns a configured command per call.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    command: Vec<String>,
    output_limit_bytes: usize,
    workdir: Option<PathBuf>,
}

impl CommandGenerator {
    pub fn new(command: Vec<String>, output_limit_bytes: usize) -> Self {
        Self {
            command,
            output_limit_bytes,
            workdir: None,
        }
    }

    pub fn from_config(config: &GeneratorConfig) -> Self {
        Self::new(config.command.clone(), config.output_limit_bytes)
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }
}

impl Generator for CommandGenerator {
    #[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), prompt_bytes = prompt.len()))]
    fn generate(&self, prompt: &str, timeout: Duration) -> Result<String> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("generator command is empty"))?;
        info!(program = %program, "starting generator");

        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }

        let output = match run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            timeout,
            self.output_limit_bytes,
        ) {
            Ok(output) => output,
            Err(err) if err.downcast_ref::<SpawnFailed>().is_some() => {
                return Err(GenerateError::Spawn {
                    program: program.clone(),
                    reason: format!("{:#}", err.root_cause()),
                }
                .into());
            }
            Err(err) => return Err(err),
        };

        if output.timed_out {
            warn!(timeout_secs = timeout.as_secs(), "generator timed out");
            return Err(GenerateError::TimedOut(timeout).into());
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "generator failed");
            return Err(GenerateError::Exit {
                code: output.status.code(),
                stderr: tail(&output.stderr_lossy(), STDERR_TAIL_CHARS),
            }
            .into());
        }

        let text = output.stdout_lossy();
        debug!(response_bytes = text.len(), "generator completed");
        Ok(text)
    }
}

/// Retry classification for generator failures.
///
/// A missing binary never fixes itself; timeouts and busy/unavailable exits do.
pub fn is_transient_generate_error(err: &anyhow::Error) -> bool {
    match err.downcast_ref::<GenerateError>() {
        Some(GenerateError::Spawn { .. }) => false,
        Some(GenerateError::TimedOut(_)) => true,
        Some(GenerateError::Exit { stderr, .. }) => TRANSIENT_STDERR_RE.is_match(stderr),
        None => is_transient_io(err),
    }
}

/// Call `generator` under `retry`, retrying only transient failures.
pub fn generate_with_retry<G: Generator + ?Sized>(
    generator: &G,
    retry: &RetryExecutor,
    prompt: &str,
    timeout: Duration,
) -> Result<String> {
    retry
        .run(
            "generate",
            Idempotency::Idempotent,
            |_| generator.generate(prompt, timeout),
            is_transient_generate_error,
        )
        .into_result()
}

fn tail(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.trim_end().to_string();
    }
    text.chars()
        .skip(total - max_chars)
        .collect::<String>()
        .trim_end()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::backoff::RetryPolicy;
    use crate::errors::RetriesExhausted;
    use std::cell::RefCell;

    struct FlakyGenerator {
        failures: RefCell<Vec<GenerateError>>,
    }

    impl Generator for FlakyGenerator {
        fn generate(&self, _prompt: &str, _timeout: Duration) -> Result<String> {
            match self.failures.borrow_mut().pop() {
                Some(err) => Err(err.into()),
                None => Ok("{\"ok\": true}".to_string()),
            }
        }
    }

    fn exit(stderr: &str) -> GenerateError {
        GenerateError::Exit {
            code: Some(1),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn classifies_generator_failures() {
        let spawn = anyhow::Error::from(GenerateError::Spawn {
            program: "codex".to_string(),
            reason: "No such file or directory".to_string(),
        });
        assert!(!is_transient_generate_error(&spawn));

        let timeout = anyhow::Error::from(GenerateError::TimedOut(Duration::from_secs(1)));
        assert!(is_transient_generate_error(&timeout));

        assert!(is_transient_generate_error(&exit("Error: 503 Service Unavailable").into()));
        assert!(is_transient_generate_error(&exit("server overloaded, try again").into()));
        assert!(is_transient_generate_error(&exit("Rate limit exceeded").into()));
        assert!(!is_transient_generate_error(&exit("invalid api key").into()));
    }

    #[test]
    fn generate_with_retry_recovers_from_busy_backend() {
        let generator = FlakyGenerator {
            failures: RefCell::new(vec![exit("backend busy"), GenerateError::TimedOut(Duration::from_secs(1))]),
        };
        let retry = RetryExecutor::new(RetryPolicy::immediate(3));
        let text = generate_with_retry(&generator, &retry, "prompt", Duration::from_secs(1))
            .expect("generate");
        assert_eq!(text, "{\"ok\": true}");
    }

    #[test]
    fn generate_with_retry_does_not_retry_permanent_failures() {
        let generator = FlakyGenerator {
            failures: RefCell::new(vec![exit("ok"), exit("invalid api key")]),
        };
        let retry = RetryExecutor::new(RetryPolicy::immediate(3));
        let err = generate_with_retry(&generator, &retry, "prompt", Duration::from_secs(1))
            .unwrap_err();
        assert_eq!(err.downcast_ref::<RetriesExhausted>().expect("typed").attempts, 1);
        assert!(format!("{err:#}").contains("invalid api key"));
    }

    #[cfg(unix)]
    #[test]
    fn command_generator_reads_prompt_from_stdin() {
        let generator = CommandGenerator::new(
            vec!["sh".to_string(), "-c".to_string(), "printf '{\"echo\": \"'; cat; printf '\"}'".to_string()],
            10_000,
        );
        let text = generator
            .generate("hi", Duration::from_secs(5))
            .expect("generate");
        assert_eq!(text, "{\"echo\": \"hi\"}");
    }

    #[cfg(unix)]
    #[test]
    fn command_generator_reports_missing_binary() {
        let generator = CommandGenerator::new(vec!["no-such-generator-binary".to_string()], 100);
        let err = generator
            .generate("hi", Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GenerateError>(),
            Some(GenerateError::Spawn { .. })
        ));
        assert!(!is_transient_generate_error(&err));
    }

    #[cfg(unix)]
    #[test]
    fn command_generator_reports_exit_status_and_stderr() {
        let generator = CommandGenerator::new(
            vec!["sh".to_string(), "-c".to_string(), "echo 'service unavailable' >&2; exit 3".to_string()],
            100,
        );
        let err = generator
            .generate("hi", Duration::from_secs(5))
            .unwrap_err();
        match err.downcast_ref::<GenerateError>() {
            Some(GenerateError::Exit { code, stderr }) => {
                assert_eq!(*code, Some(3));
                assert_eq!(stderr, "service unavailable");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(is_transient_generate_error(&err));
    }
}
