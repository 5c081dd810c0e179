//! External program invocation.

use crate::error::{AppError, Result};
use async_trait::async_trait;
use std::process::Stdio;

/// A single call to an external program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Program name or path.
    pub program: String,
    /// Arguments, not including the program itself.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub envs: Vec<(String, String)>,
}

impl Invocation {
    /// Create an invocation without arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// Append arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Program followed by its arguments, as a shell would see them.
    pub fn argv(&self) -> Vec<&str> {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect()
    }
}

/// Runs external programs and captures their standard output.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion and return stdout.
    async fn run(&self, invocation: &Invocation) -> Result<String>;
}

/// Runs programs as child processes.
///
/// Stderr is passed through to our own stderr so progress from the
/// tools ends up next to our log lines. There is no timeout.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, invocation: &Invocation) -> Result<String> {
        tracing::debug!(command = ?invocation.argv(), "Running external command");

        let output = tokio::process::Command::new(&invocation.program)
            .args(&invocation.args)
            .envs(invocation.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .output()
            .await
            .map_err(|e| AppError::Command {
                program: invocation.program.clone(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(AppError::Command {
                program: invocation.program.clone(),
                message: output.status.to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
