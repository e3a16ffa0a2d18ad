use std::ffi::OsString;
use std::io;
use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;

/// Seam for one-shot launcher invocations so environment routines can be
/// exercised without a real micromamba install.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &Path, args: &[OsString]) -> io::Result<std::process::Output>;
}

#[derive(Debug, Default)]
pub struct TokioCommandRunner;

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, program: &Path, args: &[OsString]) -> io::Result<std::process::Output> {
        Command::new(program).args(args).output().await
    }
}

pub(crate) fn render_args(args: &[OsString]) -> String {
    args.iter()
        .map(|arg| arg.to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Picks the most useful fragment of a failed command's output for error
/// messages: stderr first, stdout as a fallback, exit status as a last resort.
pub(crate) fn command_output_detail(output: &std::process::Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
    if !stderr.is_empty() {
        return stderr;
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_owned();
    if !stdout.is_empty() {
        return stdout;
    }

    format!("exit status {}", output.status)
}
