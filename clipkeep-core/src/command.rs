use std::process::Output;

use tokio::process::Command;

/// Seam between adapters and the operating system's process table.
#[async_trait::async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, command: &mut Command) -> std::io::Result<Output>;
}

/// Spawns the real process. The child is killed when the future is dropped,
/// so a `tokio::time::timeout` around `run` also stops the tool.
#[derive(Debug, Default)]
pub struct SystemCommandExecutor;

#[async_trait::async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, command: &mut Command) -> std::io::Result<Output> {
        command.kill_on_drop(true).output().await
    }
}

/// Program and arguments as one line, for logs.
pub fn describe(command: &Command) -> String {
    let std = command.as_std();
    let mut line = std.get_program().to_string_lossy().into_owned();
    for arg in std.get_args() {
        line.push(' ');
        line.push_str(&arg.to_string_lossy());
    }
    line
}

/// Last `max_chars` characters of stderr, trimmed.
pub fn stderr_tail(output: &Output, max_chars: usize) -> String {
    let text = String::from_utf8_lossy(&output.stderr);
    let text = text.trim();
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}
