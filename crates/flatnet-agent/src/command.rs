use tokio::process::Command;
use tracing::trace;

/// Error from a failed command.
#[derive(Debug, thiserror::Error)]
#[error("command failed: {command}\n{detail}")]
pub struct CommandError {
    pub command: String,
    pub detail: String,
}

/// Where a command executes: on the host, or inside a network namespace
/// via `ip netns exec`.
#[derive(Debug, Clone, Copy)]
pub enum Scope<'a> {
    Host,
    Netns(&'a str),
}

/// Format a human-readable display string for a command invocation.
fn format_command_display(program: &str, args: &[&str], scope: Scope<'_>) -> String {
    let mut parts = Vec::with_capacity(args.len() + 5);
    if let Scope::Netns(ns) = scope {
        parts.extend_from_slice(&["ip", "netns", "exec", ns]);
    }
    parts.push(program);
    parts.extend_from_slice(args);
    parts.join(" ")
}

fn build(program: &str, args: &[&str], scope: Scope<'_>) -> Command {
    match scope {
        Scope::Host => {
            let mut cmd = Command::new(program);
            cmd.args(args);
            cmd
        }
        Scope::Netns(ns) => {
            let mut cmd = Command::new("ip");
            cmd.args(["netns", "exec", ns, program]);
            cmd.args(args);
            cmd
        }
    }
}

/// Execute a command, returning trimmed stdout on success.
pub async fn exec(
    program: &str,
    args: &[&str],
    scope: Scope<'_>,
) -> Result<String, CommandError> {
    let cmd_display = format_command_display(program, args, scope);
    trace!(command = %cmd_display, "exec");

    let output = build(program, args, scope)
        .output()
        .await
        .map_err(|e| CommandError {
            command: cmd_display.clone(),
            detail: e.to_string(),
        })?;

    if output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(stdout)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(CommandError {
            command: cmd_display,
            detail: stderr,
        })
    }
}

/// Execute a command purely for its exit status (presence probes).
pub async fn exec_status(program: &str, args: &[&str], scope: Scope<'_>) -> bool {
    let cmd_display = format_command_display(program, args, scope);
    trace!(command = %cmd_display, "exec_status");

    match build(program, args, scope).output().await {
        Ok(o) => o.status.success(),
        Err(e) => {
            trace!(command = %cmd_display, error = %e, "command failed to spawn");
            false
        }
    }
}

/// Execute a command, ignoring any errors.
pub async fn exec_ignore_errors(program: &str, args: &[&str], scope: Scope<'_>) {
    let cmd_display = format_command_display(program, args, scope);
    trace!(command = %cmd_display, "exec_ignore_errors");

    match build(program, args, scope).output().await {
        Ok(o) if !o.status.success() => {
            let stderr = String::from_utf8_lossy(&o.stderr);
            trace!(command = %cmd_display, stderr = %stderr.trim(), "command failed (ignored)");
        }
        Err(e) => {
            trace!(command = %cmd_display, error = %e, "command failed to spawn (ignored)");
        }
        _ => {}
    }
}
