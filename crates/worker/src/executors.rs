//! Built-in executors

use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use hackgpt_orchestrator::{
    ExecutionContext, Executor, ExecutorError, ExecutorRegistry, Payload,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::debug;

/// Longest stderr excerpt carried in an error message
const STDERR_EXCERPT: usize = 512;

/// Registry with the `command` and `echo` executors
pub fn builtin() -> ExecutorRegistry {
    let mut executors = ExecutorRegistry::new();
    executors
        .register("command", CommandExecutor)
        .register_fn("echo", |args: Value, ctx: ExecutionContext| async move {
            if let Some(ms) = args.get("delay_ms").and_then(Value::as_u64) {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
                    _ = ctx.cancelled() => return Err(ExecutorError::transient("echo cancelled")),
                }
            }
            Ok(args)
        });
    executors
}

#[derive(Debug, Deserialize)]
struct CommandArgs {
    program: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    cwd: Option<PathBuf>,
}

/// Runs an external program, e.g. `{"program": "nmap", "args": ["-sV", "10.0.0.5"]}`
///
/// The child is killed when the attempt is cancelled or aborted. A non-zero
/// exit is retryable; a program that cannot be started is not.
pub struct CommandExecutor;

#[async_trait]
impl Executor for CommandExecutor {
    async fn execute(
        &self,
        payload: &Payload,
        ctx: &ExecutionContext,
    ) -> Result<Value, ExecutorError> {
        let args: CommandArgs = serde_json::from_value(payload.args.clone())?;

        let mut command = Command::new(&args.program);
        command
            .args(&args.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &args.cwd {
            command.current_dir(cwd);
        }

        let child = command.spawn().map_err(|e| match e.kind() {
            ErrorKind::NotFound | ErrorKind::PermissionDenied => {
                ExecutorError::permanent(format!("cannot start {}: {e}", args.program))
            }
            _ => ExecutorError::transient(format!("failed to start {}: {e}", args.program)),
        })?;
        debug!(program = %args.program, pid = ?child.id(), "Command started");

        let output = tokio::select! {
            output = child.wait_with_output() => output
                .map_err(|e| ExecutorError::transient(format!("{} failed: {e}", args.program)))?,
            _ = ctx.cancelled() => {
                return Err(ExecutorError::transient(format!("{} cancelled", args.program)));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            let excerpt: String = stderr.trim().chars().take(STDERR_EXCERPT).collect();
            return Err(ExecutorError::transient(format!(
                "{} exited with {}: {excerpt}",
                args.program, output.status
            )));
        }

        Ok(json!({
            "exit_code": output.status.code(),
            "stdout": stdout,
            "stderr": stderr,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(args: Value) -> (Payload, ExecutionContext) {
        let (ctx, _cancel) = ExecutionContext::standalone("local", Duration::from_secs(10));
        (Payload::new("command", args), ctx)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_captures_stdout() {
        let (payload, ctx) = run(json!({ "program": "sh", "args": ["-c", "echo open 22"] }));
        let result = CommandExecutor.execute(&payload, &ctx).await.unwrap();
        assert_eq!(result["exit_code"], json!(0));
        assert_eq!(result["stdout"].as_str().unwrap().trim(), "open 22");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit_is_transient() {
        let (payload, ctx) = run(json!({ "program": "sh", "args": ["-c", "echo busy >&2; exit 3"] }));
        let err = CommandExecutor.execute(&payload, &ctx).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("busy"));
    }

    #[tokio::test]
    async fn test_missing_program_is_permanent() {
        let (payload, ctx) = run(json!({ "program": "hackgpt-no-such-binary" }));
        let err = CommandExecutor.execute(&payload, &ctx).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_malformed_args_are_permanent() {
        let (payload, ctx) = run(json!({ "args": ["-sV"] }));
        let err = CommandExecutor.execute(&payload, &ctx).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancellation_stops_command() {
        let (ctx, cancel) = ExecutionContext::standalone("local", Duration::from_secs(10));
        let payload = Payload::new("command", json!({ "program": "sleep", "args": ["30"] }));

        let run = tokio::spawn(async move { CommandExecutor.execute(&payload, &ctx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), run).await.unwrap().unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_echo_returns_args() {
        let executors = builtin();
        assert!(executors.contains("command"));
        let (ctx, _cancel) = ExecutionContext::standalone("local", Duration::from_secs(1));
        let payload = Payload::new("echo", json!({ "hello": "world" }));
        let result = executors
            .get("echo")
            .unwrap()
            .execute(&payload, &ctx)
            .await
            .unwrap();
        assert_eq!(result, json!({ "hello": "world" }));
    }
}
