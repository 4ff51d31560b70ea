use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Why an external command did not complete successfully
#[derive(Debug)]
pub(crate) enum ProcessFailure {
    Spawn(std::io::Error),
    ExitStatus { status: String, stderr: String },
    Timeout { seconds: u64 },
}

/// Run `command` to completion, killing it if it outlives `limit`
pub(crate) async fn run_with_timeout(
    mut command: Command,
    label: &str,
    limit: Duration,
) -> Result<Output, ProcessFailure> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!("Running {}: {:?}", label, command.as_std());

    let child = command.spawn().map_err(ProcessFailure::Spawn)?;

    let output = match timeout(limit, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return Err(ProcessFailure::Spawn(e)),
        Err(_) => {
            warn!("{} exceeded {}s and was killed", label, limit.as_secs());
            return Err(ProcessFailure::Timeout {
                seconds: limit.as_secs(),
            });
        }
    };

    if !output.stderr.is_empty() {
        debug!("{} stderr: {}", label, tail(&output.stderr));
    }

    if output.status.success() {
        Ok(output)
    } else {
        Err(ProcessFailure::ExitStatus {
            status: output.status.to_string(),
            stderr: tail(&output.stderr),
        })
    }
}

/// Last few lines of a process stream, for log messages
fn tail(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(5);
    lines[start..].join(" | ")
}
