/// External tool invocation for the talosctl backend
use std::ffi::OsStr;
use std::process::Stdio;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Failure modes of an external tool run
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("could not start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("{program} run was cancelled")]
    Cancelled { program: String },

    #[error("{program} is not installed or not in PATH. Please install from {install_url}")]
    NotInstalled {
        program: String,
        install_url: String,
    },
}

/// Run an external tool to completion and capture its stdout.
///
/// Honours the pipeline's cancellation token; the child is spawned with
/// kill-on-drop so an abandoned run does not leave processes behind.
pub async fn run_tool<I, S>(
    program: &str,
    args: I,
    cancel: &CancellationToken,
) -> Result<String, CommandError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = tokio::process::Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!("running {}", program);

    let child = command.spawn().map_err(|source| CommandError::Spawn {
        program: program.to_string(),
        source,
    })?;

    let output = tokio::select! {
        _ = cancel.cancelled() => {
            return Err(CommandError::Cancelled {
                program: program.to_string(),
            });
        }
        result = child.wait_with_output() => result.map_err(|source| CommandError::Spawn {
            program: program.to_string(),
            source,
        })?,
    };

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(CommandError::Failed {
            program: program.to_string(),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Probe that a tool answers its version flag before the pipeline
/// starts depending on it.
pub async fn ensure_tool_installed(
    program: &str,
    probe_args: &[&str],
    install_url: &str,
) -> Result<(), CommandError> {
    match run_tool(program, probe_args.iter().copied(), &CancellationToken::new()).await {
        Ok(_) => Ok(()),
        Err(CommandError::Spawn { .. }) | Err(CommandError::Failed { .. }) => {
            Err(CommandError::NotInstalled {
                program: program.to_string(),
                install_url: install_url.to_string(),
            })
        }
        Err(other) => Err(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_tool_captures_stdout() {
        let out = run_tool("echo", ["hello"], &CancellationToken::new())
            .await
            .unwrap();
        assert!(out.contains("hello"));
    }

    #[tokio::test]
    async fn test_failure_carries_stderr() {
        let err = run_tool(
            "sh",
            ["-c", "echo boom >&2; exit 3"],
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        match err {
            CommandError::Failed { stderr, .. } => assert_eq!(stderr, "boom"),
            other => panic!("expected Failed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_long_runs() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = run_tool("sleep", ["5"], &cancel).await.unwrap_err();
        assert!(matches!(err, CommandError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_missing_tool_reports_install_hint() {
        let err = ensure_tool_installed("definitely-not-a-real-tool", &["--version"], "https://example.com")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("https://example.com"));
    }
}
