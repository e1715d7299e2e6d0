//! Docker orchestration: container provisioning plus the one-shot
//! lookup/exec/remove operations behind the HTTP endpoints.
//!
//! Everything here shells out to the `docker` CLI via `tokio::process`.
//! Provisioning streams its progress as log lines over a channel so the
//! WebSocket session can forward them while the subprocesses run.

use std::process::Stdio;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::{ProvisionError, ServerError};

pub const DEFAULT_IMAGE: &str = "ubuntu:latest";
const SHORT_ID_LEN: usize = 12;

/// Result of a successful provisioning run.
#[derive(Debug, Clone)]
pub struct Provisioned {
    pub container_id: String,
    pub container_name: String,
}

/// Container details returned by the lookup endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerInfo {
    pub id: String,
    pub image: String,
    pub status: String,
    pub names: String,
}

/// Output of a one-shot command execution inside a container.
#[derive(Debug, Clone, Serialize)]
pub struct ExecResult {
    pub output: String,
    #[serde(rename = "exitCode")]
    pub exit_code: Option<i32>,
}

/// Generate a unique container name with a millisecond timestamp suffix.
pub fn generate_container_name() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("svelte-terminal-{millis}")
}

fn short_id(id: &str) -> String {
    id.chars().take(SHORT_ID_LEN).collect()
}

/// Resolve the short container id from the create command's stdout, falling
/// back to an inspect-by-name result, and finally to the name itself.
pub fn resolve_container_id(
    run_output: &str,
    inspect_output: Option<&str>,
    name: &str,
) -> String {
    let trimmed = run_output.trim();
    if trimmed.chars().count() >= SHORT_ID_LEN {
        return short_id(trimmed);
    }
    if let Some(inspected) = inspect_output {
        let inspected = inspected.trim();
        if !inspected.is_empty() {
            return short_id(inspected);
        }
    }
    name.to_string()
}

/// Read a child stream line by line, forwarding each line as a log event and
/// returning everything read for error reporting.
async fn drain_stream<R>(reader: Option<R>, logs: &mpsc::Sender<String>) -> String
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return String::new();
    };
    let mut lines = BufReader::new(reader).lines();
    let mut captured = String::new();
    while let Ok(Some(line)) = lines.next_line().await {
        let chunk = format!("{line}\n");
        captured.push_str(&chunk);
        // A closed receiver just means nobody is listening anymore.
        let _ = logs.send(chunk).await;
    }
    captured
}

fn docker_command(args: &[&str]) -> Command {
    let mut cmd = Command::new("docker");
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

async fn pull_image(image: &str, logs: &mpsc::Sender<String>) -> std::io::Result<bool> {
    let mut child = docker_command(&["pull", image]).spawn()?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    tokio::join!(drain_stream(stdout, logs), drain_stream(stderr, logs));
    let status = child.wait().await?;
    Ok(status.success())
}

/// Ensure the image is available and create a new detached container running
/// an interactive shell. Progress is streamed over `logs` while the
/// subprocesses run.
///
/// A pull failure is non-fatal: the image may already exist locally, so the
/// create stage is attempted regardless. Only a failed or unspawnable
/// `docker run` aborts the attempt.
pub async fn provision(
    image: String,
    logs: mpsc::Sender<String>,
) -> Result<Provisioned, ProvisionError> {
    let name = generate_container_name();
    info!("Provisioning container {} from image {}", name, image);

    let _ = logs.send("Starting container creation...\n".to_string()).await;
    let _ = logs.send(format!("Pulling image: {image}...\n")).await;

    match pull_image(&image, &logs).await {
        Ok(true) => {}
        Ok(false) => {
            let _ = logs
                .send("Image pull completed with warnings, continuing...\n".to_string())
                .await;
        }
        Err(err) => {
            warn!("docker pull did not run: {err}");
            let _ = logs
                .send(format!("Image pull failed ({err}), continuing...\n"))
                .await;
        }
    }

    let _ = logs.send(format!("Creating container: {name}...\n")).await;

    let mut child = docker_command(&[
        "run",
        "-dit",
        "--name",
        name.as_str(),
        image.as_str(),
        "/bin/bash",
    ])
        .spawn()
        .map_err(|source| ProvisionError::SpawnFailed {
            command: "docker run",
            source,
        })?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (out, err) = tokio::join!(drain_stream(stdout, &logs), drain_stream(stderr, &logs));
    let status = child
        .wait()
        .await
        .map_err(|source| ProvisionError::SpawnFailed {
            command: "docker run",
            source,
        })?;

    if !status.success() {
        let mut output = format!("{out}{err}");
        if output.trim().is_empty() {
            output = format!("Failed to create container. Exit code: {:?}", status.code());
        }
        return Err(ProvisionError::CreateFailed { output });
    }

    // The run output should already be the full container id; query by name
    // only when it is missing or too short.
    let inspected = if out.trim().chars().count() >= SHORT_ID_LEN {
        None
    } else {
        inspect_container_id(&name).await
    };
    let container_id = resolve_container_id(&out, inspected.as_deref(), &name);
    info!("Container created: {} ({})", name, container_id);

    Ok(Provisioned {
        container_id,
        container_name: name,
    })
}

/// Query the full container id by name. Returns `None` when the container
/// cannot be inspected.
async fn inspect_container_id(name: &str) -> Option<String> {
    let output = Command::new("docker")
        .args(["inspect", "--format", "{{.Id}}", name])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!id.is_empty()).then_some(id)
}

fn parse_ps_line(output: &str) -> Option<ContainerInfo> {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty())?;
    let mut parts = line.split('|');
    Some(ContainerInfo {
        id: parts.next()?.to_string(),
        image: parts.next()?.to_string(),
        status: parts.next()?.to_string(),
        names: parts.next()?.to_string(),
    })
}

/// Look up a container by name first, then by id.
pub async fn lookup_container(identifier: &str) -> Result<Option<ContainerInfo>, ServerError> {
    for filter in [format!("name={identifier}"), format!("id={identifier}")] {
        let output = Command::new("docker")
            .args([
                "ps",
                "-a",
                "--filter",
                filter.as_str(),
                "--format",
                "{{.ID}}|{{.Image}}|{{.Status}}|{{.Names}}",
            ])
            .output()
            .await?;
        if !output.status.success() {
            return Err(ServerError::DockerFailed(
                "Failed to get container".to_string(),
            ));
        }
        if let Some(info) = parse_ps_line(&String::from_utf8_lossy(&output.stdout)) {
            return Ok(Some(info));
        }
    }
    Ok(None)
}

/// Stop (best effort) and force-remove a container. Stop failures are
/// tolerated: the container may already be stopped or gone, and `rm -f`
/// handles both.
pub async fn remove_container(identifier: &str) -> Result<(), ServerError> {
    match Command::new("docker")
        .args(["stop", identifier])
        .output()
        .await
    {
        Ok(output) if !output.status.success() => {
            info!(
                "docker stop {} exited with {:?}, continuing with remove",
                identifier,
                output.status.code()
            );
        }
        Err(err) => warn!("docker stop did not run: {err}"),
        _ => {}
    }

    let output = Command::new("docker")
        .args(["rm", "-f", identifier])
        .output()
        .await?;
    if !output.status.success() {
        let mut message = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        if message.trim().is_empty() {
            message = "Failed to delete container".to_string();
        }
        return Err(ServerError::DockerFailed(message));
    }
    Ok(())
}

/// Run a single command inside a container and capture its output.
pub async fn exec_in_container(
    identifier: &str,
    command: &str,
) -> Result<ExecResult, ServerError> {
    let output = Command::new("docker")
        .args(["exec", identifier, "bash", "-c", command])
        .output()
        .await?;
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    Ok(ExecResult {
        output: if stdout.is_empty() { stderr } else { stdout },
        exit_code: output.status.code(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_name_has_expected_prefix() {
        let name = generate_container_name();
        assert!(name.starts_with("svelte-terminal-"));
        let suffix = &name["svelte-terminal-".len()..];
        assert!(suffix.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn resolve_uses_run_output_when_long_enough() {
        let full = "3f4a9b2c1d0e5f6a7b8c9d0e1f2a3b4c";
        let id = resolve_container_id(&format!("{full}\n"), None, "svelte-terminal-1");
        assert_eq!(id, "3f4a9b2c1d0e");
        assert_eq!(id.len(), SHORT_ID_LEN);
    }

    #[test]
    fn resolve_falls_back_to_inspect_output() {
        let id = resolve_container_id(
            "",
            Some("aabbccddeeff00112233445566778899\n"),
            "svelte-terminal-1",
        );
        assert_eq!(id, "aabbccddeeff");
    }

    #[test]
    fn resolve_falls_back_to_name_as_last_resort() {
        let id = resolve_container_id("short", None, "svelte-terminal-42");
        assert_eq!(id, "svelte-terminal-42");

        let id = resolve_container_id("short", Some("   "), "svelte-terminal-42");
        assert_eq!(id, "svelte-terminal-42");
    }

    #[test]
    fn parse_ps_line_splits_fields() {
        let info =
            parse_ps_line("3f4a9b2c1d0e|ubuntu:latest|Up 2 minutes|svelte-terminal-7\n").unwrap();
        assert_eq!(info.id, "3f4a9b2c1d0e");
        assert_eq!(info.image, "ubuntu:latest");
        assert_eq!(info.status, "Up 2 minutes");
        assert_eq!(info.names, "svelte-terminal-7");
    }

    #[test]
    fn parse_ps_line_empty_output_is_none() {
        assert!(parse_ps_line("").is_none());
        assert!(parse_ps_line("\n  \n").is_none());
    }
}
