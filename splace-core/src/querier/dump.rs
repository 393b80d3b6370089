//! Logical backups through the external `mysqldump` utility.

use super::{ConnectionConfig, DirectOptions};
use crate::Result;
use crate::error::SplaceError;
use crate::models::Engine;
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;

/// Runs the dump utility and copies its standard output into `sink`.
///
/// The password is handed over through `MYSQL_PWD` so it never shows up
/// in the process list. Standard error is captured and returned in the
/// error when the utility exits unsuccessfully.
pub(super) async fn mysqldump(
    options: &DirectOptions,
    config: &ConnectionConfig,
    sink: &mut (dyn AsyncWrite + Send + Unpin),
) -> Result<()> {
    if config.engine != Engine::MySql {
        return Err(SplaceError::unsupported_feature(
            "dump",
            config.engine.to_string(),
        ));
    }

    let (host, port) = config.host_and_port()?;
    let program = options.dump_command.display().to_string();

    let mut command = Command::new(&options.dump_command);
    command
        .arg("-h")
        .arg(&host)
        .arg("--port")
        .arg(port.to_string())
        .arg("-u")
        .arg(&config.user)
        .args(&options.dump_args)
        .arg(&config.database)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if !config.password.is_empty() {
        command.env("MYSQL_PWD", &config.password);
    }

    tracing::info!("Dumping {} with {}", config, program);
    let mut child = command
        .spawn()
        .map_err(|e| SplaceError::io(format!("failed to start {program}"), e))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| SplaceError::configuration("dump utility stdout was not captured"))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| SplaceError::configuration("dump utility stderr was not captured"))?;

    // Drain stderr alongside stdout so a chatty utility cannot block on a
    // full pipe.
    let mut captured = Vec::new();
    let (copied, drained) = tokio::join!(
        tokio::io::copy(&mut stdout, &mut *sink),
        stderr.read_to_end(&mut captured)
    );
    let bytes = copied.map_err(|e| SplaceError::io("failed to copy dump output", e))?;
    drained.map_err(|e| SplaceError::io("failed to read dump diagnostics", e))?;
    sink.flush()
        .await
        .map_err(|e| SplaceError::io("failed to flush dump output", e))?;

    let status = child
        .wait()
        .await
        .map_err(|e| SplaceError::io(format!("failed to wait for {program}"), e))?;

    if !status.success() {
        let stderr = String::from_utf8_lossy(&captured).trim().to_string();
        tracing::error!("{} exited with {}: {}", program, status, stderr);
        return Err(SplaceError::Dump {
            status: status.to_string(),
            stderr,
        });
    }

    tracing::info!("Dump of {} finished ({} bytes)", config, bytes);
    Ok(())
}
