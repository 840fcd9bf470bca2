//! External command discovery and shared process helper.

use std::process::Stdio;

use tokio::process::Command;

use crate::discovery::DiscoveryError;

/// Run `argv` and return its stdout. Non-zero exit is an error.
///
/// The child is killed if the returned future is dropped, so an outer
/// timeout never leaves processes behind.
pub async fn run_command(argv: &[String]) -> Result<String, DiscoveryError> {
    let (program, args) = argv.split_first().ok_or(DiscoveryError::EmptyCommand)?;

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await?;

    if !output.status.success() {
        return Err(DiscoveryError::ExitStatus(output.status));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
