//! Remote scratch files for script execution

use tracing::debug;

use crate::session::RemoteOs;
use crate::ssh::{CommandOutput, RemoteShell, SshError};

/// Quote for a POSIX shell
pub(crate) fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

async fn run(shell: &dyn RemoteShell, command: &str) -> Result<CommandOutput, SshError> {
    let output = shell.exec(command).await?;
    match output.exit_status {
        Some(0) | None => Ok(output),
        Some(code) => Err(SshError::CommandFailed(format!(
            "`{}` exited with {}: {}",
            command,
            code,
            output.stderr.trim()
        ))),
    }
}

/// Reserve a fresh executable path on the server ending in `extension`.
///
/// `mktemp` hands out a unique name; that file is removed and recreated with
/// the extension appended, then marked executable.
pub async fn provision_scratch_path(
    shell: &dyn RemoteShell,
    os: RemoteOs,
    extension: &str,
) -> Result<String, SshError> {
    if os.is_windows() {
        return Err(SshError::Unsupported("Windows hosts".to_string()));
    }

    let base = run(shell, "mktemp").await?.stdout.trim().to_string();
    if base.is_empty() {
        return Err(SshError::CommandFailed("mktemp returned no path".to_string()));
    }

    let extension = extension.trim_start_matches('.');
    let path = if extension.is_empty() {
        base.clone()
    } else {
        format!("{}.{}", base, extension)
    };

    run(shell, &format!("rm {}", shell_quote(&base))).await?;
    run(shell, &format!("touch {}", shell_quote(&path))).await?;
    run(shell, &format!("chmod +x {}", shell_quote(&path))).await?;

    debug!("Provisioned scratch file {}", path);
    Ok(path)
}
