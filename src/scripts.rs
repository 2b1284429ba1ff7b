//! Up/down hook invocation, grounded on `ScriptCall` in the original
//! `common.go`: runs an external script after a peer comes up or goes
//! down, passing the tunnel interface name and remote address as
//! environment variables rather than command-line arguments.

use tokio::process::Command;

pub const ENV_IFACE: &str = "GOVPN_IFACE";
pub const ENV_REMOTE: &str = "GOVPN_REMOTE";

/// Runs `script`, if configured, with `GOVPN_IFACE`/`GOVPN_REMOTE` set.
/// Failures are logged, never propagated -- a broken hook script must not
/// take the session down.
pub async fn run_hook(script: Option<&str>, iface: &str, remote: &str) {
    let Some(path) = script else {
        return;
    };
    let result = Command::new(path)
        .env(ENV_IFACE, iface)
        .env(ENV_REMOTE, remote)
        .status()
        .await;
    match result {
        Ok(status) if status.success() => {
            tracing::debug!(script = %path, "hook script completed");
        }
        Ok(status) => {
            tracing::warn!(script = %path, code = ?status.code(), "hook script exited non-zero");
        }
        Err(e) => {
            tracing::error!(script = %path, error = %e, "failed to spawn hook script");
        }
    }
}
