//! `Runner` abstraction for subprocess orchestration:
//! `start -> wait/cancel -> collect-status`, so interrupting playback is
//! a single `cancel()` call. Grounded in
//! `tasks.rs::run_verification`'s `tokio::process::Command` usage,
//! generalized into a handle that can be killed from another task instead
//! of always being awaited to completion in place.

use tokio::process::{Child, Command};

use crate::error::GatewayError;

pub struct Runner {
    child: Child,
}

impl Runner {
    pub fn start(mut command: Command) -> Result<Self, GatewayError> {
        let child = command
            .spawn()
            .map_err(|e| GatewayError::Internal(format!("failed to spawn subprocess: {e}")))?;
        Ok(Runner { child })
    }

    /// Wait for the subprocess to exit normally.
    pub async fn wait(mut self) -> Result<std::process::ExitStatus, GatewayError> {
        self.child
            .wait()
            .await
            .map_err(|e| GatewayError::Internal(format!("subprocess wait failed: {e}")))
    }

    /// Interrupt the subprocess. Used when a new inbound action preempts
    /// playback.
    pub async fn cancel(mut self) -> Result<(), GatewayError> {
        self.child
            .kill()
            .await
            .map_err(|e| GatewayError::Internal(format!("failed to kill subprocess: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn can_start_and_wait_on_a_trivial_command() {
        let mut cmd = Command::new("true");
        cmd.kill_on_drop(true);
        let runner = Runner::start(cmd).unwrap();
        let status = runner.wait().await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn cancel_kills_a_long_running_command() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        cmd.kill_on_drop(true);
        let runner = Runner::start(cmd).unwrap();
        runner.cancel().await.unwrap();
    }
}
