//! Outermost driver: runs one task and turns process signals into a cancel.

use crate::error::{Result, VocalinkError};
use crate::frames::CancelReason;
use crate::task::{PipelineTask, TaskOutcome};
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct PipelineRunner {
    handle_signals: bool,
}

impl Default for PipelineRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineRunner {
    /// Runner with SIGINT/SIGTERM handling enabled.
    pub fn new() -> Self {
        Self {
            handle_signals: true,
        }
    }

    pub fn with_signal_handling(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    /// Runs `task` to completion. A signal cancels it with
    /// [`CancelReason::Interrupted`], the same path a disconnect takes.
    pub async fn run(&self, task: PipelineTask) -> Result<TaskOutcome> {
        let handle = task.handle();
        let mut running = tokio::spawn(task.run());

        if !self.handle_signals {
            return finish(running).await;
        }

        tokio::select! {
            result = &mut running => return flatten(result),
            signal = wait_for_signal() => match signal {
                Ok(name) => info!(signal = name, "received signal, cancelling pipeline"),
                Err(e) => {
                    warn!("signal handling unavailable: {}", e);
                    return finish(running).await;
                }
            },
        }

        let outcome = handle.cancel_with(CancelReason::Interrupted).await;
        // The task publishes its outcome just before returning
        let joined = finish(running).await;
        match outcome {
            Ok(outcome) => Ok(outcome),
            Err(_) => joined,
        }
    }
}

async fn finish(running: JoinHandle<Result<TaskOutcome>>) -> Result<TaskOutcome> {
    flatten(running.await)
}

fn flatten(
    joined: std::result::Result<Result<TaskOutcome>, tokio::task::JoinError>,
) -> Result<TaskOutcome> {
    joined.map_err(|e| VocalinkError::Other(format!("pipeline task failed: {}", e)))?
}

/// Resolves with the signal's name on SIGINT or SIGTERM.
async fn wait_for_signal() -> Result<&'static str> {
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.map_err(|e| VocalinkError::Other(format!("Failed to listen for SIGINT: {}", e)))?;
            Ok("SIGINT")
        }
        res = wait_for_sigterm() => {
            res?;
            Ok("SIGTERM")
        }
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| VocalinkError::Other(format!("Failed to register SIGTERM handler: {}", e)))?;
    sigterm.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_sigterm() -> Result<()> {
    // Ctrl+C still works
    std::future::pending::<()>().await;
    Ok(())
}
