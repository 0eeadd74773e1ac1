use anyhow::Context;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

use crate::risk::{RiskMetrics, RiskParam};

/// Operator commands, handled by the engine between evaluations
#[derive(Debug)]
pub enum EngineCommand {
    /// Veto all new entries; exits still run
    Pause,
    Resume,
    /// Lift a protection-failure halt for one symbol
    ResumeSymbol(String),
    /// Flatten one symbol now
    ForceClose(String),
    SetRiskParam(RiskParam),
    /// Reply with a risk and performance snapshot
    QueryMetrics(oneshot::Sender<RiskMetrics>),
}

/// Cloneable control surface for a running engine
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<EngineCommand>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl EngineHandle {
    pub(crate) fn new(commands: mpsc::Sender<EngineCommand>, shutdown: watch::Sender<bool>) -> Self {
        Self {
            commands,
            shutdown: Arc::new(shutdown),
        }
    }

    pub async fn send(&self, command: EngineCommand) -> anyhow::Result<()> {
        self.commands
            .send(command)
            .await
            .context("Engine is no longer running")
    }

    pub async fn pause(&self) -> anyhow::Result<()> {
        self.send(EngineCommand::Pause).await
    }

    pub async fn resume(&self) -> anyhow::Result<()> {
        self.send(EngineCommand::Resume).await
    }

    pub async fn resume_symbol(&self, symbol: &str) -> anyhow::Result<()> {
        self.send(EngineCommand::ResumeSymbol(symbol.to_string())).await
    }

    pub async fn force_close(&self, symbol: &str) -> anyhow::Result<()> {
        self.send(EngineCommand::ForceClose(symbol.to_string())).await
    }

    pub async fn set_risk_param(&self, param: RiskParam) -> anyhow::Result<()> {
        self.send(EngineCommand::SetRiskParam(param)).await
    }

    pub async fn metrics(&self) -> anyhow::Result<RiskMetrics> {
        let (reply, response) = oneshot::channel();
        self.send(EngineCommand::QueryMetrics(reply)).await?;
        response.await.context("Engine dropped the metrics request")
    }

    /// Stop the engine and every feed task watching the same signal
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

/// Command channel plus shutdown signal for one engine
pub fn channel(buffer: usize) -> (EngineHandle, mpsc::Receiver<EngineCommand>, watch::Receiver<bool>) {
    let (command_tx, command_rx) = mpsc::channel(buffer.max(1));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    (EngineHandle::new(command_tx, shutdown_tx), command_rx, shutdown_rx)
}
