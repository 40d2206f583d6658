//! A single device worker: one coordinator connection, one engine.
//!
//! Commands are handled one at a time in arrival order. `run` is the only
//! command that outlives its handler: the engine runs on a blocking thread
//! and reports generations through the same outbound queue as every other
//! result, followed by exactly one `end`.

use anyhow::{Context, Result};
use futures::StreamExt;
use gaia_ga_protocol::{
    BestResult, Command, CommandKind, DeviceInfo, FrameCodec, GenerationResult, ProtocolError,
    RunParams, WorkerResult,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::config::CoordinatorAddr;
use crate::connection::{self, ResultSender};
use crate::device::{Device, DeviceContext};
use crate::engine::{Engine, EngineFactory, GenerationCallback};
use crate::error::CommandError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Initializing,
    ContextAcquired,
    Connected,
    Idle,
    Prepared,
    Running,
    Paused,
    Stopped,
    Exited,
    Failed,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Initializing => "initializing",
            WorkerState::ContextAcquired => "context_acquired",
            WorkerState::Connected => "connected",
            WorkerState::Idle => "idle",
            WorkerState::Prepared => "prepared",
            WorkerState::Running => "running",
            WorkerState::Paused => "paused",
            WorkerState::Stopped => "stopped",
            WorkerState::Exited => "exited",
            WorkerState::Failed => "failed",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// States in which an engine exists.
const PREPARED_STATES: &[WorkerState] =
    &[WorkerState::Prepared, WorkerState::Running, WorkerState::Paused, WorkerState::Stopped];
const PAUSABLE_STATES: &[WorkerState] =
    &[WorkerState::Prepared, WorkerState::Running, WorkerState::Paused];
const RESTORABLE_STATES: &[WorkerState] =
    &[WorkerState::Prepared, WorkerState::Paused, WorkerState::Stopped];

pub struct Worker {
    device: Device,
    context: Option<DeviceContext>,
    factory: Arc<dyn EngineFactory>,
    engine: Option<Arc<dyn Engine>>,
    state: Arc<Mutex<WorkerState>>,
    connection: Option<connection::Connection>,
    /// Held from an accepted `run` until its `end` is queued. Set and
    /// released under the `state` lock.
    run_active: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl Worker {
    /// `device` may be an unprobed slot; it is replaced on acquisition.
    pub fn new(
        device: Device,
        factory: Arc<dyn EngineFactory>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            device,
            context: None,
            factory,
            engine: None,
            state: Arc::new(Mutex::new(WorkerState::Initializing)),
            connection: None,
            run_active: Arc::new(AtomicBool::new(false)),
            shutdown,
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.run_active.load(Ordering::SeqCst)
    }

    /// Acquire the device, connect to the coordinator and serve until exit.
    pub async fn run(mut self, coordinator: &CoordinatorAddr) -> Result<()> {
        let context = match DeviceContext::acquire(&self.device) {
            Ok(context) => context,
            Err(e) => {
                self.set_state(WorkerState::Failed);
                tracing::error!(worker = %self.device.name, "Create device context failed: {e:#}");
                return Err(e.context("Create device context failed"));
            }
        };
        self.bind(context);
        tracing::info!(worker = %self.device.name, "Worker created for device");
        self.connect(coordinator).await
    }

    /// Bind an acquired device context.
    pub fn bind(&mut self, context: DeviceContext) {
        self.device = context.device.clone();
        self.context = Some(context);
        self.set_state(WorkerState::ContextAcquired);
    }

    /// Connect once and serve. A refused connection is fatal, never retried.
    pub async fn connect(self, coordinator: &CoordinatorAddr) -> Result<()> {
        tracing::info!(worker = %self.device.name, %coordinator, "Connecting to coordinator");
        let stream = match TcpStream::connect((coordinator.host.as_str(), coordinator.port)).await {
            Ok(stream) => stream,
            Err(e) => {
                self.set_state(WorkerState::Failed);
                tracing::error!(
                    worker = %self.device.name,
                    "Connection refused! Please check server status."
                );
                let context = format!("Failed to connect to {coordinator}");
                return Err(anyhow::Error::from(e).context(context));
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY: {e}");
        }
        self.serve(stream).await
    }

    /// Announce the device, then dispatch commands until exit, coordinator
    /// EOF or shutdown.
    pub async fn serve<T>(mut self, io: T) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.context.as_ref().context("Worker served before a device context was bound")?;

        let (sink, mut frames) = Framed::new(io, FrameCodec::default()).split();
        let (connection, writer) = connection::open(sink, self.shutdown.clone());
        self.connection = Some(connection);
        self.set_state(WorkerState::Connected);

        self.emit(WorkerResult::DeviceInfo(DeviceInfo {
            device_name: self.device.name.clone(),
            platform_index: self.device.platform_index,
            device_index: self.device.device_index,
        }));
        self.set_state(WorkerState::Idle);
        tracing::info!(worker = %self.device.name, "Waiting for commands");

        let shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                frame = frames.next() => match frame {
                    Some(Ok(body)) => self.dispatch(&body),
                    Some(Err(e)) => {
                        tracing::warn!(worker = %self.device.name, "Connection error: {e}");
                        break;
                    }
                    None => {
                        let worker = &self.device.name;
                        tracing::info!(%worker, "Coordinator closed the connection");
                        break;
                    }
                }
            }
        }

        self.close();
        if let Err(e) = writer.await {
            tracing::warn!("Result writer ended abnormally: {e}");
        }
        Ok(())
    }

    /// Decode and handle one frame body. Every failure ends here, logged.
    pub fn dispatch(&mut self, body: &[u8]) {
        let command = match Command::decode(body) {
            Ok(command) => command,
            Err(ProtocolError::UnknownCommand(name)) => {
                tracing::error!(worker = %self.device.name, "Unknown command '{name}'");
                return;
            }
            Err(e) => {
                tracing::error!(worker = %self.device.name, "Rejected command: {e}");
                return;
            }
        };

        let kind = command.kind();
        tracing::debug!(worker = %self.device.name, command = %kind, "Received command");
        let outcome = catch_unwind(AssertUnwindSafe(|| self.handle(command)))
            .unwrap_or(Err(CommandError::Panicked(kind)));

        match outcome {
            Ok(()) => {}
            Err(err) if err.is_rejection() => {
                tracing::error!(worker = %self.device.name, state = %self.state(), "{err}");
            }
            Err(err) => {
                tracing::error!(worker = %self.device.name, "{:#}", anyhow::Error::from(err));
            }
        }
    }

    pub fn handle(&mut self, command: Command) -> Result<(), CommandError> {
        let kind = command.kind();
        if kind.requires_engine() && self.engine.is_none() {
            return Err(CommandError::NotPrepared(kind));
        }

        match command {
            Command::Prepare(options) => self.prepare(options),
            Command::Pause => {
                let engine = self.expect_engine(kind, PAUSABLE_STATES)?;
                engine.pause();
                self.set_state(WorkerState::Paused);
                Ok(())
            }
            Command::Stop => {
                let engine = self.expect_engine(kind, PREPARED_STATES)?;
                engine.stop();
                self.set_state(WorkerState::Stopped);
                Ok(())
            }
            Command::Restore(blob) => {
                let engine = self.expect_engine(kind, RESTORABLE_STATES)?;
                if self.is_running() {
                    return Err(CommandError::AlreadyRunning);
                }
                engine.restore(blob.as_bytes()).map_err(|e| CommandError::engine(kind, e))?;
                self.set_state(WorkerState::Prepared);
                Ok(())
            }
            Command::Save(destination) => {
                let engine = self.expect_engine(kind, PREPARED_STATES)?;
                engine.save(&destination).map_err(|e| CommandError::engine(kind, e))?;
                self.emit(WorkerResult::Save);
                Ok(())
            }
            Command::Best => {
                let engine = self.expect_engine(kind, PREPARED_STATES)?;
                let best: BestResult = engine.best().map_err(|e| CommandError::engine(kind, e))?;
                self.emit(WorkerResult::Best(best));
                Ok(())
            }
            Command::Statistics => {
                let engine = self.expect_engine(kind, PREPARED_STATES)?;
                let stats = engine.statistics().map_err(|e| CommandError::engine(kind, e))?;
                self.emit(WorkerResult::Statistics(stats));
                Ok(())
            }
            Command::Run(params) => self.start_run(params),
            Command::Exit => {
                self.exit();
                Ok(())
            }
        }
    }

    fn prepare(&mut self, options: Value) -> Result<(), CommandError> {
        if self.engine.is_some() {
            return Err(CommandError::AlreadyPrepared);
        }
        let state = self.state();
        let context = match (&self.context, state) {
            (Some(context), WorkerState::Idle) => context.clone(),
            _ => return Err(CommandError::InvalidState { command: CommandKind::Prepare, state }),
        };

        let engine = self
            .factory
            .create(options, context, self.generation_callback())
            .map_err(|e| CommandError::engine(CommandKind::Prepare, e))?;
        engine.prepare().map_err(|e| CommandError::engine(CommandKind::Prepare, e))?;

        self.engine = Some(engine);
        self.set_state(WorkerState::Prepared);
        tracing::info!(worker = %self.device.name, "GA engine prepared");
        Ok(())
    }

    fn start_run(&mut self, params: RunParams) -> Result<(), CommandError> {
        let engine = self.engine.clone().ok_or(CommandError::NotPrepared(CommandKind::Run))?;
        {
            // guard and state change together with the run thread's release
            let mut state = self.state.lock();
            if *state == WorkerState::Running || self.run_active.load(Ordering::SeqCst) {
                return Err(CommandError::AlreadyRunning);
            }
            if !matches!(*state, WorkerState::Prepared | WorkerState::Paused) {
                return Err(CommandError::InvalidState { command: CommandKind::Run, state: *state });
            }
            engine.resume();
            self.run_active.store(true, Ordering::SeqCst);
            let (from, to) = (*state, WorkerState::Running);
            tracing::debug!(worker = %self.device.name, %from, %to, "State change");
            *state = to;
        }

        let RunParams { mutation_rate, crossover_rate } = params;
        tracing::info!(worker = %self.device.name, mutation_rate, crossover_rate, "GA run started");

        let shared_state = self.state.clone();
        let run_active = self.run_active.clone();
        let sender = self.sender();
        let worker = self.device.name.clone();
        tokio::task::spawn_blocking(move || {
            match catch_unwind(AssertUnwindSafe(|| engine.run(mutation_rate, crossover_rate))) {
                Ok(Ok(())) => tracing::info!(worker = %worker, "GA run finished"),
                Ok(Err(e)) => tracing::error!(worker = %worker, "GA run failed: {e:#}"),
                Err(_) => tracing::error!(worker = %worker, "GA run panicked"),
            }
            let mut state = shared_state.lock();
            if *state == WorkerState::Running {
                *state = WorkerState::Prepared;
            }
            if let Some(sender) = sender {
                sender.send(WorkerResult::End);
            }
            run_active.store(false, Ordering::SeqCst);
        });
        Ok(())
    }

    fn exit(&mut self) {
        match self.connection.take() {
            Some(connection) => {
                tracing::info!(worker = %self.device.name, "Exit requested, closing connection");
                connection.close();
                self.shutdown.cancel();
                self.set_state(WorkerState::Exited);
            }
            None => {
                let worker = &self.device.name;
                tracing::debug!(%worker, "Exit ignored, connection already closed");
            }
        }
    }

    fn close(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
            if self.state() != WorkerState::Failed {
                self.set_state(WorkerState::Exited);
            }
        }
    }

    fn generation_callback(&self) -> GenerationCallback {
        let sender = self.sender();
        let worker = self.device.name.clone();
        Arc::new(move |index, stats| {
            tracing::debug!(
                worker = %worker,
                "{index}\t==> {} ~ {} ~ {}",
                stats.best,
                stats.avg,
                stats.worst
            );
            if let Some(sender) = &sender {
                let result = GenerationResult { index, result: stats };
                sender.send(WorkerResult::GenerationResult(result));
            }
        })
    }

    fn expect_engine(
        &self,
        command: CommandKind,
        allowed: &[WorkerState],
    ) -> Result<Arc<dyn Engine>, CommandError> {
        let engine = self.engine.clone().ok_or(CommandError::NotPrepared(command))?;
        let state = self.state();
        if !allowed.contains(&state) {
            return Err(CommandError::InvalidState { command, state });
        }
        Ok(engine)
    }

    fn sender(&self) -> Option<ResultSender> {
        self.connection.as_ref().map(|c| c.sender().clone())
    }

    fn emit(&self, result: WorkerResult) {
        match &self.connection {
            Some(connection) => {
                connection.sender().send(result);
            }
            None => tracing::debug!(kind = result.kind(), "No connection, result dropped"),
        }
    }

    fn set_state(&self, next: WorkerState) {
        let mut state = self.state.lock();
        let from = *state;
        if from != next {
            tracing::debug!(worker = %self.device.name, %from, to = %next, "State change");
            *state = next;
        }
    }

    #[cfg(test)]
    fn attach(&mut self, connection: connection::Connection) {
        self.connection = Some(connection);
        self.set_state(WorkerState::Idle);
    }
}
