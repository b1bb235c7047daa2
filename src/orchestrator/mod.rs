//! Turn orchestration: admission, one process per turn, event pumping and
//! teardown.
//!
//! [`Orchestrator::start_turn`] spawns a pump task and hands back a
//! [`TurnStream`]. The pump owns the turn's admission ticket and process; it
//! feeds events into a bounded channel the caller drains, so a slow caller
//! applies backpressure all the way to the child's stdout pipe. Whatever way
//! the turn ends, the pump shuts the process down, releases the ticket and
//! resolves the stream's [`TurnOutcome`].

pub mod admission;
pub mod control;
pub mod message;
pub mod process;
pub mod turn;

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::GatewayConfig;
use crate::errors::OrchestratorError;
use crate::session::SessionStore;
use crate::stream::{ProtocolEvent, RecordReader, SequenceGuard, demux_record};

pub use admission::{AdmissionController, AdmissionTicket};
pub use control::{ControlDelivery, ControlMessage, ControlPlane, PermissionWireFormat};
pub use process::{
    ExitInfo, LaunchSpec, ProcessHandle, ShutdownGrace, ShutdownReason, StdinWriter, Termination,
};
pub use turn::{Turn, TurnOutcome, TurnStatus, generate_conversation_id};

/// Events buffered between the pump and a slow caller.
const EVENT_BUFFER: usize = 64;

/// Characters of stderr included in an error event.
const STDERR_IN_ERROR_CHARS: usize = 500;

/// Runs turns against the assistant CLI under a shared admission gate.
#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<GatewayConfig>,
    admission: AdmissionController,
    sessions: Arc<dyn SessionStore>,
}

impl Orchestrator {
    pub fn new(config: Arc<GatewayConfig>, sessions: Arc<dyn SessionStore>) -> Self {
        let admission = AdmissionController::new(config.limits.max_concurrent);
        Self {
            config,
            admission,
            sessions,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    /// Start a turn in the background.
    ///
    /// The returned stream yields the turn's events in emission order and ends
    /// after exactly one terminal event, or with none if the turn is abandoned.
    pub fn start_turn(&self, turn: Turn) -> TurnStream {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let (slot_tx, slot_rx) = watch::channel(None);
        let cancel = CancellationToken::new();
        let conversation_id = turn.conversation_id.clone();

        let pump = TurnPump {
            config: self.config.clone(),
            admission: self.admission.clone(),
            sessions: self.sessions.clone(),
            tx,
            slot: slot_tx,
            cancel: cancel.clone(),
        };
        let outcome = tokio::spawn(pump.run(turn));

        TurnStream {
            conversation_id,
            events: rx,
            process: slot_rx,
            cancel,
            outcome,
        }
    }

    /// Run a turn and wait for its outcome, discarding intermediate events.
    pub async fn run_to_completion(&self, turn: Turn) -> Result<TurnOutcome, OrchestratorError> {
        self.start_turn(turn).finish().await
    }
}

/// Caller's side of a running turn.
pub struct TurnStream {
    conversation_id: String,
    events: mpsc::Receiver<ProtocolEvent>,
    process: watch::Receiver<Option<StdinWriter>>,
    cancel: CancellationToken,
    outcome: JoinHandle<TurnOutcome>,
}

impl TurnStream {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Next event, or `None` once the turn has emitted everything.
    pub async fn next_event(&mut self) -> Option<ProtocolEvent> {
        self.events.recv().await
    }

    /// Watch slot holding the live process's stdin while it is running.
    pub fn process_slot(&self) -> watch::Receiver<Option<StdinWriter>> {
        self.process.clone()
    }

    /// Abandon the turn without waiting. The process is torn down and no
    /// further events are produced.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Drain any remaining events and wait for the outcome.
    pub async fn finish(mut self) -> Result<TurnOutcome, OrchestratorError> {
        while let Some(event) = self.events.recv().await {
            debug!(conversation_id = %self.conversation_id, event = event.kind(), "draining event");
        }
        self.outcome
            .await
            .map_err(|e| OrchestratorError::Other(anyhow::anyhow!("turn task failed: {}", e)))
    }

    /// Cancel and wait until the process is gone.
    pub async fn abandon(self) -> Result<TurnOutcome, OrchestratorError> {
        self.cancel.cancel();
        drop(self.events);
        self.outcome
            .await
            .map_err(|e| OrchestratorError::Other(anyhow::anyhow!("turn task failed: {}", e)))
    }
}

/// How the read loop ended.
enum PumpEnd {
    /// A terminal event was delivered; `error` is set for `StreamError`
    Terminal { error: Option<String> },
    /// Stdout closed before any terminal event
    Eof,
    /// Timeout, output cap or read failure
    Failed(OrchestratorError),
    /// The caller went away
    Cancelled,
}

struct TurnPump {
    config: Arc<GatewayConfig>,
    admission: AdmissionController,
    sessions: Arc<dyn SessionStore>,
    tx: mpsc::Sender<ProtocolEvent>,
    slot: watch::Sender<Option<StdinWriter>>,
    cancel: CancellationToken,
}

impl TurnPump {
    async fn run(self, turn: Turn) -> TurnOutcome {
        let started = Instant::now();
        let conversation_id = turn.conversation_id.clone();

        let admitted = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            _ = self.tx.closed() => None,
            ticket = self.admission.acquire() => Some(ticket),
        };
        let ticket = match admitted {
            None => {
                debug!(conversation_id = %conversation_id, "turn abandoned while waiting for admission");
                return self.outcome(&conversation_id, TurnStatus::Abandoned, String::new(), None, None, started);
            }
            Some(Err(e)) => {
                let message = e.to_string();
                let mut guard = SequenceGuard::new();
                self.emit(&mut guard, ProtocolEvent::stream_error(message.clone())).await;
                return self.outcome(&conversation_id, TurnStatus::Failed(message), String::new(), None, None, started);
            }
            Some(Ok(ticket)) => ticket,
        };
        info!(
            conversation_id = %conversation_id,
            waited_ms = ticket.admitted_at().duration_since(started).as_millis() as u64,
            in_use = self.admission.in_use(),
            "turn admitted"
        );

        let outcome = self.run_admitted(turn, started).await;
        drop(ticket);

        info!(
            conversation_id = %conversation_id,
            status = ?outcome.status,
            elapsed = outcome.elapsed_secs(),
            "turn finished"
        );
        outcome
    }

    async fn run_admitted(&self, turn: Turn, started: Instant) -> TurnOutcome {
        let config = &self.config;
        let conversation_id = turn.conversation_id.as_str();

        let resume_token = match &turn.resume_token {
            Some(token) => Some(token.clone()),
            None => match self.sessions.get(conversation_id).await {
                Ok(token) => token,
                Err(e) => {
                    warn!(conversation_id, error = %e, "failed to look up session; starting fresh");
                    None
                }
            },
        };

        let assembled = message::assemble(&turn, &config.storage.upload_dir, &config.limits).await;
        let model = turn
            .model
            .clone()
            .unwrap_or_else(|| config.assistant.model.clone());
        let spec = LaunchSpec::for_turn(
            &config.assistant,
            &model,
            resume_token.as_deref(),
            &assembled.image_paths,
        );
        let grace = ShutdownGrace {
            exit: config.exit_grace(),
            terminate: config.terminate_grace(),
        };

        let mut guard = SequenceGuard::new();
        let mut process = match ProcessHandle::spawn(&spec, grace) {
            Ok(process) => process,
            Err(e) => {
                error!(conversation_id, error = %e, "failed to start assistant");
                let message = e.to_string();
                self.emit(&mut guard, ProtocolEvent::stream_error(message.clone())).await;
                return self.outcome(conversation_id, TurnStatus::Failed(message), String::new(), None, None, started);
            }
        };

        let Some(stdout) = process.take_stdout() else {
            let exit = process.abort().await;
            let message = "Assistant stdout was not captured".to_string();
            self.emit(&mut guard, ProtocolEvent::stream_error(message.clone())).await;
            return self.outcome(conversation_id, TurnStatus::Failed(message), String::new(), None, Some(exit), started);
        };

        process.set_write_timeout(config.idle_timeout());
        self.slot.send_replace(Some(process.stdin()));

        let deadline = tokio::time::Instant::now() + config.turn_timeout();
        let mut reader = RecordReader::new(
            stdout,
            config.idle_timeout(),
            config.limits.max_lines,
            config.limits.max_line_bytes,
        );
        let end = match self
            .open_turn(&process, &assembled.text, conversation_id, deadline)
            .await
        {
            Some(end) => end,
            None => {
                self.pump_events(&mut reader, &mut guard, &mut process, conversation_id, deadline)
                    .await
            }
        };
        self.slot.send_replace(None);

        let (status, exit) = match end {
            PumpEnd::Terminal { error } => {
                let exit = process.close().await;
                if !exit.success() {
                    warn!(conversation_id, exit = %exit.describe(), "assistant exited abnormally after its final event");
                }
                let status = match error {
                    None => TurnStatus::Completed,
                    Some(message) => TurnStatus::Failed(message),
                };
                (status, exit)
            }
            PumpEnd::Eof => {
                let exit = process.close().await;
                let event = if exit.success() {
                    debug!(conversation_id, "stdout closed without a result; synthesizing one");
                    ProtocolEvent::FinalResult {
                        text: guard.text().to_string(),
                        cost: None,
                        usage: Value::Object(Default::default()),
                        permission_denials: Vec::new(),
                        is_error: false,
                    }
                } else {
                    ProtocolEvent::stream_error(exit_error_message(&exit, &process.stderr_tail()))
                };
                let status = match &event {
                    ProtocolEvent::StreamError { message } => TurnStatus::Failed(message.clone()),
                    _ => TurnStatus::Completed,
                };
                let status = if self.emit(&mut guard, event).await {
                    status
                } else {
                    TurnStatus::Abandoned
                };
                (status, exit)
            }
            PumpEnd::Failed(err) => {
                let message = err.to_string();
                warn!(conversation_id, lines = reader.lines_seen(), error = %message, "aborting turn");
                let exit = process.abort().await;
                // Nothing terminal has reached the caller yet, even if the
                // guard accepted one that was still waiting for delivery
                let delivered = self.send(ProtocolEvent::stream_error(message.clone())).await;
                let status = if delivered {
                    TurnStatus::Failed(message)
                } else {
                    TurnStatus::Abandoned
                };
                (status, exit)
            }
            PumpEnd::Cancelled => {
                info!(conversation_id, "caller went away; abandoning turn");
                (TurnStatus::Abandoned, process.abort().await)
            }
        };

        let text = match status {
            TurnStatus::Abandoned => String::new(),
            TurnStatus::Completed => guard.response_text(),
            TurnStatus::Failed(_) => guard.text().to_string(),
        };
        let session_token = process.session_token().map(str::to_string);
        self.outcome(conversation_id, status, text, session_token, Some(exit), started)
    }

    async fn pump_events<R>(
        &self,
        reader: &mut RecordReader<R>,
        guard: &mut SequenceGuard,
        process: &mut ProcessHandle,
        conversation_id: &str,
        deadline: tokio::time::Instant,
    ) -> PumpEnd
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        loop {
            let record = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return PumpEnd::Cancelled,
                _ = self.tx.closed() => return PumpEnd::Cancelled,
                _ = tokio::time::sleep_until(deadline) => return self.timed_out(),
                record = reader.next_record() => record,
            };
            let record = match record {
                Ok(Some(record)) => record,
                Ok(None) => return PumpEnd::Eof,
                Err(e) => return PumpEnd::Failed(e.into()),
            };

            for event in demux_record(&record) {
                let Some(event) = guard.accept(event) else {
                    continue;
                };
                if let ProtocolEvent::SystemInit { session_token, .. } = &event {
                    process.set_session_token(session_token.clone());
                    let stored =
                        tokio::time::timeout_at(deadline, self.sessions.put(conversation_id, session_token))
                            .await;
                    match stored {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            warn!(conversation_id, error = %e, "failed to persist session mapping")
                        }
                        Err(_) => return self.timed_out(),
                    }
                }
                let error = match &event {
                    ProtocolEvent::StreamError { message } => Some(message.clone()),
                    _ => None,
                };
                let terminal = event.is_terminal();
                if let Err(end) = self.deliver(event, deadline).await {
                    return end;
                }
                if terminal {
                    return PumpEnd::Terminal { error };
                }
            }
        }
    }

    /// Write the opening user message, giving up if the caller leaves or the
    /// turn runs out of time first. Returns how the turn ended if it did.
    async fn open_turn(
        &self,
        process: &ProcessHandle,
        text: &str,
        conversation_id: &str,
        deadline: tokio::time::Instant,
    ) -> Option<PumpEnd> {
        let sent = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Some(PumpEnd::Cancelled),
            _ = self.tx.closed() => return Some(PumpEnd::Cancelled),
            _ = tokio::time::sleep_until(deadline) => return Some(self.timed_out()),
            sent = process.send_user_message(text) => sent,
        };
        match sent {
            Ok(()) => None,
            Err(e @ OrchestratorError::StdinWriteTimeout { .. }) => Some(PumpEnd::Failed(e)),
            Err(e) => {
                // The read side reports the process's death on its own
                warn!(conversation_id, error = %e, "failed to write user message");
                None
            }
        }
    }

    /// Deliver a pumped event. Fails if the caller goes away or the turn's
    /// deadline passes while the caller is not draining.
    async fn deliver(
        &self,
        event: ProtocolEvent,
        deadline: tokio::time::Instant,
    ) -> Result<(), PumpEnd> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PumpEnd::Cancelled),
            _ = tokio::time::sleep_until(deadline) => Err(self.timed_out()),
            sent = self.tx.send(event) => sent.map_err(|_| PumpEnd::Cancelled),
        }
    }

    /// Send an event unless the caller has gone away.
    async fn send(&self, event: ProtocolEvent) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(event) => sent.is_ok(),
        }
    }

    /// Send an event the pump produced itself once the process is gone,
    /// keeping the guard's ordering rules.
    async fn emit(&self, guard: &mut SequenceGuard, event: ProtocolEvent) -> bool {
        match guard.accept(event) {
            Some(event) => self.send(event).await,
            None => true,
        }
    }

    fn timed_out(&self) -> PumpEnd {
        PumpEnd::Failed(OrchestratorError::TurnTimeout {
            secs: self.config.limits.turn_timeout_secs,
        })
    }

    fn outcome(
        &self,
        conversation_id: &str,
        status: TurnStatus,
        text: String,
        session_token: Option<String>,
        exit: Option<ExitInfo>,
        started: Instant,
    ) -> TurnOutcome {
        TurnOutcome {
            conversation_id: conversation_id.to_string(),
            status,
            text,
            session_token,
            exit,
            elapsed: started.elapsed(),
        }
    }
}

fn exit_error_message(exit: &ExitInfo, stderr_tail: &str) -> String {
    let mut message = format!("Assistant process ended without a result ({})", exit.describe());
    if !stderr_tail.is_empty() {
        let chars = stderr_tail.chars().count();
        let tail: String = stderr_tail
            .chars()
            .skip(chars.saturating_sub(STDERR_IN_ERROR_CHARS))
            .collect();
        message.push_str(": ");
        message.push_str(&tail);
    }
    message
}
