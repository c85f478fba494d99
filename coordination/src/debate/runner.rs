//! Per-debate task: feeds bus frames and control commands into the
//! [`Moderator`] and publishes what it reports.
//!
//! One task per debate, so transitions within a debate are totally ordered
//! while separate debates run in parallel. The task exits when the debate
//! finishes or its cancellation token fires.
//!
//! Outbound payloads go through an outbox and leave it only once the bus
//! accepts them, so a bus outage delays signals and verdicts but never
//! reorders or loses them. A finished debate keeps retrying its backlog
//! until it drains or the task is cancelled.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::moderator::{Moderator, TurnReport};
use super::session::{Debate, DebateStatus};
use crate::events::{
    decode_response, publish_with_retry, BusError, BusPayload, FilteredReceiver, RetryPolicy,
    SharedBus,
};

/// Control commands routed to a running debate.
#[derive(Debug, Clone, PartialEq)]
pub enum ModeratorCommand {
    Query(String),
    Pause(String),
    Resume,
    Abort(String),
}

/// Async driver around a [`Moderator`].
pub struct DebateRunner {
    moderator: Moderator,
    bus: SharedBus,
    responses: FilteredReceiver,
    commands: mpsc::Receiver<ModeratorCommand>,
    snapshots: watch::Sender<Debate>,
    cancel: CancellationToken,
    retry: RetryPolicy,
    idle_timeout: Option<Duration>,
    /// Payloads not yet accepted by the bus, oldest first.
    outbox: VecDeque<BusPayload>,
}

impl DebateRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        moderator: Moderator,
        bus: SharedBus,
        responses: FilteredReceiver,
        commands: mpsc::Receiver<ModeratorCommand>,
        snapshots: watch::Sender<Debate>,
        cancel: CancellationToken,
        retry: RetryPolicy,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            moderator,
            bus,
            responses,
            commands,
            snapshots,
            cancel,
            retry,
            idle_timeout,
            outbox: VecDeque::new(),
        }
    }

    pub async fn run(mut self) {
        let debate_id = self.moderator.debate().id.clone();
        info!(debate_id = %debate_id, participants = ?self.moderator.debate().participants, "Debate started");

        let opening = self.moderator.open();
        self.emit(opening).await;
        self.publish_snapshot();

        let mut last_activity = Instant::now();
        let mut responses_open = true;
        let mut cancelled = false;

        while !self.moderator.debate().status.is_finished() {
            let idle_deadline = match self.idle_timeout {
                Some(timeout) if self.moderator.debate().status == DebateStatus::Active => {
                    Some(last_activity + timeout)
                }
                _ => None,
            };

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!(debate_id = %debate_id, "Debate task cancelled");
                    cancelled = true;
                    break;
                }

                command = self.commands.recv() => {
                    let Some(command) = command else {
                        debug!(debate_id = %debate_id, "Command channel closed");
                        break;
                    };
                    let resumed = command == ModeratorCommand::Resume;
                    let report = self.handle_command(command);
                    if resumed && report.accepted {
                        last_activity = Instant::now();
                    }
                    self.emit(report).await;
                }

                frame = self.responses.recv(), if responses_open => match frame {
                    Ok(frame) => match decode_response(&frame) {
                        Ok(event) => {
                            let report = self.moderator.on_response(event);
                            if report.accepted {
                                last_activity = Instant::now();
                            }
                            self.emit(report).await;
                        }
                        Err(e) => warn!(debate_id = %debate_id, error = %e, "Dropping malformed response"),
                    },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(debate_id = %debate_id, skipped = n, "Response stream lagged, some responses dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        error!(debate_id = %debate_id, "Response channel closed");
                        responses_open = false;
                        let report = self.moderator.pause("response channel closed");
                        self.emit(report).await;
                    }
                },

                _ = sleep_until_deadline(idle_deadline) => {
                    let report = self.moderator.on_idle_timeout();
                    self.emit(report).await;
                }
            }

            self.publish_snapshot();
        }

        self.publish_snapshot();
        if !cancelled {
            self.drain_outbox().await;
        }
        if !self.outbox.is_empty() {
            warn!(
                debate_id = %debate_id,
                undelivered = self.outbox.len(),
                "Debate task exiting with undelivered payloads"
            );
        }
        info!(
            debate_id = %debate_id,
            status = %self.moderator.debate().status,
            responses = self.moderator.debate().history.len(),
            "Debate task finished"
        );
    }

    fn handle_command(&mut self, command: ModeratorCommand) -> TurnReport {
        match command {
            ModeratorCommand::Query(text) => self.moderator.on_query(&text),
            ModeratorCommand::Pause(reason) => self.moderator.pause(&reason),
            ModeratorCommand::Resume => self.moderator.resume(),
            ModeratorCommand::Abort(reason) => self.moderator.abort(&reason),
        }
    }

    /// Queue signals then the result, and flush the outbox. A bus outage
    /// that outlasts the retry policy pauses an active debate; the backlog
    /// goes out ahead of anything emitted after it.
    async fn emit(&mut self, report: TurnReport) {
        self.outbox.extend(
            report
                .signals
                .into_iter()
                .map(BusPayload::Signal)
                .chain(report.result.map(BusPayload::Arbitration)),
        );

        if let Err(e) = self.flush().await {
            error!(
                debate_id = %self.moderator.debate().id,
                backlog = self.outbox.len(),
                error = %e,
                "Bus unavailable"
            );
            if self.moderator.debate().status == DebateStatus::Active {
                let paused = self.moderator.pause("message bus unavailable");
                self.outbox
                    .extend(paused.signals.into_iter().map(BusPayload::Signal));
            }
        }
    }

    /// Publish from the front of the outbox until it is empty or the bus
    /// fails. Payloads that cannot be encoded are dropped.
    async fn flush(&mut self) -> Result<(), BusError> {
        while let Some(payload) = self.outbox.front() {
            match publish_with_retry(self.bus.as_ref(), payload, self.retry).await {
                Ok(_) => {}
                Err(BusError::Encode(e)) => {
                    error!(
                        debate_id = %self.moderator.debate().id,
                        kind = payload.kind(),
                        error = %e,
                        "Dropping payload that cannot be encoded"
                    );
                }
                Err(e) => return Err(e),
            }
            self.outbox.pop_front();
        }
        Ok(())
    }

    /// Keep retrying the backlog of a finished debate until the bus takes it
    /// or the task is cancelled.
    async fn drain_outbox(&mut self) {
        while !self.outbox.is_empty() {
            if self.flush().await.is_ok() {
                break;
            }
            debug!(
                debate_id = %self.moderator.debate().id,
                backlog = self.outbox.len(),
                "Outbox not drained, retrying"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.retry.base_backoff.max(Duration::from_millis(1))) => {}
            }
        }
    }

    fn publish_snapshot(&self) {
        self.snapshots.send_replace(self.moderator.debate().clone());
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
