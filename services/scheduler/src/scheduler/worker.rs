//! Scheduler event loop.
//!
//! Consumes inbound events and operator commands until shutdown is
//! signaled or the event stream closes. Commands and shutdown are polled
//! before events so an interrupt lands before the next offer cycle.

use std::sync::Arc;

use keel_events::{InboundEvent, OutboundMessage};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, instrument, warn};

use super::{Command, Scheduler};
use crate::transport::Transport;

/// Drives a [`Scheduler`] from channels.
pub struct SchedulerWorker {
    scheduler: Scheduler,
    transport: Arc<dyn Transport>,
}

impl SchedulerWorker {
    pub fn new(scheduler: Scheduler, transport: Arc<dyn Transport>) -> Self {
        Self {
            scheduler,
            transport,
        }
    }

    /// Run until shutdown is signaled or `events` closes, returning the
    /// scheduler.
    #[instrument(skip_all)]
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<InboundEvent>,
        mut commands: mpsc::Receiver<Command>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Scheduler {
        info!(service = %self.scheduler.spec().name, "Starting scheduler worker");

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Scheduler worker shutting down");
                        break;
                    }
                }
                Some(command) = commands.recv() => {
                    match self.scheduler.handle_command(command) {
                        Ok(messages) => self.send_all(messages).await,
                        Err(e) => warn!(error = %e, "Command rejected"),
                    }
                }
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        info!("Event stream closed");
                        break;
                    }
                },
            }
        }

        self.scheduler
    }

    async fn handle_event(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::Offers { offers } => {
                match self.scheduler.process_offers(offers) {
                    Ok((messages, _)) => self.send_all(messages).await,
                    Err(e) => error!(error = %e, "Offer cycle failed"),
                }
            }
            InboundEvent::Status { update } => {
                if let Err(e) = self.scheduler.handle_status(&update) {
                    error!(task_id = %update.task_id, error = %e, "Failed to apply status update");
                }
            }
        }
    }

    async fn send_all(&mut self, messages: Vec<OutboundMessage>) {
        for message in messages {
            if let Err(e) = self.transport.send(message).await {
                error!(error = %e, "Failed to send message");
            }
        }
    }
}
