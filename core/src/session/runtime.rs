// Async session runtime
//
// One tokio task owns the `BleSession`. Commands, radio events and freshness
// ticks are serialized through it, so no two mutations ever overlap. Observers
// follow the state through a `watch` channel.

use super::{BleSession, SessionCommand, SessionSnapshot};
use crate::settings::{SessionSettings, SettingsError};
use crate::transport::abstraction::{RadioBridge, RadioEvent};
use crate::SessionError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

/// Inputs serialized onto the session task
#[derive(Debug)]
enum SessionInput {
    Command(SessionCommand),
    Radio(RadioEvent),
    Shutdown,
}

/// Handle to communicate with the running session task
#[derive(Clone, Debug)]
pub struct SessionHandle {
    input_tx: mpsc::Sender<SessionInput>,
}

impl SessionHandle {
    async fn send(&self, input: SessionInput) -> Result<(), SessionError> {
        self.input_tx
            .send(input)
            .await
            .map_err(|_| SessionError::NotRunning)
    }

    /// Queue a user command
    pub async fn command(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.send(SessionInput::Command(command)).await
    }

    /// Forward an event from the radio stack
    pub async fn radio_event(&self, event: RadioEvent) -> Result<(), SessionError> {
        self.send(SessionInput::Radio(event)).await
    }

    /// Stop the session task after the inputs already queued
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.send(SessionInput::Shutdown).await
    }

    pub fn is_running(&self) -> bool {
        !self.input_tx.is_closed()
    }
}

/// Start a session task on the current tokio runtime
///
/// Returns the handle and a receiver that always holds the latest snapshot.
pub fn spawn_session(
    settings: SessionSettings,
    radio: Arc<dyn RadioBridge>,
) -> Result<(SessionHandle, watch::Receiver<SessionSnapshot>), SettingsError> {
    let tick_interval = Duration::from_millis(settings.tick_interval_ms);
    let capacity = settings.event_capacity;
    let mut session = BleSession::new(settings, radio)?;

    let (input_tx, mut input_rx) = mpsc::channel::<SessionInput>(capacity);
    let (snapshot_tx, snapshot_rx) = watch::channel(session.snapshot());

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                input = input_rx.recv() => {
                    match input {
                        Some(SessionInput::Command(command)) => session.execute(command),
                        Some(SessionInput::Radio(event)) => session.handle_event(event),
                        Some(SessionInput::Shutdown) | None => break,
                    }
                }
                _ = ticker.tick() => session.tick(),
            }

            if !session.take_changed() {
                continue;
            }
            let next = session.snapshot();
            snapshot_tx.send_if_modified(|current| {
                if *current == next {
                    false
                } else {
                    *current = next;
                    true
                }
            });
        }

        input_rx.close();
        tracing::info!("session task stopped");
    });

    Ok((SessionHandle { input_tx }, snapshot_rx))
}
