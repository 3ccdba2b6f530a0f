//! Tokio runtime wrapper
//!
//! [`EngineRuntime::spawn`] moves an [`Engine`] onto its own task together
//! with a [`Transport`]. The engine state is only ever touched from that
//! task: the application sends it `FnOnce(&mut Engine)` commands through
//! the single [`EngineHandle`] and reads [`EngineEvent`]s from a channel.

use super::engine::Engine;
use crate::config::EngineConfig;
use crate::domain::shared::{EngineError, OperationId, Result};
use crate::infrastructure::protocols::sip::call::ResponseOptions;
use crate::infrastructure::protocols::sip::events::{EngineEvent, PendingResponse};
use crate::infrastructure::protocols::sip::offer_answer::OfferAnswer;
use crate::infrastructure::protocols::sip::transport::{Outgoing, OutgoingMessage, Transport, TransportEvent};
use std::net::SocketAddr;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

type Command = Box<dyn FnOnce(&mut Engine) + Send>;

/// Application side of a running engine.
///
/// Not `Clone`: there is exactly one producer of commands. Dropping it
/// stops the engine task.
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<Command>,
    local_addr: SocketAddr,
}

impl EngineHandle {
    /// Address the transport is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run `f` on the engine task and return its result
    pub async fn execute<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Engine) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let command: Command = Box::new(move |engine| {
            // The caller may have given up waiting
            let _ = tx.send(f(engine));
        });
        self.commands
            .send(command)
            .map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)
    }

    /// Answer a request delivered with an indication
    pub async fn respond(&self, token: PendingResponse, options: ResponseOptions) -> Result<OperationId> {
        self.execute(move |engine| engine.respond(token, options)).await?
    }

    /// Stop the engine task
    pub fn shutdown(self) {
        info!("Engine shutdown requested");
    }
}

pub struct EngineRuntime;

impl EngineRuntime {
    /// Start `transport`, build the engine and run it on a new task
    pub async fn spawn<T>(
        mut config: EngineConfig,
        offer_answer: Box<dyn OfferAnswer>,
        mut transport: T,
    ) -> Result<(EngineHandle, mpsc::UnboundedReceiver<EngineEvent>, JoinHandle<()>)>
    where
        T: Transport + 'static,
    {
        let local_addr = transport
            .start()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;
        if config.local.port == 0 {
            config.local.port = local_addr.port();
        }
        let incoming = transport
            .take_receiver()
            .ok_or_else(|| EngineError::Transport("Transport receiver already taken".to_string()))?;

        let engine = Engine::new(config, offer_answer, Instant::now().into_std())?;
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(run(engine, transport, incoming, command_rx, event_tx));
        info!("Engine running on {}", local_addr);

        Ok((
            EngineHandle {
                commands: command_tx,
                local_addr,
            },
            event_rx,
            task,
        ))
    }
}

async fn run<T: Transport>(
    mut engine: Engine,
    mut transport: T,
    mut incoming: mpsc::Receiver<TransportEvent>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<EngineEvent>,
) {
    loop {
        let deadline = engine.next_timeout().map(Instant::from_std);
        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => command(&mut engine),
                None => break,
            },
            event = incoming.recv() => match event {
                Some(event) => engine.on_transport_event(event),
                None => {
                    error!("Transport closed its event channel");
                    break;
                }
            },
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                engine.advance(Instant::now().into_std());
            }
        }
        flush(&mut engine, &transport, &events).await;
    }

    if let Err(e) = transport.stop().await {
        warn!("Failed to stop transport: {}", e);
    }
    info!("Engine stopped");
}

async fn flush<T: Transport>(engine: &mut Engine, transport: &T, events: &mpsc::UnboundedSender<EngineEvent>) {
    while let Some(outgoing) = engine.poll_outgoing() {
        match outgoing {
            Outgoing::Message {
                message,
                destination,
            } => {
                let data = message.to_bytes();
                let sent = transport
                    .send(OutgoingMessage {
                        data,
                        destination: destination.clone(),
                    })
                    .await;
                if let Err(e) = sent {
                    warn!("Send to {} failed: {}", destination, e);
                    engine.on_send_failure(&destination);
                }
            }
            Outgoing::ResetConnection { destination } => {
                if let Err(e) = transport.reset(&destination).await {
                    warn!("Reset of {} failed: {}", destination, e);
                }
            }
        }
    }
    while let Some(event) = engine.poll_event() {
        if events.send(event).is_err() {
            debug!("No event receiver; dropping event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::call::CallOptions;
    use crate::infrastructure::protocols::sip::message::{SipError, SipMessage, SipMethod};
    use crate::infrastructure::protocols::sip::offer_answer::StaticOfferAnswer;
    use crate::infrastructure::protocols::sip::transport::Destination;

    /// Transport that hands every sent message to the test
    struct MemoryTransport {
        sent: mpsc::UnboundedSender<OutgoingMessage>,
        rx: Option<mpsc::Receiver<TransportEvent>>,
    }

    impl MemoryTransport {
        fn new() -> (Self, mpsc::UnboundedReceiver<OutgoingMessage>, mpsc::Sender<TransportEvent>) {
            let (sent, sent_rx) = mpsc::unbounded_channel();
            let (tx, rx) = mpsc::channel(16);
            (
                Self { sent, rx: Some(rx) },
                sent_rx,
                tx,
            )
        }
    }

    #[async_trait::async_trait]
    impl Transport for MemoryTransport {
        async fn start(&mut self) -> std::result::Result<SocketAddr, SipError> {
            Ok("127.0.0.1:5070".parse().unwrap())
        }

        async fn stop(&mut self) -> std::result::Result<(), SipError> {
            Ok(())
        }

        async fn send(&self, message: OutgoingMessage) -> std::result::Result<(), SipError> {
            self.sent
                .send(message)
                .map_err(|e| SipError::TransportError(e.to_string()))
        }

        async fn reset(&self, _destination: &Destination) -> std::result::Result<(), SipError> {
            Ok(())
        }

        fn take_receiver(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
            self.rx.take()
        }
    }

    #[tokio::test]
    async fn test_command_runs_on_engine_task() {
        let (transport, mut sent, _peer) = MemoryTransport::new();
        let (handle, _events, _task) = EngineRuntime::spawn(
            EngineConfig::default(),
            Box::new(StaticOfferAnswer::default()),
            transport,
        )
        .await
        .unwrap();
        assert_eq!(handle.local_addr().port(), 5070);

        let call = handle
            .execute(|engine| engine.create_call(CallOptions::new("sip:bob@127.0.0.1:5080")))
            .await
            .unwrap();
        let started = handle.execute(move |engine| engine.start_call(call)).await.unwrap();
        tokio_test::assert_ok!(started);

        let message = sent.recv().await.unwrap();
        let parsed = SipMessage::parse(&message.data).unwrap();
        match parsed {
            SipMessage::Request(request) => assert_eq!(request.method, SipMethod::Invite),
            other => panic!("expected INVITE, got {:?}", other),
        }
        assert_eq!(message.destination.port, 5080);
    }

    #[tokio::test]
    async fn test_dropping_handle_stops_engine() {
        let (transport, _sent, _peer) = MemoryTransport::new();
        let (handle, _events, task) = EngineRuntime::spawn(
            EngineConfig::default(),
            Box::new(StaticOfferAnswer::default()),
            transport,
        )
        .await
        .unwrap();
        handle.shutdown();
        tokio_test::assert_ok!(task.await);
    }
}
