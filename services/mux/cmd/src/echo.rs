//! Echo dialog service and the client that drives it.

use bytes::{Bytes, BytesMut};
use mux_session::{
    DialogContext, DialogException, DialogHandler, DialogHandlerFactories, EndpointHandler,
    HandlerResult, MessageOutput,
};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Dialog type of the echo service
pub const ECHO_DIALOG_TYPE: i32 = 1;

/// Factories served by this node
pub fn factories() -> DialogHandlerFactories {
    DialogHandlerFactories::new().with(ECHO_DIALOG_TYPE, || -> Arc<dyn DialogHandler> {
        Arc::new(EchoHandler::default())
    })
}

/// Sends every received byte back once the peer finishes
#[derive(Default)]
pub struct EchoHandler {
    received: Mutex<BytesMut>,
}

impl DialogHandler for EchoHandler {
    fn on_start(&self, ctx: &Arc<DialogContext>, _aborted: bool) -> HandlerResult {
        debug!("Echo dialog {} started", ctx.dialog_id());
        Ok(())
    }

    fn on_can_read(&self, ctx: &Arc<DialogContext>, finished: bool) -> HandlerResult {
        let mut received = self.received.lock().unwrap_or_else(|e| e.into_inner());
        while let Some(message) = ctx.read() {
            received.extend_from_slice(&message.into_bytes());
        }
        if finished {
            let reply = received.split().freeze();
            drop(received);
            ctx.write(MessageOutput::from(reply), true)?;
        }
        Ok(())
    }

    fn on_abort(&self, ctx: &Arc<DialogContext>, cause: &DialogException) {
        debug!("Echo dialog {} aborted: {}", ctx.dialog_id(), cause);
    }
}

type Outcome = Result<(), String>;

/// Writes one payload and checks the echo
struct EchoClient {
    payload: Bytes,
    received: Mutex<BytesMut>,
    done: Mutex<Option<mpsc::UnboundedSender<Outcome>>>,
}

impl EchoClient {
    fn new(payload: Bytes, done: mpsc::UnboundedSender<Outcome>) -> Self {
        Self {
            payload,
            received: Mutex::new(BytesMut::new()),
            done: Mutex::new(Some(done)),
        }
    }

    fn complete(&self, outcome: Outcome) {
        let sender = self.done.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(sender) = sender {
            let _ = sender.send(outcome);
        }
    }
}

impl DialogHandler for EchoClient {
    fn on_start(&self, ctx: &Arc<DialogContext>, aborted: bool) -> HandlerResult {
        if !aborted {
            ctx.write(MessageOutput::from(self.payload.clone()), true)?;
        }
        Ok(())
    }

    fn on_can_read(&self, ctx: &Arc<DialogContext>, finished: bool) -> HandlerResult {
        let mut received = self.received.lock().unwrap_or_else(|e| e.into_inner());
        while let Some(message) = ctx.read() {
            received.extend_from_slice(&message.into_bytes());
        }
        if finished {
            let outcome = if received[..] == self.payload[..] {
                Ok(())
            } else {
                Err(format!(
                    "echo mismatch: sent {} bytes, got {}",
                    self.payload.len(),
                    received.len()
                ))
            };
            drop(received);
            self.complete(outcome);
        }
        Ok(())
    }

    fn on_abort(&self, _ctx: &Arc<DialogContext>, cause: &DialogException) {
        self.complete(Err(cause.to_string()));
    }
}

/// Result of [`drive`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EchoSummary {
    pub succeeded: usize,
    pub failed: usize,
}

/// Run `count` concurrent echo dialogs of `payload_size` bytes on `endpoint`
pub async fn drive(
    endpoint: Arc<EndpointHandler>,
    count: usize,
    payload_size: usize,
    timeout: Duration,
) -> EchoSummary {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let started = Instant::now();

    for i in 0..count {
        let payload = Bytes::from(vec![(i % 251) as u8; payload_size]);
        let handler = Arc::new(EchoClient::new(payload, tx.clone()));
        if let Err(err) = endpoint.start_dialog(ECHO_DIALOG_TYPE, handler, timeout) {
            let _ = tx.send(Err(err.to_string()));
        }
    }
    drop(tx);

    let mut summary = EchoSummary::default();
    while let Some(outcome) = rx.recv().await {
        match outcome {
            Ok(()) => summary.succeeded += 1,
            Err(err) => {
                debug!("Echo dialog failed: {}", err);
                summary.failed += 1;
            }
        }
    }

    if summary.failed > 0 {
        warn!(
            "Echo run finished in {:?}: {} ok, {} failed",
            started.elapsed(),
            summary.succeeded,
            summary.failed
        );
    } else {
        info!(
            "Echo run finished in {:?}: {} dialogs of {} bytes",
            started.elapsed(),
            summary.succeeded,
            payload_size
        );
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use mux_session::{EndpointConfig, LoopbackTransport, TokioExecutor};

    fn pair() -> (Arc<EndpointHandler>, Arc<EndpointHandler>) {
        let client_transport = LoopbackTransport::new();
        let server_transport = LoopbackTransport::new();
        let client = EndpointHandler::builder(
            EndpointConfig::default(),
            TokioExecutor::new(),
            client_transport.clone(),
        )
        .creator(true)
        .build();
        let server = EndpointHandler::builder(
            EndpointConfig::default(),
            TokioExecutor::new(),
            server_transport.clone(),
        )
        .factories(factories())
        .build();
        client_transport.attach(&client, &server);
        server_transport.attach(&server, &client);
        for endpoint in [&client, &server] {
            endpoint.start();
            endpoint.on_channel_ready();
        }
        (client, server)
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let (client, server) = pair();

        let summary = drive(client.clone(), 16, 100_000, Duration::from_secs(5)).await;

        assert_eq!(summary, EchoSummary { succeeded: 16, failed: 0 });
        assert_eq!(server.stats().dialogs_started_remote, 16);
        client.shutdown(false);
        server.await_terminated().await;
    }

    #[tokio::test]
    async fn test_unknown_peer_service_fails() {
        let (client, server) = pair();
        let summary = drive(server.clone(), 2, 10, Duration::from_secs(5)).await;

        assert_eq!(summary, EchoSummary { succeeded: 0, failed: 2 });
        client.shutdown(true);
    }
}
