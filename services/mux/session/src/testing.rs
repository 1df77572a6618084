//! Loopback fixtures for endpoint and dialog tests.

use crate::config::EndpointConfig;
use crate::dialog::DialogContext;
use crate::endpoint::EndpointHandler;
use crate::error::{ConnectionError, DialogException};
use crate::executor::{ConnectionExecutor, ManualExecutor};
use crate::handler::{DialogHandler, DialogHandlerFactories, DialogHandlerFactory, HandlerResult};
use crate::manager::EndpointListener;
use crate::message::MessageOutput;
use crate::permits::PermitPool;
use crate::transport::LoopbackTransport;
use bytes::Bytes;
use mux_wire::ProtocolMessage;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Event {
    Start { aborted: bool },
    CanRead { finished: bool },
    CanWrite,
    Abort(DialogException),
}

/// Handler that records every callback
#[derive(Default)]
pub(crate) struct Recorder {
    pub events: Mutex<Vec<Event>>,
    pub received: Mutex<Vec<Bytes>>,
    pub ctx: Mutex<Option<Arc<DialogContext>>>,
    pub echo: bool,
    pub fail_on_read: bool,
    pub cancel_in_abort: bool,
    pub reply_on_start: Option<&'static [u8]>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn received_bytes(&self) -> Vec<u8> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .flat_map(|b| b.iter().copied())
            .collect()
    }

    pub fn abort(&self) -> Option<DialogException> {
        self.events().into_iter().find_map(|e| match e {
            Event::Abort(ex) => Some(ex),
            _ => None,
        })
    }

    pub fn can_read_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::CanRead { .. }))
            .count()
    }

    pub fn ctx(&self) -> Arc<DialogContext> {
        self.ctx.lock().unwrap().clone().expect("dialog not started")
    }
}

impl DialogHandler for Recorder {
    fn on_start(&self, ctx: &Arc<DialogContext>, aborted: bool) -> HandlerResult {
        self.events.lock().unwrap().push(Event::Start { aborted });
        *self.ctx.lock().unwrap() = Some(ctx.clone());
        match self.reply_on_start {
            Some(reply) if !aborted => {
                ctx.write(MessageOutput::from(reply), true)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn on_can_write(&self, _ctx: &Arc<DialogContext>) -> HandlerResult {
        self.events.lock().unwrap().push(Event::CanWrite);
        Ok(())
    }

    fn on_can_read(&self, ctx: &Arc<DialogContext>, finished: bool) -> HandlerResult {
        self.events.lock().unwrap().push(Event::CanRead { finished });
        if self.fail_on_read {
            anyhow::bail!("refusing input");
        }
        while let Some(message) = ctx.read() {
            self.received.lock().unwrap().push(message.into_bytes());
        }
        if finished && self.echo {
            let reply = Bytes::from(self.received_bytes());
            ctx.write(MessageOutput::from(reply), true)?;
        }
        Ok(())
    }

    fn on_abort(&self, ctx: &Arc<DialogContext>, cause: &DialogException) {
        self.events.lock().unwrap().push(Event::Abort(cause.clone()));
        if self.cancel_in_abort {
            ctx.cancel("cancel from on_abort");
        }
    }
}

/// Factory keeping every recorder it creates
pub(crate) struct RecordingFactory {
    template: fn() -> Recorder,
    pub created: Mutex<Vec<Arc<Recorder>>>,
}

impl RecordingFactory {
    pub fn new(template: fn() -> Recorder) -> Arc<Self> {
        Arc::new(Self {
            template,
            created: Mutex::new(Vec::new()),
        })
    }

    pub fn plain() -> Arc<Self> {
        Self::new(Recorder::default)
    }

    pub fn echo() -> Arc<Self> {
        Self::new(|| Recorder {
            echo: true,
            ..Default::default()
        })
    }

    /// Recorders that send a final "ok" as soon as they start
    pub fn replying() -> Arc<Self> {
        Self::new(|| Recorder {
            reply_on_start: Some(&b"ok"[..]),
            ..Default::default()
        })
    }

    pub fn created(&self) -> Vec<Arc<Recorder>> {
        self.created.lock().unwrap().clone()
    }

    pub fn get(&self, i: usize) -> Arc<Recorder> {
        self.created()[i].clone()
    }
}

impl DialogHandlerFactory for RecordingFactory {
    fn create(&self) -> Arc<dyn DialogHandler> {
        let recorder = Arc::new((self.template)());
        self.created.lock().unwrap().push(recorder.clone());
        recorder
    }
}

/// Records terminations
#[derive(Default)]
pub(crate) struct CountingListener {
    pub terminated: Mutex<Vec<(u64, ConnectionError)>>,
}

impl CountingListener {
    pub fn count(&self) -> usize {
        self.terminated.lock().unwrap().len()
    }
}

impl EndpointListener for CountingListener {
    fn on_endpoint_terminated(&self, handler_id: u64, error: &ConnectionError) {
        self.terminated
            .lock()
            .unwrap()
            .push((handler_id, error.clone()));
    }
}

pub(crate) struct PairBuilder {
    pub client_config: EndpointConfig,
    pub server_config: EndpointConfig,
    pub client_factories: DialogHandlerFactories,
    pub server_factories: DialogHandlerFactories,
    pub server_pool: Option<Arc<PermitPool>>,
    pub listener: Option<Arc<dyn EndpointListener>>,
    pub connect: bool,
}

impl Default for PairBuilder {
    fn default() -> Self {
        Self {
            client_config: EndpointConfig::default(),
            server_config: EndpointConfig::default(),
            client_factories: DialogHandlerFactories::new(),
            server_factories: DialogHandlerFactories::new(),
            server_pool: None,
            listener: None,
            connect: true,
        }
    }
}

impl PairBuilder {
    pub fn serve(mut self, type_no: i32, factory: Arc<RecordingFactory>) -> Self {
        self.server_factories.register(type_no, factory);
        self
    }

    pub fn build(self) -> Pair {
        let exec = ManualExecutor::new();
        let executor: Arc<dyn ConnectionExecutor> = exec.clone();
        let counting = Arc::new(CountingListener::default());
        let listener: Arc<dyn EndpointListener> = match self.listener {
            Some(listener) => listener,
            None => counting.clone(),
        };

        let client_transport = LoopbackTransport::new();
        let server_transport = LoopbackTransport::new();

        let client = EndpointHandler::builder(self.client_config, executor.clone(), client_transport.clone())
            .creator(true)
            .factories(self.client_factories)
            .listener(listener.clone())
            .build();
        let mut server = EndpointHandler::builder(self.server_config, executor, server_transport.clone())
            .factories(self.server_factories)
            .listener(listener);
        if let Some(pool) = self.server_pool {
            server = server.permit_pool(pool);
        }
        let server = server.build();

        client_transport.attach(&client, &server);
        server_transport.attach(&server, &client);
        client.start();
        server.start();

        if self.connect {
            client.on_channel_ready();
            server.on_channel_ready();
            exec.run_pending();
        }

        Pair {
            exec,
            client,
            server,
            client_transport,
            server_transport,
            terminations: counting,
        }
    }
}

pub(crate) struct Pair {
    pub exec: Arc<ManualExecutor>,
    pub client: Arc<EndpointHandler>,
    pub server: Arc<EndpointHandler>,
    pub client_transport: Arc<LoopbackTransport>,
    pub server_transport: Arc<LoopbackTransport>,
    pub terminations: Arc<CountingListener>,
}

impl Pair {
    pub fn builder() -> PairBuilder {
        PairBuilder::default()
    }

    pub fn run(&self) {
        self.exec.run_pending();
    }

    pub fn advance(&self, millis: u64) {
        self.exec.advance(Duration::from_millis(millis));
    }

    /// Start a client dialog with a fresh recorder
    pub fn client_dialog(&self, type_no: i32) -> (Arc<DialogContext>, Arc<Recorder>) {
        self.client_dialog_with(type_no, Recorder::new(), Duration::from_secs(10))
    }

    pub fn client_dialog_with(
        &self,
        type_no: i32,
        recorder: Arc<Recorder>,
        timeout: Duration,
    ) -> (Arc<DialogContext>, Arc<Recorder>) {
        let ctx = self
            .client
            .start_dialog(type_no, recorder.clone(), timeout)
            .expect("start dialog");
        (ctx, recorder)
    }

    /// Feed raw protocol messages to the server as if the client sent them
    pub fn inject_into_server(&self, message: &ProtocolMessage) {
        self.server.on_channel_input_read(message.to_bytes());
        self.run();
    }
}

pub(crate) fn out(bytes: &'static [u8]) -> MessageOutput {
    MessageOutput::from(bytes)
}
