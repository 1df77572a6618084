//! Per-connection endpoint handler.
//!
//! The handler drives the handshake, decodes inbound traffic, admits and
//! tracks dialogs, flushes their frames in batches and tears everything down
//! on termination. Protocol work runs as jobs on the connection executor;
//! the public entry points may be called from any thread.

use crate::config::EndpointConfig;
use crate::dialog::{AbortInfo, DialogContext};
use crate::error::{ConnectionError, StartDialogError};
use crate::executor::ConnectionExecutor;
use crate::handler::{DialogHandler, DialogHandlerFactories};
use crate::handshake::{self, NegotiatedLimits};
use crate::keepalive;
use crate::lock;
use crate::manager::EndpointListener;
use crate::permits::{PermitHandle, PermitListener, PermitPool, UnlimitedPermits};
use crate::state::{EndpointState, Transition};
use crate::task::ScheduledTask;
use crate::transport::Transport;
use bytes::{Bytes, BytesMut};
use mux_wire::{
    ConnectionLimits, DialogAbortCause, MessageDecoder, OutputStaging, ProtocolMessage,
    PROTOCOL_VERSION,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, TryLockError, Weak};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, trace, warn};

/// Source of endpoint handler IDs
pub trait IdGenerator: Send + Sync {
    /// Next non-zero 63-bit ID
    fn next_id(&self) -> u64;
}

/// Random IDs from the thread-local RNG
#[derive(Debug, Default)]
pub struct RandomIdGenerator;

impl IdGenerator for RandomIdGenerator {
    fn next_id(&self) -> u64 {
        loop {
            let id = rand::random::<u64>() >> 1;
            if id != 0 {
                return id;
            }
        }
    }
}

/// Counters snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointStats {
    /// Protocol messages decoded
    pub messages_received: u64,
    /// Protocol messages staged for sending
    pub messages_sent: u64,
    /// Dialogs started by this side
    pub dialogs_started_local: u64,
    /// Dialogs started by the peer and admitted
    pub dialogs_started_remote: u64,
    /// Dialogs that completed both directions
    pub dialogs_finished: u64,
    /// Dialogs that aborted
    pub dialogs_aborted: u64,
    /// Dialogs currently tracked
    pub active_dialogs: usize,
    /// Most recent heartbeat round trip
    pub last_rtt: Option<Duration>,
}

#[derive(Debug, Default)]
struct StatsCounters {
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
    dialogs_started_local: AtomicU64,
    dialogs_started_remote: AtomicU64,
    dialogs_finished: AtomicU64,
    dialogs_aborted: AtomicU64,
    last_rtt_nanos: AtomicU64,
}

#[derive(Debug)]
struct Lifecycle {
    state: EndpointState,
    error: Option<ConnectionError>,
}

// Every dialog context sits in exactly one collection until it is done.
#[derive(Default)]
struct DialogTable {
    by_id: HashMap<i64, Arc<DialogContext>>,
    pending_id: VecDeque<Arc<DialogContext>>,
    pending_handshake: Vec<Arc<DialogContext>>,
    last_local_id: i64,
    last_remote_id: i64,
}

impl DialogTable {
    fn is_empty(&self) -> bool {
        self.by_id.is_empty() && self.pending_id.is_empty() && self.pending_handshake.is_empty()
    }

    fn len(&self) -> usize {
        self.by_id.len() + self.pending_id.len() + self.pending_handshake.len()
    }

    fn remove(&mut self, ctx: &Arc<DialogContext>) {
        let id = ctx.dialog_id();
        if id != 0 {
            if let Some(found) = self.by_id.get(&id) {
                if Arc::ptr_eq(found, ctx) {
                    self.by_id.remove(&id);
                }
            }
        }
        self.pending_id.retain(|c| !Arc::ptr_eq(c, ctx));
        self.pending_handshake.retain(|c| !Arc::ptr_eq(c, ctx));
    }

    fn drain(&mut self) -> Vec<Arc<DialogContext>> {
        let mut all: Vec<_> = self.by_id.drain().map(|(_, c)| c).collect();
        all.extend(self.pending_id.drain(..));
        all.append(&mut self.pending_handshake);
        all
    }
}

#[derive(Default)]
struct WritePending {
    queue: VecDeque<Arc<DialogContext>>,
    members: HashSet<u64>,
}

/// Builder for [`EndpointHandler`]
pub struct EndpointBuilder {
    config: EndpointConfig,
    executor: Arc<dyn ConnectionExecutor>,
    transport: Arc<dyn Transport>,
    is_creator: bool,
    permits: Option<Arc<dyn PermitHandle>>,
    pool: Option<Arc<PermitPool>>,
    factories: DialogHandlerFactories,
    listener: Option<Arc<dyn EndpointListener>>,
    id_generator: Arc<dyn IdGenerator>,
}

impl EndpointBuilder {
    /// Whether this side opened the connection
    pub fn creator(mut self, is_creator: bool) -> Self {
        self.is_creator = is_creator;
        self
    }

    /// Use a fixed permit handle for inbound dialogs
    pub fn permits(mut self, permits: Arc<dyn PermitHandle>) -> Self {
        self.permits = Some(permits);
        self
    }

    /// Register with a shared permit pool
    pub fn permit_pool(mut self, pool: Arc<PermitPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Handler factories for remotely started dialogs
    pub fn factories(mut self, factories: DialogHandlerFactories) -> Self {
        self.factories = factories;
        self
    }

    /// Parent notified on termination
    pub fn listener(mut self, listener: Arc<dyn EndpointListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Source of the handler ID
    pub fn id_generator(mut self, id_generator: Arc<dyn IdGenerator>) -> Self {
        self.id_generator = id_generator;
        self
    }

    /// Create the handler in NEED_EXECUTOR state
    pub fn build(self) -> Arc<EndpointHandler> {
        let handler_id = self.id_generator.next_id();
        let (terminated, _) = watch::channel(false);
        Arc::new_cyclic(|weak: &Weak<EndpointHandler>| {
            let permits: Arc<dyn PermitHandle> = match (self.permits, &self.pool) {
                (Some(permits), _) => permits,
                (None, Some(pool)) => {
                    let listener: Weak<dyn PermitListener> = weak.clone();
                    let handle: Arc<dyn PermitHandle> = pool.register(handler_id, listener);
                    handle
                }
                (None, None) => {
                    let unlimited: Arc<dyn PermitHandle> = Arc::new(UnlimitedPermits);
                    unlimited
                }
            };
            EndpointHandler {
                handler_id,
                is_creator: self.is_creator,
                decoder: MessageDecoder::new(self.config.max_length),
                config: self.config,
                executor: self.executor,
                transport: self.transport,
                permits,
                factories: self.factories,
                listener: self.listener,
                self_ref: weak.clone(),
                lifecycle: Mutex::new(Lifecycle {
                    state: EndpointState::NeedExecutor,
                    error: None,
                }),
                connection_id: AtomicU64::new(0),
                version: AtomicU64::new(PROTOCOL_VERSION),
                negotiated: OnceLock::new(),
                table: Mutex::new(DialogTable::default()),
                write_pending: Mutex::new(WritePending::default()),
                flush_scheduled: AtomicBool::new(false),
                flush_lock: Mutex::new(()),
                flush_again: AtomicBool::new(false),
                write_blocked: AtomicBool::new(false),
                output: OutputStaging::new(),
                input: Mutex::new(BytesMut::new()),
                read_paused: AtomicBool::new(false),
                reserved_permits: AtomicU32::new(0),
                local_slots: Semaphore::new(0),
                remote_active: AtomicU32::new(0),
                connect_timer: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                no_dialog_active: AtomicBool::new(true),
                last_read_at: AtomicU64::new(0),
                stats: StatsCounters::default(),
                terminated,
            }
        })
    }
}

/// State machine for one connection
pub struct EndpointHandler {
    handler_id: u64,
    is_creator: bool,
    config: EndpointConfig,
    executor: Arc<dyn ConnectionExecutor>,
    transport: Arc<dyn Transport>,
    permits: Arc<dyn PermitHandle>,
    factories: DialogHandlerFactories,
    listener: Option<Arc<dyn EndpointListener>>,
    self_ref: Weak<EndpointHandler>,
    lifecycle: Mutex<Lifecycle>,
    connection_id: AtomicU64,
    version: AtomicU64,
    negotiated: OnceLock<NegotiatedLimits>,
    table: Mutex<DialogTable>,
    write_pending: Mutex<WritePending>,
    flush_scheduled: AtomicBool,
    flush_lock: Mutex<()>,
    flush_again: AtomicBool,
    // transport refused output; dialog frames wait for on_channel_writable
    write_blocked: AtomicBool,
    output: OutputStaging,
    input: Mutex<BytesMut>,
    decoder: MessageDecoder,
    read_paused: AtomicBool,
    reserved_permits: AtomicU32,
    local_slots: Semaphore,
    remote_active: AtomicU32,
    connect_timer: Mutex<Option<ScheduledTask>>,
    tasks: Mutex<Vec<ScheduledTask>>,
    no_dialog_active: AtomicBool,
    last_read_at: AtomicU64,
    stats: StatsCounters,
    terminated: watch::Sender<bool>,
}

impl EndpointHandler {
    /// Start building a handler
    pub fn builder(
        config: EndpointConfig,
        executor: Arc<dyn ConnectionExecutor>,
        transport: Arc<dyn Transport>,
    ) -> EndpointBuilder {
        EndpointBuilder {
            config,
            executor,
            transport,
            is_creator: false,
            permits: None,
            pool: None,
            factories: DialogHandlerFactories::default(),
            listener: None,
            id_generator: Arc::new(RandomIdGenerator),
        }
    }

    /// Random handler ID
    pub fn handler_id(&self) -> u64 {
        self.handler_id
    }

    /// Connection ID agreed in the handshake; zero before
    pub fn connection_id(&self) -> u64 {
        self.connection_id.load(Ordering::Acquire)
    }

    /// Whether this side opened the connection
    pub fn is_creator(&self) -> bool {
        self.is_creator
    }

    /// Current lifecycle state
    pub fn state(&self) -> EndpointState {
        lock(&self.lifecycle).state
    }

    /// Error that terminated the endpoint
    pub fn termination_error(&self) -> Option<ConnectionError> {
        lock(&self.lifecycle).error.clone()
    }

    /// Limits agreed in the handshake
    pub fn negotiated(&self) -> Option<NegotiatedLimits> {
        self.negotiated.get().copied()
    }

    /// Local configuration
    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// Connection executor
    pub fn executor(&self) -> &Arc<dyn ConnectionExecutor> {
        &self.executor
    }

    /// Counters snapshot
    pub fn stats(&self) -> EndpointStats {
        let rtt = self.stats.last_rtt_nanos.load(Ordering::Relaxed);
        EndpointStats {
            messages_received: self.stats.messages_received.load(Ordering::Relaxed),
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            dialogs_started_local: self.stats.dialogs_started_local.load(Ordering::Relaxed),
            dialogs_started_remote: self.stats.dialogs_started_remote.load(Ordering::Relaxed),
            dialogs_finished: self.stats.dialogs_finished.load(Ordering::Relaxed),
            dialogs_aborted: self.stats.dialogs_aborted.load(Ordering::Relaxed),
            active_dialogs: lock(&self.table).len(),
            last_rtt: (rtt > 0).then(|| Duration::from_nanos(rtt)),
        }
    }

    /// Dialogs currently tracked in any collection
    pub fn active_dialogs(&self) -> usize {
        lock(&self.table).len()
    }

    /// Permits reserved ahead for the next inbound dialog
    pub fn reserved_permits(&self) -> u32 {
        self.reserved_permits.load(Ordering::Acquire)
    }

    /// Whether reading is paused waiting for permits
    pub fn is_read_paused(&self) -> bool {
        self.read_paused.load(Ordering::Acquire)
    }

    /// Wait until the endpoint reaches TERMINATED
    pub async fn await_terminated(&self) {
        let mut rx = self.terminated.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    fn advance(self: &Arc<Self>, expected: EndpointState, next: EndpointState) -> bool {
        let (outcome, current) = {
            let mut lifecycle = lock(&self.lifecycle);
            let current = lifecycle.state;
            let outcome = current.transition(expected, next);
            if outcome == Transition::Applied {
                lifecycle.state = next;
            }
            (outcome, current)
        };
        match outcome {
            Transition::Applied => {
                debug!("Endpoint {:016x}: {} -> {}", self.handler_id, current, next);
                true
            }
            Transition::Ignored => false,
            Transition::Illegal => {
                error!(
                    "Endpoint {:016x}: illegal transition {} -> {} while in {}",
                    self.handler_id, expected, next, current
                );
                self.terminate(ConnectionError::Unknown {
                    from_remote: false,
                    detail: format!("illegal state transition {} -> {} in {}", expected, next, current),
                });
                false
            }
        }
    }

    fn run<F>(&self, f: F)
    where
        F: FnOnce(Arc<EndpointHandler>) + Send + 'static,
    {
        let weak = self.self_ref.clone();
        self.executor.execute(Box::new(move || {
            if let Some(handler) = weak.upgrade() {
                f(handler)
            }
        }));
    }

    /// Bind to the executor and arm the connect timeout
    pub fn start(self: &Arc<Self>) {
        if self.state() != EndpointState::NeedExecutor
            || !self.advance(EndpointState::NeedExecutor, EndpointState::Connecting)
        {
            return;
        }
        let weak = self.self_ref.clone();
        let timeout = self.config.connect_timeout;
        let task = ScheduledTask::once(&self.executor, timeout, move || {
            if let Some(handler) = weak.upgrade() {
                if handler.state() < EndpointState::Normal {
                    handler.terminate(ConnectionError::Timeout {
                        from_remote: false,
                        detail: format!("handshake not completed within {:?}", timeout),
                    });
                }
            }
        });
        *lock(&self.connect_timer) = Some(task);
    }

    /// Transport is connected
    pub fn on_channel_ready(self: &Arc<Self>) {
        self.run(|handler| handler.channel_ready());
    }

    /// Bytes arrived from the transport
    pub fn on_channel_input_read(self: &Arc<Self>, data: Bytes) {
        if self.state().is_terminating() {
            return;
        }
        lock(&self.input).extend_from_slice(&data);
        self.run(|handler| handler.process_input());
    }

    /// Transport can take more output
    pub fn on_channel_writable(self: &Arc<Self>) {
        self.write_blocked.store(false, Ordering::Release);
        self.transport.set_write_interest(false);
        self.schedule_flush();
    }

    /// Transport failed
    pub fn on_channel_error(self: &Arc<Self>, err: io::Error) {
        self.run(move |handler| {
            let phase = handler.state();
            if !phase.is_terminating() {
                debug!("Endpoint {:016x} transport error: {}", handler.handler_id, err);
                handler.terminate(ConnectionError::io(phase, &err));
            }
        });
    }

    fn channel_ready(self: &Arc<Self>) {
        if self.state() == EndpointState::NeedExecutor {
            self.start();
        }
        if self.state() != EndpointState::Connecting
            || !self.advance(EndpointState::Connecting, EndpointState::HandshakingStep1)
        {
            return;
        }
        if self.is_creator {
            self.stage(&ProtocolMessage::ProtocolVersion {
                version: PROTOCOL_VERSION,
            });
            self.schedule_flush();
        }
        self.process_input();
    }

    /// Start a dialog of `type_no` handled by `handler`
    pub fn start_dialog(
        self: &Arc<Self>,
        type_no: i32,
        handler: Arc<dyn DialogHandler>,
        timeout: Duration,
    ) -> Result<Arc<DialogContext>, StartDialogError> {
        if timeout.is_zero() {
            return Err(StartDialogError::InvalidTimeout);
        }
        let ctx = DialogContext::new_local(self.clone(), type_no, handler, timeout);
        {
            let mut table = lock(&self.table);
            let lifecycle = lock(&self.lifecycle);
            match lifecycle.state {
                s if s.is_terminating() => {
                    let err = lifecycle
                        .error
                        .clone()
                        .unwrap_or_else(|| ConnectionError::shutdown("endpoint terminated"));
                    return Err(StartDialogError::Terminated(err));
                }
                EndpointState::ShuttingDown => return Err(StartDialogError::ShuttingDown),
                EndpointState::Normal => table.pending_id.push_back(ctx.clone()),
                _ => table.pending_handshake.push(ctx.clone()),
            }
            self.no_dialog_active.store(false, Ordering::Release);
        }
        self.stats.dialogs_started_local.fetch_add(1, Ordering::Relaxed);
        trace!(
            "Endpoint {:016x} started dialog {} of type {}",
            self.handler_id,
            ctx.context_id(),
            type_no
        );
        ctx.arm_timeout();
        ctx.schedule_start();
        Ok(ctx)
    }

    /// Stop accepting dialogs; with `force` terminate right away
    pub fn shutdown(self: &Arc<Self>, force: bool) {
        if force {
            self.terminate(ConnectionError::shutdown("forced shutdown"));
            return;
        }
        let before_normal = {
            let mut lifecycle = lock(&self.lifecycle);
            match lifecycle.state {
                EndpointState::Normal => {
                    lifecycle.state = EndpointState::ShuttingDown;
                    false
                }
                s if s < EndpointState::Normal => true,
                _ => return,
            }
        };
        if before_normal {
            self.terminate(ConnectionError::shutdown("shutdown before handshake completed"));
            return;
        }
        info!("Endpoint {:016x} shutting down", self.handler_id);
        if lock(&self.table).is_empty() {
            self.terminate(ConnectionError::shutdown("shutdown complete"));
        }
    }

    fn process_input(self: &Arc<Self>) {
        loop {
            let state = self.state();
            if state < EndpointState::HandshakingStep1 || state.is_terminating() {
                return;
            }
            if state >= EndpointState::Normal && !self.ensure_read_permit() {
                return;
            }

            let decoded = {
                let mut input = lock(&self.input);
                if input.is_empty() {
                    return;
                }
                let is_creator = self.is_creator;
                self.decoder.decode_filtered(&mut input, |kind| {
                    handshake::accepts(state, is_creator, kind)
                })
            };

            match decoded {
                Ok(None) => return,
                Ok(Some(message)) => {
                    self.last_read_at
                        .store(self.executor.now_millis(), Ordering::Release);
                    self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
                    trace!("Endpoint {:016x} received {:?}", self.handler_id, message.kind());
                    if let Err(err) = self.dispatch(message) {
                        self.terminate(err);
                        return;
                    }
                }
                Err(err) => {
                    warn!("Endpoint {:016x} failed to decode input: {}", self.handler_id, err);
                    self.terminate(ConnectionError::from_wire(state, err));
                    return;
                }
            }
        }
    }

    // One permit is always held before reading, so a DIALOG_START never has
    // to wait after being decoded.
    fn ensure_read_permit(&self) -> bool {
        if self.reserved_permits.load(Ordering::Acquire) > 0 {
            return true;
        }
        if self.read_paused.load(Ordering::Acquire) {
            return false;
        }
        if self.permits.reserve() {
            self.reserved_permits.fetch_add(1, Ordering::AcqRel);
            true
        } else {
            debug!("Endpoint {:016x} out of dialog permits, pausing reads", self.handler_id);
            self.read_paused.store(true, Ordering::Release);
            self.transport.set_read_interest(false);
            false
        }
    }

    fn permits_granted(self: &Arc<Self>, n: u32) {
        if self.state().is_terminating() {
            self.permits.free(n);
            return;
        }
        self.reserved_permits.fetch_add(n, Ordering::AcqRel);
        if self.read_paused.swap(false, Ordering::AcqRel) {
            debug!("Endpoint {:016x} resuming reads", self.handler_id);
            self.last_read_at
                .store(self.executor.now_millis(), Ordering::Release);
            self.transport.set_read_interest(true);
        }
        self.process_input();
    }

    fn dispatch(self: &Arc<Self>, message: ProtocolMessage) -> Result<(), ConnectionError> {
        match message {
            ProtocolMessage::ProtocolVersion { version } => self.on_protocol_version(version),
            ProtocolMessage::ProtocolVersionResponse { version } => {
                self.on_protocol_version_response(version)
            }
            ProtocolMessage::ConnectionConfig {
                connection_id,
                limits,
            } => self.on_connection_config(connection_id, limits),
            ProtocolMessage::ConnectionConfigResponse { limits } => {
                self.on_connection_config_response(limits)
            }
            ProtocolMessage::NoOperation => Ok(()),
            ProtocolMessage::ConnectionAbort { cause, detail } => {
                Err(ConnectionError::from_remote_abort(cause, detail))
            }
            ProtocolMessage::Ping { cookie } => {
                if self.stage(&ProtocolMessage::PingAck { cookie }) {
                    self.schedule_flush();
                }
                Ok(())
            }
            ProtocolMessage::PingAck { cookie } => {
                if let Some(rtt) = keepalive::rtt_from_cookie(cookie) {
                    trace!("Endpoint {:016x} heartbeat RTT {:?}", self.handler_id, rtt);
                    self.stats
                        .last_rtt_nanos
                        .store((rtt.as_nanos() as u64).max(1), Ordering::Relaxed);
                }
                Ok(())
            }
            ProtocolMessage::DialogStart {
                sampled,
                finish,
                cont,
                type_no,
                dialog_id,
                timeout_millis,
                payload,
            } => self.on_dialog_start(
                sampled,
                finish,
                cont,
                type_no,
                dialog_id,
                timeout_millis,
                payload,
            ),
            ProtocolMessage::DialogFrame {
                finish,
                cont,
                dialog_id,
                payload,
            } => match self.lookup(dialog_id)? {
                Some(ctx) => ctx.on_frame(payload, finish, cont),
                None => {
                    trace!("Ignoring frame for finished dialog {}", dialog_id);
                    Ok(())
                }
            },
            ProtocolMessage::DialogAbort {
                cause,
                dialog_id,
                detail,
            } => {
                if let Some(ctx) = self.lookup(dialog_id)? {
                    ctx.abort(AbortInfo::remote(cause, detail));
                }
                Ok(())
            }
        }
    }

    fn on_protocol_version(self: &Arc<Self>, version: u64) -> Result<(), ConnectionError> {
        let version = handshake::negotiate_version(version).map_err(ConnectionError::incompatible)?;
        if !self.advance(EndpointState::HandshakingStep1, EndpointState::HandshakingStep2) {
            return Ok(());
        }
        debug!("Endpoint {:016x} agreed protocol version {}", self.handler_id, version);
        self.store_version(version);
        self.stage(&ProtocolMessage::ProtocolVersionResponse { version });
        self.schedule_flush();
        Ok(())
    }

    fn on_protocol_version_response(self: &Arc<Self>, version: u64) -> Result<(), ConnectionError> {
        let version =
            handshake::check_version_response(version).map_err(ConnectionError::incompatible)?;
        if !self.advance(EndpointState::HandshakingStep1, EndpointState::HandshakingStep2) {
            return Ok(());
        }
        self.store_version(version);
        self.stage(&ProtocolMessage::ConnectionConfig {
            connection_id: self.handler_id,
            limits: self.config.local_limits(),
        });
        self.schedule_flush();
        Ok(())
    }

    fn on_connection_config(
        self: &Arc<Self>,
        connection_id: u64,
        limits: ConnectionLimits,
    ) -> Result<(), ConnectionError> {
        let negotiated = self.negotiate(&limits)?;
        self.connection_id.store(connection_id, Ordering::Release);
        self.stage(&ProtocolMessage::ConnectionConfigResponse {
            limits: self.config.local_limits(),
        });
        self.enter_normal(negotiated);
        Ok(())
    }

    fn on_connection_config_response(
        self: &Arc<Self>,
        limits: ConnectionLimits,
    ) -> Result<(), ConnectionError> {
        let negotiated = self.negotiate(&limits)?;
        self.connection_id.store(self.handler_id, Ordering::Release);
        self.enter_normal(negotiated);
        Ok(())
    }

    fn store_version(&self, version: u64) {
        self.version.store(version, Ordering::Release);
    }

    fn negotiate(&self, remote: &ConnectionLimits) -> Result<NegotiatedLimits, ConnectionError> {
        let version = self.version.load(Ordering::Acquire);
        handshake::negotiate_limits(version, &self.config.local_limits(), remote)
            .map_err(ConnectionError::violation)
    }

    fn enter_normal(self: &Arc<Self>, negotiated: NegotiatedLimits) {
        let _ = self.negotiated.set(negotiated);
        if !self.advance(EndpointState::HandshakingStep2, EndpointState::Normal) {
            return;
        }
        self.local_slots
            .add_permits(negotiated.outbound_max_dialogs as usize);
        if let Some(task) = lock(&self.connect_timer).take() {
            task.cancel();
        }
        self.last_read_at
            .store(self.executor.now_millis(), Ordering::Release);

        let queued = {
            let mut table = lock(&self.table);
            let moved: Vec<_> = table.pending_handshake.drain(..).collect();
            table.pending_id.extend(moved.iter().cloned());
            self.no_dialog_active.store(table.is_empty(), Ordering::Release);
            moved
        };
        for ctx in queued.iter().filter(|c| c.has_outbound()) {
            self.request_write(ctx);
        }

        self.start_timers(&negotiated);
        info!(
            "Endpoint {:016x} connection {:016x} established (version {}, {} outbound dialogs, heartbeat {:?})",
            self.handler_id,
            self.connection_id(),
            negotiated.protocol_version,
            negotiated.outbound_max_dialogs,
            negotiated.heartbeat_interval
        );
        self.schedule_flush();
    }

    fn start_timers(self: &Arc<Self>, negotiated: &NegotiatedLimits) {
        let mut tasks = lock(&self.tasks);
        if self.state().is_terminating() {
            return;
        }
        let interval = negotiated.heartbeat_interval;

        let weak = self.self_ref.clone();
        tasks.push(ScheduledTask::periodic(&self.executor, interval, move || {
            if let Some(handler) = weak.upgrade() {
                handler.check_heartbeat(interval);
            }
        }));

        if self.config.send_heartbeat {
            let weak = self.self_ref.clone();
            tasks.push(ScheduledTask::periodic(&self.executor, interval, move || {
                if let Some(handler) = weak.upgrade() {
                    handler.send_heartbeat();
                }
            }));
        }

        if let Some(idle) = self.config.idle_timeout.filter(|idle| !idle.is_zero()) {
            let weak = self.self_ref.clone();
            tasks.push(ScheduledTask::periodic(&self.executor, idle, move || {
                if let Some(handler) = weak.upgrade() {
                    handler.check_idle(idle);
                }
            }));
        }
    }

    fn check_heartbeat(self: &Arc<Self>, interval: Duration) {
        // input is left unread while waiting for a permit
        if self.state().is_terminating() || self.read_paused.load(Ordering::Acquire) {
            return;
        }
        let now = self.executor.now_millis();
        let silent = now.saturating_sub(self.last_read_at.load(Ordering::Acquire));
        let limit = interval.as_millis() as u64 * u64::from(self.config.heartbeat_timeout.max(1));
        if silent > limit {
            self.terminate(ConnectionError::Timeout {
                from_remote: false,
                detail: format!("nothing received for {}ms", silent),
            });
        }
    }

    fn send_heartbeat(self: &Arc<Self>) {
        let state = self.state();
        if state < EndpointState::Normal || state.is_terminating() {
            return;
        }
        let message = keepalive::heartbeat(self.version.load(Ordering::Acquire));
        if self.stage(&message) {
            self.schedule_flush();
        }
    }

    fn check_idle(self: &Arc<Self>, idle: Duration) {
        let expired = {
            let table = lock(&self.table);
            let empty = table.is_empty();
            let expired = empty && self.no_dialog_active.load(Ordering::Acquire);
            self.no_dialog_active.store(empty, Ordering::Release);
            expired
        };
        if expired {
            self.terminate(ConnectionError::Idle {
                from_remote: false,
                detail: format!("no dialog for {:?}", idle),
            });
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_dialog_start(
        self: &Arc<Self>,
        sampled: bool,
        finish: bool,
        cont: bool,
        type_no: i32,
        dialog_id: i64,
        timeout_millis: u64,
        payload: Bytes,
    ) -> Result<(), ConnectionError> {
        // the permit reserved before decoding now belongs to this dialog
        let _ = self
            .reserved_permits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));

        {
            let mut table = lock(&self.table);
            let expected_negative = self.is_creator;
            if (dialog_id < 0) != expected_negative
                || dialog_id.unsigned_abs() <= table.last_remote_id.unsigned_abs()
            {
                drop(table);
                self.permits.free(1);
                return Err(ConnectionError::violation(format!(
                    "dialog start id {} out of sequence",
                    dialog_id
                )));
            }
            table.last_remote_id = dialog_id;
        }

        if self.state() == EndpointState::ShuttingDown {
            debug!("Refusing dialog {} while shutting down", dialog_id);
            self.refuse(dialog_id, DialogAbortCause::EndpointShuttingDown, "endpoint shutting down".to_string());
            return Ok(());
        }

        if self.remote_active.load(Ordering::Acquire) >= self.config.max_dialogs {
            self.permits.free(1);
            return Err(ConnectionError::violation(format!(
                "peer exceeded {} concurrent dialogs",
                self.config.max_dialogs
            )));
        }

        let Some(factory) = self.factories.get(type_no) else {
            debug!("No handler for dialog type {}", type_no);
            self.refuse(
                dialog_id,
                DialogAbortCause::UnknownType,
                format!("no handler for dialog type {}", type_no),
            );
            return Ok(());
        };

        let ctx = DialogContext::new_remote(
            self.clone(),
            type_no,
            factory.create(),
            dialog_id,
            Duration::from_millis(timeout_millis),
            sampled,
        );
        {
            let mut table = lock(&self.table);
            table.by_id.insert(dialog_id, ctx.clone());
            self.no_dialog_active.store(false, Ordering::Release);
        }
        self.remote_active.fetch_add(1, Ordering::AcqRel);
        self.stats.dialogs_started_remote.fetch_add(1, Ordering::Relaxed);
        trace!(
            "Endpoint {:016x} accepted dialog {} of type {}",
            self.handler_id,
            dialog_id,
            type_no
        );
        ctx.arm_timeout();
        ctx.schedule_start();
        ctx.on_frame(payload, finish, cont)
    }

    fn refuse(self: &Arc<Self>, dialog_id: i64, cause: DialogAbortCause, detail: String) {
        self.permits.free(1);
        if self.stage(&ProtocolMessage::DialogAbort {
            cause,
            dialog_id,
            detail,
        }) {
            self.schedule_flush();
        }
    }

    fn lookup(&self, dialog_id: i64) -> Result<Option<Arc<DialogContext>>, ConnectionError> {
        let table = lock(&self.table);
        let local_positive = self.is_creator;
        let issued = if (dialog_id > 0) == local_positive {
            table.last_local_id
        } else {
            table.last_remote_id
        };
        if dialog_id.unsigned_abs() > issued.unsigned_abs() {
            return Err(ConnectionError::violation(format!(
                "dialog id {} was never issued",
                dialog_id
            )));
        }
        Ok(table.by_id.get(&dialog_id).cloned())
    }

    pub(crate) fn outbound_lengths(&self) -> (u32, u32) {
        match self.negotiated.get() {
            Some(n) => (n.outbound_max_length, n.outbound_max_total_length),
            None => (self.config.max_length, self.config.max_total_length),
        }
    }

    /// Stage `message`; false once the output is closed
    pub(crate) fn stage(&self, message: &ProtocolMessage) -> bool {
        let staged = self.output.write_message(message);
        if staged {
            self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        }
        staged
    }

    pub(crate) fn assign_dialog_id(&self, ctx: &Arc<DialogContext>) -> Option<i64> {
        let mut table = lock(&self.table);
        let state = self.state();
        if state < EndpointState::Normal || state.is_terminating() {
            return None;
        }
        let pos = table.pending_id.iter().position(|c| Arc::ptr_eq(c, ctx))?;
        match self.local_slots.try_acquire() {
            Ok(permit) => permit.forget(),
            Err(_) => {
                trace!("Dialog {} waiting for a local slot", ctx.context_id());
                return None;
            }
        }
        let id = if self.is_creator {
            table.last_local_id + 1
        } else {
            table.last_local_id - 1
        };
        table.last_local_id = id;
        table.pending_id.remove(pos);
        table.by_id.insert(id, ctx.clone());
        ctx.set_dialog_id(id);
        Some(id)
    }

    pub(crate) fn request_write(self: &Arc<Self>, ctx: &Arc<DialogContext>) {
        {
            let mut pending = lock(&self.write_pending);
            if pending.members.insert(ctx.context_id()) {
                pending.queue.push_back(ctx.clone());
            }
        }
        self.schedule_flush();
    }

    pub(crate) fn schedule_flush(self: &Arc<Self>) {
        if self.flush_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.run(|handler| {
            handler.flush_scheduled.store(false, Ordering::Release);
            handler.flush();
        });
    }

    fn take_write_batch(&self) -> Vec<Arc<DialogContext>> {
        let mut pending = lock(&self.write_pending);
        let n = self.config.flush_batch_num_contexts.max(1).min(pending.queue.len());
        let batch: Vec<_> = pending.queue.drain(..n).collect();
        for ctx in &batch {
            pending.members.remove(&ctx.context_id());
        }
        batch
    }

    fn flush(self: &Arc<Self>) {
        let _guard = match self.flush_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                self.flush_again.store(true, Ordering::Release);
                return;
            }
        };
        loop {
            self.flush_again.store(false, Ordering::Release);
            if !self.write_blocked.load(Ordering::Acquire) {
                for _ in 0..self.config.flush_num_batches.max(1) {
                    let batch = self.take_write_batch();
                    if batch.is_empty() {
                        break;
                    }
                    for ctx in batch {
                        ctx.flush_frames();
                    }
                }
            }
            let more = !lock(&self.write_pending).queue.is_empty();
            if !self.flush_transport(more) {
                return;
            }
            if more {
                self.transport.set_write_interest(true);
            }
            if !self.flush_again.load(Ordering::Acquire) {
                return;
            }
        }
    }

    fn flush_transport(self: &Arc<Self>, more_to_come: bool) -> bool {
        if self.output.is_empty() {
            return true;
        }
        match self.transport.flush_internal(&self.output, more_to_come) {
            Ok(true) => true,
            Ok(false) => {
                trace!("Endpoint {:016x} transport busy", self.handler_id);
                self.write_blocked.store(true, Ordering::Release);
                self.transport.set_write_interest(true);
                true
            }
            Err(err) => {
                self.terminate(ConnectionError::io(self.state(), &err));
                false
            }
        }
    }

    /// A dialog finished or aborted; effective once per dialog
    pub(crate) fn on_dialog_done(self: &Arc<Self>, ctx: &Arc<DialogContext>) {
        if !ctx.mark_done(self.executor.now_millis()) {
            return;
        }
        let now_empty = {
            let mut table = lock(&self.table);
            table.remove(ctx);
            table.is_empty()
        };

        if ctx.is_locally_started() {
            if ctx.dialog_id() != 0 {
                self.local_slots.add_permits(1);
                self.retry_pending_id();
            }
        } else {
            self.release_admission(ctx);
            self.permits.free(1);
        }

        if ctx.is_aborted() {
            self.stats.dialogs_aborted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.dialogs_finished.fetch_add(1, Ordering::Relaxed);
        }

        if now_empty && self.state() == EndpointState::ShuttingDown {
            self.run(|handler| {
                if handler.state() == EndpointState::ShuttingDown && lock(&handler.table).is_empty() {
                    handler.terminate(ConnectionError::shutdown("shutdown complete"));
                }
            });
        }
    }

    /// Stop counting a remote dialog against `max_dialogs`.
    ///
    /// The peer reuses its slot as soon as its final frame is staged, so the
    /// count drops once both final frames have crossed, not when the
    /// application has read everything.
    pub(crate) fn release_admission(&self, ctx: &DialogContext) {
        if ctx.take_admission() {
            let _ = self
                .remote_active
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        }
    }

    fn retry_pending_id(self: &Arc<Self>) {
        let waiting: Vec<_> = lock(&self.table).pending_id.iter().cloned().collect();
        for ctx in waiting.iter().filter(|c| c.has_outbound()) {
            self.request_write(ctx);
        }
    }

    /// Tear the connection down; only the first call has an effect
    pub fn terminate(self: &Arc<Self>, error: ConnectionError) {
        let previous = {
            let mut lifecycle = lock(&self.lifecycle);
            if lifecycle.state.is_terminating() {
                return;
            }
            let previous = lifecycle.state;
            lifecycle.state = EndpointState::Terminating;
            lifecycle.error = Some(error.clone());
            previous
        };

        if error.is_expected() {
            info!(
                "Endpoint {:016x} terminating from {}: {}",
                self.handler_id, previous, error
            );
        } else {
            warn!(
                "Endpoint {:016x} terminating from {}: {}",
                self.handler_id, previous, error
            );
        }

        if let Some(task) = lock(&self.connect_timer).take() {
            task.cancel();
        }
        for task in lock(&self.tasks).drain(..) {
            task.cancel();
        }

        let dialogs = lock(&self.table).drain();
        {
            let mut pending = lock(&self.write_pending);
            pending.queue.clear();
            pending.members.clear();
        }
        let info = AbortInfo::connection(&error);
        for ctx in &dialogs {
            ctx.abort(info.clone());
        }

        if !error.is_from_remote() && !self.is_creator && previous > EndpointState::Connecting {
            self.stage(&ProtocolMessage::ConnectionAbort {
                cause: error.abort_cause(),
                detail: error.detail().to_string(),
            });
        }

        let reserved = self.reserved_permits.swap(0, Ordering::AcqRel);
        if reserved > 0 {
            self.permits.free(reserved);
        }
        self.permits.close();

        if !self.output.is_empty() {
            if let Err(err) = self.transport.flush_internal(&self.output, false) {
                trace!("Endpoint {:016x} final flush failed: {}", self.handler_id, err);
            }
        }
        self.output.close();
        self.transport.cleanup();

        lock(&self.lifecycle).state = EndpointState::Terminated;
        debug!("Endpoint {:016x} terminated", self.handler_id);
        if let Some(listener) = &self.listener {
            listener.on_endpoint_terminated(self.handler_id, &error);
        }
        self.terminated.send_replace(true);
    }
}

impl PermitListener for EndpointHandler {
    fn on_permits_granted(&self, n: u32) {
        let weak = self.self_ref.clone();
        let permits = self.permits.clone();
        self.executor.execute(Box::new(move || match weak.upgrade() {
            Some(handler) => handler.permits_granted(n),
            None => permits.free(n),
        }));
    }
}

impl fmt::Debug for EndpointHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointHandler")
            .field("handler_id", &format_args!("{:016x}", self.handler_id))
            .field("creator", &self.is_creator)
            .field("state", &self.state())
            .finish()
    }
}
