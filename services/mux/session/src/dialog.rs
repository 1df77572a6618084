//! Per-dialog context.
//!
//! A [`DialogContext`] owns one dialog's state machine, its outbound frame
//! queue and its reassembled inbound messages, and serializes delivery of
//! the application callbacks. All callbacks run on the connection executor.

use crate::endpoint::EndpointHandler;
use crate::error::{ConnectionError, DialogErrorKind, DialogException, WriteError};
use crate::handler::{DialogHandler, HandlerResult};
use crate::lock;
use crate::message::{MessageInput, MessageOutput};
use crate::state::{DialogState, Progress};
use crate::task::ScheduledTask;
use bytes::Bytes;
use mux_wire::{DialogAbortCause, ProtocolMessage};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteState {
    Idle,
    Pending,
    PendingWithCallback,
}

#[derive(Debug)]
struct OutFrame {
    payload: Bytes,
    finish: bool,
    cont: bool,
}

// Guarded together: the write path and the abort path must not interleave
// their messages for one dialog.
#[derive(Debug, Default)]
struct Outbound {
    frames: VecDeque<OutFrame>,
    started_on_wire: bool,
    abort_written: bool,
}

#[derive(Debug, Default)]
struct Inbound {
    partial: MessageInput,
    messages: VecDeque<MessageInput>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Callback {
    Start,
    CanRead { finished: bool },
    CanWrite,
    Abort,
}

#[derive(Debug, Default)]
struct Callbacks {
    start_entered: bool,
    start_returned: bool,
    abort_delivered: bool,
    in_abort: bool,
    deferred: Vec<Callback>,
}

/// Recorded reason for an abort
#[derive(Debug, Clone)]
pub(crate) struct AbortInfo {
    cause: DialogAbortCause,
    kind: DialogErrorKind,
    detail: String,
    from_remote: bool,
}

impl AbortInfo {
    pub(crate) fn cancelled(detail: impl Into<String>) -> Self {
        Self {
            cause: DialogAbortCause::UnknownReason,
            kind: DialogErrorKind::Cancelled,
            detail: detail.into(),
            from_remote: false,
        }
    }

    pub(crate) fn timed_out(detail: impl Into<String>) -> Self {
        Self {
            cause: DialogAbortCause::TimedOut,
            kind: DialogErrorKind::TimedOut,
            detail: detail.into(),
            from_remote: false,
        }
    }

    pub(crate) fn failed(detail: impl Into<String>) -> Self {
        Self {
            cause: DialogAbortCause::UnknownReason,
            kind: DialogErrorKind::Unknown,
            detail: detail.into(),
            from_remote: false,
        }
    }

    pub(crate) fn connection(err: &ConnectionError) -> Self {
        Self {
            cause: DialogAbortCause::ConnectionAbort,
            kind: DialogErrorKind::Connection(err.clone()),
            detail: err.to_string(),
            from_remote: err.is_from_remote(),
        }
    }

    pub(crate) fn remote(cause: DialogAbortCause, detail: String) -> Self {
        Self {
            cause,
            kind: DialogErrorKind::Unknown,
            detail,
            from_remote: true,
        }
    }

    /// Whether a DIALOG_ABORT goes on the wire for this abort
    fn should_send(&self) -> bool {
        !self.from_remote && self.cause != DialogAbortCause::ConnectionAbort
    }

    fn to_exception(&self, sent_frames: bool) -> DialogException {
        if self.from_remote && self.cause != DialogAbortCause::ConnectionAbort {
            let side_effect = sent_frames
                && !matches!(
                    self.cause,
                    DialogAbortCause::UnknownType | DialogAbortCause::EndpointShuttingDown
                );
            return DialogException::from_remote(self.cause, self.detail.clone(), side_effect);
        }
        DialogException {
            kind: self.kind.clone(),
            detail: self.detail.clone(),
            from_remote: self.from_remote,
            has_side_effect: sent_frames,
        }
    }
}

/// One multiplexed dialog
pub struct DialogContext {
    context_id: u64,
    dialog_id: AtomicI64,
    type_no: i32,
    timeout: Duration,
    locally_started: bool,
    sampled: bool,
    handler: Arc<dyn DialogHandler>,
    endpoint: Arc<EndpointHandler>,
    state: Mutex<DialogState>,
    write_state: Mutex<WriteState>,
    outbound: Mutex<Outbound>,
    inbound: Mutex<Inbound>,
    callbacks: Mutex<Callbacks>,
    abort: OnceLock<AbortInfo>,
    done_at: OnceLock<u64>,
    sent_frames: AtomicBool,
    admission_released: AtomicBool,
    timeout_task: Mutex<Option<ScheduledTask>>,
}

impl DialogContext {
    fn new(
        endpoint: Arc<EndpointHandler>,
        type_no: i32,
        handler: Arc<dyn DialogHandler>,
        dialog_id: i64,
        timeout: Duration,
        sampled: bool,
    ) -> Self {
        let remote = dialog_id != 0;
        Self {
            context_id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            dialog_id: AtomicI64::new(dialog_id),
            type_no,
            timeout,
            locally_started: !remote,
            sampled,
            handler,
            endpoint,
            state: Mutex::new(DialogState::new(remote)),
            write_state: Mutex::new(WriteState::Idle),
            outbound: Mutex::new(Outbound {
                started_on_wire: remote,
                ..Default::default()
            }),
            inbound: Mutex::new(Inbound::default()),
            callbacks: Mutex::new(Callbacks::default()),
            abort: OnceLock::new(),
            done_at: OnceLock::new(),
            sent_frames: AtomicBool::new(false),
            admission_released: AtomicBool::new(false),
            timeout_task: Mutex::new(None),
        }
    }

    pub(crate) fn new_local(
        endpoint: Arc<EndpointHandler>,
        type_no: i32,
        handler: Arc<dyn DialogHandler>,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self::new(endpoint, type_no, handler, 0, timeout, false))
    }

    pub(crate) fn new_remote(
        endpoint: Arc<EndpointHandler>,
        type_no: i32,
        handler: Arc<dyn DialogHandler>,
        dialog_id: i64,
        timeout: Duration,
        sampled: bool,
    ) -> Arc<Self> {
        Arc::new(Self::new(endpoint, type_no, handler, dialog_id, timeout, sampled))
    }

    /// Process-unique context number, used in logs
    pub fn context_id(&self) -> u64 {
        self.context_id
    }

    /// Wire dialog ID; zero until assigned
    pub fn dialog_id(&self) -> i64 {
        self.dialog_id.load(Ordering::Acquire)
    }

    /// Dialog type number
    pub fn type_no(&self) -> i32 {
        self.type_no
    }

    /// Dialog timeout; zero means none
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether this side started the dialog
    pub fn is_locally_started(&self) -> bool {
        self.locally_started
    }

    /// Sampling flag carried by DIALOG_START
    pub fn is_sampled(&self) -> bool {
        self.sampled
    }

    /// Current state
    pub fn state(&self) -> DialogState {
        *lock(&self.state)
    }

    /// Whether the dialog aborted
    pub fn is_aborted(&self) -> bool {
        self.state().is_aborted()
    }

    /// Abort reason, once aborted
    pub fn abort_exception(&self) -> Option<DialogException> {
        self.abort
            .get()
            .map(|info| info.to_exception(self.sent_frames.load(Ordering::Acquire)))
    }

    /// Executor time at which the dialog left the endpoint, if it has
    pub fn done_at(&self) -> Option<u64> {
        self.done_at.get().copied()
    }

    /// Endpoint carrying this dialog
    pub fn endpoint(&self) -> &Arc<EndpointHandler> {
        &self.endpoint
    }

    /// Queue `message`; `finished` marks the last one.
    ///
    /// Returns `Ok(false)` when the dialog is aborted or a previous message
    /// is still being flushed; in the latter case `on_can_write` follows
    /// once it has been.
    pub fn write(self: &Arc<Self>, message: MessageOutput, finished: bool) -> Result<bool, WriteError> {
        {
            let state = lock(&self.state);
            match state.write_progress() {
                None => return Ok(false),
                Some(Progress::Open) => {}
                Some(_) => return Err(WriteError::WriteAfterFin),
            }
        }

        let (max_length, max_total_length) = self.endpoint.outbound_lengths();
        if message.len() > max_total_length as usize {
            return Err(WriteError::MessageTooLarge {
                len: message.len(),
                max: max_total_length,
            });
        }

        {
            let mut ws = lock(&self.write_state);
            match *ws {
                WriteState::Idle => *ws = WriteState::Pending,
                WriteState::Pending | WriteState::PendingWithCallback => {
                    *ws = WriteState::PendingWithCallback;
                    return Ok(false);
                }
            }
        }

        if finished {
            let mut state = lock(&self.state);
            match state.write_last() {
                Ok(next) => *state = next,
                Err(_) => {
                    let aborted = state.is_aborted();
                    drop(state);
                    *lock(&self.write_state) = WriteState::Idle;
                    return if aborted {
                        Ok(false)
                    } else {
                        Err(WriteError::WriteAfterFin)
                    };
                }
            }
        }

        let frames = message.into_frames(max_length as usize);
        {
            let mut out = lock(&self.outbound);
            let last = frames.len() - 1;
            for (i, payload) in frames.into_iter().enumerate() {
                out.frames.push_back(OutFrame {
                    payload,
                    finish: finished && i == last,
                    cont: i != last,
                });
            }
        }
        trace!(
            "Dialog {} queued message (finished: {})",
            self.context_id,
            finished
        );
        self.endpoint.request_write(self);
        Ok(true)
    }

    /// Next complete inbound message
    pub fn read(self: &Arc<Self>) -> Option<MessageInput> {
        let (message, became_fin) = {
            let mut inbound = lock(&self.inbound);
            let mut state = lock(&self.state);
            if state.is_aborted() {
                return None;
            }
            let message = inbound.messages.pop_front()?;
            let mut became_fin = false;
            if inbound.messages.is_empty() && state.read_progress() == Some(Progress::Fin0) {
                *state = state.read_delivered();
                became_fin = *state == DialogState::Fin;
            }
            (message, became_fin)
        };
        if became_fin {
            self.finish();
        }
        Some(message)
    }

    /// Abort the dialog locally
    pub fn cancel(self: &Arc<Self>, detail: impl Into<String>) {
        self.abort(AbortInfo::cancelled(detail));
    }

    pub(crate) fn arm_timeout(self: &Arc<Self>) {
        if self.timeout.is_zero() {
            return;
        }
        let weak = Arc::downgrade(self);
        let timeout = self.timeout;
        let task = ScheduledTask::once(self.endpoint.executor(), timeout, move || {
            if let Some(ctx) = weak.upgrade() {
                ctx.abort(AbortInfo::timed_out(format!(
                    "dialog timed out after {:?}",
                    timeout
                )));
            }
        });
        *lock(&self.timeout_task) = Some(task);
    }

    /// Record that the dialog left the endpoint; true only the first time
    pub(crate) fn mark_done(&self, now: u64) -> bool {
        if self.done_at.set(now).is_err() {
            return false;
        }
        if let Some(task) = lock(&self.timeout_task).take() {
            task.cancel();
        }
        true
    }

    /// Claim the remote dialog's concurrency slot for release; true only once
    pub(crate) fn take_admission(&self) -> bool {
        !self.locally_started && !self.admission_released.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn set_dialog_id(&self, id: i64) {
        self.dialog_id.store(id, Ordering::Release);
        let mut state = lock(&self.state);
        *state = state.started();
    }

    pub(crate) fn has_outbound(&self) -> bool {
        !lock(&self.outbound).frames.is_empty()
    }

    /// Move queued frames into the output staging buffer
    pub(crate) fn flush_frames(self: &Arc<Self>) {
        let mut wrote_last = false;
        let mut message_done = false;
        {
            let mut out = lock(&self.outbound);
            if out.frames.is_empty() {
                return;
            }
            if out.abort_written || self.is_aborted() {
                out.frames.clear();
                return;
            }

            let mut dialog_id = self.dialog_id();
            if dialog_id == 0 {
                match self.endpoint.assign_dialog_id(self) {
                    Some(id) => dialog_id = id,
                    None => return,
                }
            }

            while let Some(frame) = out.frames.pop_front() {
                let message = if out.started_on_wire {
                    ProtocolMessage::DialogFrame {
                        finish: frame.finish,
                        cont: frame.cont,
                        dialog_id,
                        payload: frame.payload,
                    }
                } else {
                    out.started_on_wire = true;
                    ProtocolMessage::DialogStart {
                        sampled: self.sampled,
                        finish: frame.finish,
                        cont: frame.cont,
                        type_no: self.type_no,
                        dialog_id,
                        timeout_millis: self.timeout.as_millis() as u64,
                        payload: frame.payload,
                    }
                };
                if !self.endpoint.stage(&message) {
                    out.frames.clear();
                    return;
                }
                self.sent_frames.store(true, Ordering::Release);
                message_done |= !frame.cont;
                wrote_last |= frame.finish;
            }
        }

        let mut finished = false;
        let mut exchanged = false;
        if wrote_last {
            let mut state = lock(&self.state);
            *state = state.write_flushed();
            finished = *state == DialogState::Fin;
            exchanged = state.exchange_complete();
        }
        if exchanged {
            self.endpoint.release_admission(self);
        }

        if message_done {
            let mut ws = lock(&self.write_state);
            let notify = *ws == WriteState::PendingWithCallback;
            *ws = WriteState::Idle;
            drop(ws);
            if notify && !finished {
                self.schedule_callback(Callback::CanWrite);
            }
        }

        if finished {
            self.finish();
        }
    }

    /// Accept one inbound frame
    pub(crate) fn on_frame(
        self: &Arc<Self>,
        payload: Bytes,
        finish: bool,
        cont: bool,
    ) -> Result<(), ConnectionError> {
        let max_total = self.endpoint.config().max_total_length as usize;
        let mut exchanged = false;
        let completed = {
            let mut inbound = lock(&self.inbound);
            let mut state = lock(&self.state);
            match state.read_progress() {
                None => return Ok(()),
                Some(Progress::Open) => {}
                Some(_) => {
                    return Err(ConnectionError::violation(format!(
                        "frame after final frame on dialog {}",
                        self.dialog_id()
                    )))
                }
            }
            if inbound.partial.len() + payload.len() > max_total {
                return Err(ConnectionError::violation(format!(
                    "message on dialog {} exceeds maximum total length {}",
                    self.dialog_id(),
                    max_total
                )));
            }
            inbound.partial.push(payload);
            if cont {
                false
            } else {
                let message = std::mem::take(&mut inbound.partial);
                inbound.messages.push_back(message);
                if finish {
                    if let Ok(next) = state.read_last() {
                        *state = next;
                    }
                    exchanged = state.exchange_complete();
                }
                true
            }
        };

        if exchanged {
            self.endpoint.release_admission(self);
        }

        if completed {
            self.schedule_callback(Callback::CanRead { finished: finish });
        }
        Ok(())
    }

    /// Abort with `info` unless already finished or aborted
    pub(crate) fn abort(self: &Arc<Self>, info: AbortInfo) {
        {
            let mut state = lock(&self.state);
            match state.abort() {
                Ok(next) => *state = next,
                Err(_) => return,
            }
            let _ = self.abort.set(info.clone());
        }

        debug!(
            "Dialog {} (id {}) aborted{}: {}",
            self.context_id,
            self.dialog_id(),
            if info.from_remote { " by peer" } else { "" },
            info.detail
        );

        if let Some(task) = lock(&self.timeout_task).take() {
            task.cancel();
        }

        let mut staged = false;
        {
            let mut out = lock(&self.outbound);
            out.frames.clear();
            let dialog_id = self.dialog_id();
            if info.should_send() && dialog_id != 0 && !out.abort_written {
                out.abort_written = true;
                staged = self.endpoint.stage(&ProtocolMessage::DialogAbort {
                    cause: info.cause,
                    dialog_id,
                    detail: info.detail.clone(),
                });
            }
        }
        if staged {
            self.endpoint.schedule_flush();
        }

        self.schedule_callback(Callback::Abort);
        self.endpoint.on_dialog_done(self);
    }

    fn finish(self: &Arc<Self>) {
        trace!("Dialog {} (id {}) finished", self.context_id, self.dialog_id());
        self.endpoint.on_dialog_done(self);
    }

    fn schedule_callback(self: &Arc<Self>, callback: Callback) {
        let ctx = self.clone();
        self.endpoint
            .executor()
            .execute(Box::new(move || ctx.deliver(callback)));
    }

    pub(crate) fn schedule_start(self: &Arc<Self>) {
        self.schedule_callback(Callback::Start);
    }

    fn deliver(self: &Arc<Self>, callback: Callback) {
        if callback == Callback::Start {
            let aborted = {
                let mut cb = lock(&self.callbacks);
                if cb.start_entered {
                    return;
                }
                cb.start_entered = true;
                self.is_aborted()
            };
            self.invoke("on_start", |handler, ctx| handler.on_start(ctx, aborted));

            let mut deferred = {
                let mut cb = lock(&self.callbacks);
                cb.start_returned = true;
                std::mem::take(&mut cb.deferred)
            };
            // abort supersedes everything still pending
            deferred.sort_by_key(|c| *c == Callback::Abort);
            for callback in deferred {
                self.deliver(callback);
            }
            return;
        }

        {
            let mut cb = lock(&self.callbacks);
            if !cb.start_returned {
                cb.deferred.push(callback);
                return;
            }
            if callback == Callback::Abort {
                if cb.abort_delivered || cb.in_abort {
                    return;
                }
                cb.abort_delivered = true;
                cb.in_abort = true;
            }
        }

        match callback {
            Callback::Abort => {
                if let Some(exception) = self.abort_exception() {
                    let handler = self.handler.clone();
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                        handler.on_abort(self, &exception)
                    }));
                    lock(&self.callbacks).in_abort = false;
                    if let Err(payload) = outcome {
                        error!("Dialog {} on_abort panicked", self.context_id);
                        panic::resume_unwind(payload);
                    }
                } else {
                    lock(&self.callbacks).in_abort = false;
                }
            }
            Callback::CanRead { finished } => {
                if !self.is_aborted() {
                    self.invoke("on_can_read", |handler, ctx| {
                        handler.on_can_read(ctx, finished)
                    });
                }
            }
            Callback::CanWrite => {
                if !self.is_aborted() {
                    self.invoke("on_can_write", |handler, ctx| handler.on_can_write(ctx));
                }
            }
            Callback::Start => {}
        }
    }

    fn invoke<F>(self: &Arc<Self>, name: &'static str, f: F)
    where
        F: FnOnce(&dyn DialogHandler, &Arc<DialogContext>) -> HandlerResult,
    {
        let handler = self.handler.clone();
        match panic::catch_unwind(AssertUnwindSafe(|| f(handler.as_ref(), self))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(
                    "Dialog {} (type {}) {} failed: {:#}",
                    self.context_id, self.type_no, name, err
                );
                self.abort(AbortInfo::failed(format!("{} failed: {:#}", name, err)));
            }
            Err(payload) => {
                error!(
                    "Dialog {} (type {}) {} panicked",
                    self.context_id, self.type_no, name
                );
                self.abort(AbortInfo::failed(format!("{} panicked", name)));
                panic::resume_unwind(payload);
            }
        }
    }
}

impl fmt::Debug for DialogContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialogContext")
            .field("context_id", &self.context_id)
            .field("dialog_id", &self.dialog_id())
            .field("type_no", &self.type_no)
            .field("locally_started", &self.locally_started)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::EndpointState;
    use crate::testing::{out, Event, Pair, Recorder, RecordingFactory};

    #[test]
    fn test_cancel_makes_dialog_inert() {
        let factory = RecordingFactory::plain();
        let pair = Pair::builder().serve(1, factory.clone()).build();

        let (ctx, client) = pair.client_dialog(1);
        ctx.write(out(b"x"), false).unwrap();
        pair.run();

        ctx.cancel("changed my mind");
        assert_eq!(ctx.state(), DialogState::Aborted);
        assert_eq!(ctx.write(out(b"y"), false), Ok(false));
        assert!(ctx.read().is_none());
        pair.run();

        let abort = client.abort().unwrap();
        assert_eq!(abort.kind, DialogErrorKind::Cancelled);
        assert!(!abort.from_remote);

        let remote = factory.get(0).abort().unwrap();
        assert_eq!(remote.kind, DialogErrorKind::Unknown);
        assert!(remote.from_remote);
        assert_eq!(pair.server.active_dialogs(), 0);
    }

    #[test]
    fn test_abort_before_start_still_delivers_start() {
        let pair = Pair::builder().build();

        let (ctx, client) = pair.client_dialog(1);
        ctx.cancel("too late");
        pair.run();

        let events = client.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], Event::Start { aborted: true });
        assert!(matches!(events[1], Event::Abort(_)));
        assert_eq!(ctx.dialog_id(), 0);
        // nothing went on the wire for this dialog
        assert_eq!(pair.server.stats().messages_received, 2);
    }

    #[test]
    fn test_abort_delivered_once() {
        let pair = Pair::builder().build();
        let recorder = Arc::new(Recorder {
            cancel_in_abort: true,
            ..Default::default()
        });

        let (ctx, _) = pair.client_dialog_with(1, recorder.clone(), Duration::from_secs(1));
        pair.run();
        ctx.cancel("once");
        ctx.cancel("twice");
        pair.run();

        let aborts = recorder
            .events()
            .iter()
            .filter(|e| matches!(e, Event::Abort(_)))
            .count();
        assert_eq!(aborts, 1);
        assert_eq!(ctx.abort_exception().unwrap().detail, "once");
    }

    #[test]
    fn test_write_after_fin() {
        let pair = Pair::builder().build();

        let (ctx, _) = pair.client_dialog(1);
        assert!(ctx.write(out(b"last"), true).unwrap());
        assert_eq!(ctx.write(out(b"more"), false), Err(WriteError::WriteAfterFin));
    }

    #[test]
    fn test_write_while_pending_gets_can_write() {
        let factory = RecordingFactory::plain();
        let pair = Pair::builder().serve(1, factory.clone()).build();

        let (ctx, client) = pair.client_dialog(1);
        assert!(ctx.write(out(b"a"), false).unwrap());
        assert!(!ctx.write(out(b"b"), false).unwrap());
        pair.run();

        assert!(client.events().contains(&Event::CanWrite));
        assert!(ctx.write(out(b"b"), false).unwrap());
        pair.run();

        let server = factory.get(0);
        assert_eq!(server.received.lock().unwrap().len(), 2);
        assert_eq!(server.received_bytes(), b"ab");
    }

    #[test]
    fn test_large_message_is_split_into_frames() {
        let factory = RecordingFactory::plain();
        let mut builder = Pair::builder().serve(1, factory.clone());
        builder.client_config.max_length = 4;
        let pair = builder.build();

        let (ctx, _) = pair.client_dialog(1);
        let sent_before = pair.client.stats().messages_sent;
        ctx.write(out(b"0123456789"), true).unwrap();
        pair.run();

        assert_eq!(pair.client.stats().messages_sent - sent_before, 3);
        let server = factory.get(0);
        assert_eq!(server.can_read_count(), 1);
        assert_eq!(server.received.lock().unwrap().len(), 1);
        assert_eq!(server.received_bytes(), b"0123456789");
    }

    #[test]
    fn test_message_too_large() {
        let mut builder = Pair::builder();
        builder.client_config.max_total_length = 8;
        let pair = builder.build();

        let (ctx, _) = pair.client_dialog(1);
        assert_eq!(
            ctx.write(out(b"123456789"), true),
            Err(WriteError::MessageTooLarge { len: 9, max: 8 })
        );
        assert!(ctx.write(out(b"12345678"), true).unwrap());
    }

    #[test]
    fn test_inbound_message_over_total_length_is_violation() {
        let factory = RecordingFactory::plain();
        let mut builder = Pair::builder().serve(1, factory);
        builder.server_config.max_total_length = 8;
        let pair = builder.build();

        pair.inject_into_server(&ProtocolMessage::DialogStart {
            sampled: false,
            finish: true,
            cont: false,
            type_no: 1,
            dialog_id: 1,
            timeout_millis: 0,
            payload: Bytes::from_static(b"123456789"),
        });

        assert!(matches!(
            pair.server.termination_error(),
            Some(ConnectionError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn test_frame_after_final_is_violation() {
        let factory = RecordingFactory::plain();
        let pair = Pair::builder().serve(1, factory).build();

        let (ctx, _) = pair.client_dialog(1);
        ctx.write(out(b"done"), true).unwrap();
        pair.run();

        pair.inject_into_server(&ProtocolMessage::DialogFrame {
            finish: false,
            cont: false,
            dialog_id: 1,
            payload: Bytes::from_static(b"extra"),
        });

        assert!(matches!(
            pair.server.termination_error(),
            Some(ConnectionError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn test_dialog_timeout_aborts_both_sides() {
        let factory = RecordingFactory::plain();
        let pair = Pair::builder().serve(1, factory.clone()).build();

        let (ctx, client) =
            pair.client_dialog_with(1, Recorder::new(), Duration::from_millis(50));
        ctx.write(out(b"slow"), false).unwrap();
        pair.run();
        assert_eq!(factory.get(0).ctx().timeout(), Duration::from_millis(50));

        pair.advance(50);

        let local = client.abort().unwrap();
        assert_eq!(local.kind, DialogErrorKind::TimedOut);
        assert!(!local.from_remote);
        let remote = factory.get(0).abort().unwrap();
        assert_eq!(remote.kind, DialogErrorKind::TimedOut);
        assert!(remote.from_remote);
        assert_eq!(pair.client.active_dialogs(), 0);
        assert_eq!(pair.server.active_dialogs(), 0);
    }

    #[test]
    fn test_remote_zero_timeout_means_none() {
        let factory = RecordingFactory::plain();
        let pair = Pair::builder().serve(1, factory.clone()).build();

        pair.inject_into_server(&ProtocolMessage::DialogStart {
            sampled: true,
            finish: false,
            cont: false,
            type_no: 1,
            dialog_id: 1,
            timeout_millis: 0,
            payload: Bytes::from_static(b"x"),
        });
        pair.advance(60_000);

        let server_ctx = factory.get(0).ctx();
        assert!(server_ctx.is_sampled());
        assert!(!server_ctx.is_aborted());
        assert_eq!(server_ctx.dialog_id(), 1);
    }

    #[test]
    fn test_handler_error_aborts_dialog() {
        let factory = RecordingFactory::new(|| Recorder {
            fail_on_read: true,
            ..Default::default()
        });
        let pair = Pair::builder().serve(1, factory.clone()).build();

        let (ctx, client) = pair.client_dialog(1);
        ctx.write(out(b"boom"), false).unwrap();
        pair.run();

        assert_eq!(factory.get(0).abort().unwrap().kind, DialogErrorKind::Unknown);
        let abort = client.abort().unwrap();
        assert_eq!(abort.kind, DialogErrorKind::Unknown);
        assert!(abort.from_remote);
        assert!(abort.has_side_effect);
        assert_eq!(pair.server.state(), EndpointState::Normal);
    }

    #[test]
    fn test_zero_timeout_rejected_locally() {
        let pair = Pair::builder().build();
        let result = pair
            .client
            .start_dialog(1, Recorder::new(), Duration::ZERO);
        assert!(matches!(result, Err(crate::error::StartDialogError::InvalidTimeout)));
    }
}
