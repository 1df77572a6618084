//! Endpoint handshake, dialog multiplexing, permits, flushing and timeouts for mux.
//!
//! This crate runs the connection-level state machine on top of the
//! `mux-wire` codec: one [`EndpointHandler`] per connection negotiates
//! limits with the peer, then carries any number of concurrent dialogs,
//! each represented by a [`DialogContext`] and driven by an application
//! [`DialogHandler`].
//!
//! ## Features
//!
//! - **Handshake**: protocol version and connection limit negotiation
//! - **Dialogs**: signed dialog IDs, framing of large messages, ordered callbacks
//! - **Admission**: shared permit pool for inbound dialogs, local slots for outbound
//! - **Batch flushing**: bounded passes over dialogs with pending output
//! - **Timeouts**: connect, heartbeat, idle and per-dialog
//! - **Transports**: in-process loopback pair and tokio TCP
//!
//! ## Example
//!
//! ```rust,no_run
//! use mux_session::{
//!     connect_tcp, DialogContext, DialogException, DialogHandler, EndpointConfig,
//!     EndpointHandler, HandlerResult, MessageOutput, TcpTransport, TokioExecutor,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! struct Hello;
//!
//! impl DialogHandler for Hello {
//!     fn on_start(&self, ctx: &Arc<DialogContext>, _aborted: bool) -> HandlerResult {
//!         ctx.write(MessageOutput::from("hello"), true)?;
//!         Ok(())
//!     }
//!
//!     fn on_can_read(&self, ctx: &Arc<DialogContext>, _finished: bool) -> HandlerResult {
//!         while let Some(reply) = ctx.read() {
//!             println!("reply: {:?}", reply.into_bytes());
//!         }
//!         Ok(())
//!     }
//!
//!     fn on_abort(&self, _ctx: &Arc<DialogContext>, cause: &DialogException) {
//!         eprintln!("aborted: {}", cause);
//!     }
//! }
//!
//! # async fn example() -> anyhow::Result<()> {
//! let stream = connect_tcp("127.0.0.1:7400".parse()?).await?;
//! let (transport, driver) = TcpTransport::new(stream)?;
//! let endpoint = EndpointHandler::builder(EndpointConfig::default(), TokioExecutor::new(), transport)
//!     .creator(true)
//!     .build();
//! endpoint.start();
//! driver.start(&endpoint);
//!
//! endpoint.start_dialog(1, Arc::new(Hello), Duration::from_secs(5))?;
//! endpoint.await_terminated().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod dialog;
pub mod endpoint;
pub mod error;
pub mod executor;
pub mod handler;
pub mod handshake;
pub mod keepalive;
pub mod manager;
pub mod message;
pub mod permits;
pub mod state;
pub mod task;
pub mod transport;

#[cfg(test)]
mod testing;

// Re-export main types
pub use config::EndpointConfig;
pub use dialog::DialogContext;
pub use endpoint::{EndpointBuilder, EndpointHandler, EndpointStats, IdGenerator, RandomIdGenerator};
pub use error::{ConnectionError, DialogErrorKind, DialogException, StartDialogError, WriteError};
pub use executor::{CancelToken, ConnectionExecutor, Job, ManualExecutor, TokioExecutor};
pub use handler::{DialogHandler, DialogHandlerFactories, DialogHandlerFactory, HandlerResult};
pub use handshake::NegotiatedLimits;
pub use keepalive::{now_cookie, rtt_from_cookie};
pub use manager::{EndpointListener, EndpointRegistry};
pub use message::{MessageInput, MessageOutput};
pub use permits::{PermitHandle, PermitListener, PermitPool, PermitStats, UnlimitedPermits};
pub use state::{DialogState, EndpointState, Progress};
pub use task::ScheduledTask;
pub use transport::{connect_tcp, listen_tcp, LoopbackTransport, TcpDriver, TcpTransport, Transport};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
