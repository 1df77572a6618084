//! Application callbacks for dialogs.

use crate::dialog::DialogContext;
use crate::error::DialogException;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Result of an application callback; an error aborts the dialog
pub type HandlerResult = anyhow::Result<()>;

/// Per-dialog application handler.
///
/// Callbacks for one dialog never run concurrently. `on_start` always comes
/// first; any callback that becomes due while it is running is delivered
/// after it returns. After `on_abort` nothing else is delivered.
pub trait DialogHandler: Send + Sync {
    /// Dialog created. `aborted` is set when the dialog died before start
    /// could be delivered.
    fn on_start(&self, ctx: &Arc<DialogContext>, aborted: bool) -> HandlerResult;

    /// A previously refused write may now be retried
    fn on_can_write(&self, _ctx: &Arc<DialogContext>) -> HandlerResult {
        Ok(())
    }

    /// A complete message is ready for `read`; `finished` marks the peer's
    /// final message
    fn on_can_read(&self, ctx: &Arc<DialogContext>, finished: bool) -> HandlerResult;

    /// Dialog aborted
    fn on_abort(&self, ctx: &Arc<DialogContext>, cause: &DialogException);
}

/// Creates handlers for remotely started dialogs of one type
pub trait DialogHandlerFactory: Send + Sync {
    /// New handler instance
    fn create(&self) -> Arc<dyn DialogHandler>;
}

impl<F> DialogHandlerFactory for F
where
    F: Fn() -> Arc<dyn DialogHandler> + Send + Sync,
{
    fn create(&self) -> Arc<dyn DialogHandler> {
        self()
    }
}

/// Registered factories by dialog type number
#[derive(Clone, Default)]
pub struct DialogHandlerFactories {
    factories: HashMap<i32, Arc<dyn DialogHandlerFactory>>,
}

impl DialogHandlerFactories {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` for `type_no`, replacing any previous one
    pub fn register(&mut self, type_no: i32, factory: Arc<dyn DialogHandlerFactory>) -> &mut Self {
        self.factories.insert(type_no, factory);
        self
    }

    /// Builder form of [`register`](Self::register)
    pub fn with<F>(mut self, type_no: i32, factory: F) -> Self
    where
        F: DialogHandlerFactory + 'static,
    {
        self.factories.insert(type_no, Arc::new(factory));
        self
    }

    /// Factory for `type_no`
    pub fn get(&self, type_no: i32) -> Option<&Arc<dyn DialogHandlerFactory>> {
        self.factories.get(&type_no)
    }

    /// Number of registered types
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Whether no type is registered
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl fmt::Debug for DialogHandlerFactories {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.factories.keys().copied().collect();
        types.sort_unstable();
        f.debug_struct("DialogHandlerFactories")
            .field("types", &types)
            .finish()
    }
}
