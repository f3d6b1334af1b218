//! The hook fired when a credential cannot be refreshed automatically

use std::{
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use async_trait::async_trait;

use crate::TokenManager;

/// A handler that may log the user back in when a refresh fails
///
/// The handler can take as long as it needs, for example while waiting on the
/// user to complete a login prompt; every caller of
/// [`TokenManager::get_token()`] waits on the same refresh in the meantime.
///
/// Return `Some(true)` if a login was performed and the refresh should be
/// treated as recovered. `Some(false)` and `None` both decline.
#[async_trait]
pub trait NeedLoginHandler: Send + Sync {
    /// Attempts to recover the session after a failed refresh
    async fn need_login(&self, manager: &TokenManager) -> Option<bool>;
}

#[async_trait]
impl<F, Fut> NeedLoginHandler for F
where
    F: Fn(TokenManager) -> Fut + Send + Sync,
    Fut: Future<Output = Option<bool>> + Send + 'static,
{
    async fn need_login(&self, manager: &TokenManager) -> Option<bool> {
        (self)(manager.clone()).await
    }
}

/// Identifies a registered handler so that it can be removed again
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// An ordered set of [`NeedLoginHandler`]s
#[derive(Default)]
pub struct NeedLoginEvent {
    handlers: Mutex<Vec<(HandlerId, Arc<dyn NeedLoginHandler>)>>,
    next_id: AtomicU64,
}

impl fmt::Debug for NeedLoginEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let ids: Vec<HandlerId> = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, _)| *id)
            .collect();

        f.debug_struct("NeedLoginEvent")
            .field("handlers", &ids)
            .finish()
    }
}

impl NeedLoginEvent {
    /// Registers a handler after all previously registered handlers
    pub fn add(&self, handler: impl NeedLoginHandler + 'static) -> HandlerId {
        self.add_arc(Arc::new(handler))
    }

    /// Registers a shared handler after all previously registered handlers
    pub fn add_arc(&self, handler: Arc<dyn NeedLoginHandler>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, handler));
        id
    }

    /// Unregisters a handler, returning whether it was registered
    pub fn remove(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = handlers.len();
        handlers.retain(|(h, _)| *h != id);
        handlers.len() != before
    }

    /// The number of registered handlers
    pub fn len(&self) -> usize {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no handlers are registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs every handler in registration order
    ///
    /// All handlers run, even after one has reported success. The outcome is
    /// the first handler result that is `Some(true)`.
    pub(crate) async fn fire(&self, manager: &TokenManager) -> bool {
        let handlers: Vec<Arc<dyn NeedLoginHandler>> = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();

        tracing::debug!(handlers = handlers.len(), "firing need-login handlers");

        let mut recovered = false;
        for handler in handlers {
            if handler.need_login(manager).await == Some(true) {
                recovered = true;
            }
        }

        recovered
    }
}
