//! Authentication lifecycle events.
//!
//! The client never navigates on its own. When a session can't be renewed it
//! broadcasts [`AuthEvent::SessionExpired`], and an application-level observer
//! such as [`LoginRedirect`] decides what the user sees.

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Capacity of the auth event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Events emitted by the API client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    /// The session was renewed; parked requests are being replayed.
    Refreshed,
    /// The session could not be renewed. The user has to sign in again.
    SessionExpired { login_route: String },
}

/// Something that can send the user to another route.
pub trait Navigator: Send + Sync {
    /// Route currently shown, if known.
    fn current_route(&self) -> Option<String>;

    /// Full redirect to `route`.
    fn redirect(&self, route: &str);
}

/// Sends the user to the login route when their session expires.
#[derive(Debug)]
pub struct LoginRedirect<N> {
    navigator: N,
}

impl<N: Navigator> LoginRedirect<N> {
    pub fn new(navigator: N) -> Self {
        Self { navigator }
    }

    pub fn navigator(&self) -> &N {
        &self.navigator
    }

    /// React to a single event. Returns `true` if a redirect was issued.
    pub fn handle(&self, event: &AuthEvent) -> bool {
        let AuthEvent::SessionExpired { login_route } = event else {
            return false;
        };

        if self.navigator.current_route().as_deref() == Some(login_route.as_str()) {
            tracing::debug!("Session expired while already on {}", login_route);
            return false;
        }

        tracing::info!("Session expired, redirecting to {}", login_route);
        self.navigator.redirect(login_route);
        true
    }

    /// Handle events until the channel closes.
    pub fn spawn(self, mut events: broadcast::Receiver<AuthEvent>) -> JoinHandle<()>
    where
        N: 'static,
    {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        self.handle(&event);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Auth event observer lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
