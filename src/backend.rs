// Collaborator contracts consumed by the engine. The transport, the
// authentication handshake and any anti-automation challenge live behind
// these traits; the engine only ever sees their classified outcomes.

use async_trait::async_trait;
use thiserror::Error;

use crate::constraints::{DateWindow, LocationQuery};
use crate::model::{ConfirmedBooking, Recipient, Site, Slot};

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Authenticated session, owned exclusively by one run and threaded
/// through every collaborator call. Refreshed in place on expiry.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub token: String,
}

impl SessionHandle {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

/// Fatal for the run. Second-factor and challenge failures inside the
/// handshake are collapsed into this type; the engine never sees them.
#[derive(Error, Debug, Clone)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("second-factor code was not accepted")]
    SecondFactorRejected,

    #[error("blocked by the service: {0}")]
    Blocked(String),

    #[error("network failure during authentication: {0}")]
    Network(String),
}

/// Fatal for one location query; fatal for the run only if no query
/// resolves any site.
#[derive(Error, Debug, Clone)]
pub enum ResolveError {
    #[error("no place matches query '{query}'")]
    UnknownPlace { query: String },

    #[error("transport failure resolving '{query}': {message}")]
    Transport { query: String, message: String },
}

/// Classified failure of one site-scoped collaborator call.
#[derive(Error, Debug, Clone)]
pub enum ScanError {
    /// Timeout, 5xx or anti-automation challenge. The site is retried
    /// on the next pass.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The session token is no longer valid; refresh and retry once.
    #[error("session expired")]
    SessionExpired,

    /// Site decommissioned or invalid reference. The site is dropped
    /// for the remainder of the run.
    #[error("site permanently unavailable: {0}")]
    Permanent(String),
}

/// What the service answered to one booking submission.
#[derive(Debug, Clone)]
pub enum SubmitReply {
    Confirmed { confirmation_code: Option<String> },
    /// Another client won the race for this slot.
    Gone,
    Refused(String),
    /// A second-factor code must accompany the submission.
    SecondFactorRequired,
}

/// The remote appointment service, as far as the engine is concerned.
#[async_trait]
pub trait BookingBackend: Send + Sync {
    async fn authenticate(&self, credentials: &Credentials) -> Result<SessionHandle, AuthError>;

    async fn refresh_session(&self, session: &mut SessionHandle) -> Result<(), AuthError>;

    async fn resolve_locations(&self, query: &LocationQuery) -> Result<Vec<Site>, ResolveError>;

    /// Fresh snapshot of open slots for one site within the window.
    /// Bounded-time; the engine additionally enforces its own timeout.
    async fn list_slots(
        &self,
        site: &Site,
        window: &DateWindow,
        session: &SessionHandle,
    ) -> Result<Vec<Slot>, ScanError>;

    async fn submit_booking(
        &self,
        slot: &Slot,
        recipient: &Recipient,
        session: &SessionHandle,
        second_factor: Option<&str>,
    ) -> Result<SubmitReply, ScanError>;

    async fn list_recipients(&self, session: &SessionHandle) -> Result<Vec<Recipient>, ScanError>;
}

/// Pluggable interactive prompts: second-factor codes and the optional
/// pre-submission confirmation.
#[async_trait]
pub trait UserPrompt: Send + Sync {
    /// None when no code can be obtained (e.g. no interactive terminal).
    async fn request_second_factor(&self) -> Option<String>;

    async fn request_confirmation(&self, slot: &Slot) -> bool;
}

/// Best-effort success notification; failures are ignored by the engine.
pub trait SuccessNotifier: Send + Sync {
    fn notify_success(&self, booking: &ConfirmedBooking, recipient: &Recipient);
}

/// Notifier that does nothing.
pub struct NullNotifier;

impl SuccessNotifier for NullNotifier {
    fn notify_success(&self, _booking: &ConfirmedBooking, _recipient: &Recipient) {}
}
