// Opportunity acquisition and booking engine: scans a remote appointment
// service for openings matching a set of constraints and books the first
// qualifying one.

pub mod backend;
pub mod booking;
pub mod constraints;
pub mod engine;
pub mod logging;
pub mod model;
pub mod remote;
pub mod selector;
pub mod sites;

// Re-export key types for convenience
pub use backend::{
    AuthError, BookingBackend, Credentials, NullNotifier, ResolveError, ScanError, SessionHandle,
    SubmitReply, SuccessNotifier, UserPrompt,
};
pub use booking::BookingTransactor;
pub use constraints::{ConstraintError, ConstraintSet, DateWindow, LocationQuery};
pub use engine::{cancel_pair, CancelHandle, CancelToken, Engine, EngineConfig, RunError, RunOutcome};
pub use model::{
    BookingOutcome, ConfirmedBooking, GeoPoint, Recipient, ResourceKind, SequenceStage, Site, Slot,
};
pub use remote::RemoteBackend;
