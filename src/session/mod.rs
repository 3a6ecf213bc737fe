//! Client sessions, cancellation and reconnect continuity.

pub mod cancel;
pub mod controller;

pub use cancel::CancelToken;
pub use controller::{
    ClientId, ClientSession, InFlight, ProgressEntry, ReconnectOutcome, SessionController,
    SessionStatus, DEFAULT_PROGRESS_REPLAY,
};
