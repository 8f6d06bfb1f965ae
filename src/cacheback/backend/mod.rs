mod connection;
mod failure;
mod queue;
mod state;

pub use self::connection::{Backend, ResetOutcome, WriteOutcome, VERSION_REQUEST};
pub use self::failure::BackendFailureKind;
pub use self::queue::{CompletionSink, Request, RequestQueue, RequestStatus, ResponseSlot};
pub use self::state::{BackendState, ParseState};
