mod errors;
mod bytes;
mod coarse_clock;

pub use self::errors::{Error, ErrorKind, Result};
pub use self::bytes::bytes_to_slice_mut;
pub use self::coarse_clock::update_coarse_monotonic_clock;
