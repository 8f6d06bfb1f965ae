use strum::{AsRefStr, Display};

/// Stable failure-kind strings for observability. The `strum`
/// derive gives each variant its exact lowercase wire form via `AsRef<str>`
/// and `Display`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, Display)]
#[strum(serialize_all = "snake_case")]
pub enum BackendFailureKind {
    Timeout,
    Disconnected,
    Connecting,
    #[strum(serialize = "readvalidate")]
    ReadValidate,
    #[strum(serialize = "badvalidate")]
    BadValidate,
    Writing,
    Reading,
    Parsing,
    #[strum(serialize = "closedsock")]
    ClosedSock,
    #[strum(serialize = "unhandledres")]
    UnhandledRes,
    #[strum(serialize = "outofmemory")]
    OutOfMemory,
    #[strum(serialize = "missingend")]
    MissingEnd,
    #[strum(serialize = "trailingdata")]
    TrailingData,
}
