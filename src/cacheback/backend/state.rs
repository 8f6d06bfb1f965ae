/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Disconnected,
    Connecting,
    Validating,
    Ready,
    /// Exceeded `backend_failure_limit` consecutive failures; requests fail
    /// fast until the retry timer reconnects successfully.
    Bad,
}

/// Response parser states. A vestigial extra state before the header is
/// fully buffered is collapsed into `Parse` here, since `Parse` already
/// handles "not enough bytes yet" for the first byte the same way it does
/// for any other byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    Parse,
    ReadEnd,
    WantRead,
    Next,
}
