use thiserror::Error;

/// Stable status codes reported across the API boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReturnCode {
    Ok,
    NotRegistered,
    InvalidArg,
    CapacityExceeded,
    RoutingMismatch,
    NoSubscribers,
    Timeout,
    Shutdown,
    PeerGone,
    ChannelInitFailed,
}

impl ReturnCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReturnCode::Ok => "ok",
            ReturnCode::NotRegistered => "not-registered",
            ReturnCode::InvalidArg => "invalid-arg",
            ReturnCode::CapacityExceeded => "capacity-exceeded",
            ReturnCode::RoutingMismatch => "routing-mismatch",
            ReturnCode::NoSubscribers => "no-subscribers",
            ReturnCode::Timeout => "timeout",
            ReturnCode::Shutdown => "shutdown",
            ReturnCode::PeerGone => "peer-gone",
            ReturnCode::ChannelInitFailed => "channel-init-failed",
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("not registered")]
    NotRegistered,
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(&'static str),
    #[error("routing mode mismatch")]
    RoutingMismatch,
    #[error("no subscribers")]
    NoSubscribers,
    #[error("timed out")]
    Timeout,
    #[error("shutdown in progress")]
    Shutdown,
    #[error("peer gone")]
    PeerGone,
    #[error("channel init failed: {0}")]
    ChannelInitFailed(&'static str),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt region: {0}")]
    Corrupt(&'static str),
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u32),
    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    /// Maps the error onto its wire-level return code.
    ///
    /// Infrastructure failures (`Io`, `Corrupt`, ...) have no dedicated code and
    /// report as `ChannelInitFailed`, the only code covering transport setup.
    pub fn code(&self) -> ReturnCode {
        match self {
            Error::NotRegistered => ReturnCode::NotRegistered,
            Error::InvalidArg(_) => ReturnCode::InvalidArg,
            Error::CapacityExceeded(_) => ReturnCode::CapacityExceeded,
            Error::RoutingMismatch => ReturnCode::RoutingMismatch,
            Error::NoSubscribers => ReturnCode::NoSubscribers,
            Error::Timeout => ReturnCode::Timeout,
            Error::Shutdown => ReturnCode::Shutdown,
            Error::PeerGone => ReturnCode::PeerGone,
            Error::ChannelInitFailed(_)
            | Error::Io(_)
            | Error::Corrupt(_)
            | Error::UnsupportedVersion(_)
            | Error::Config(_) => ReturnCode::ChannelInitFailed,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_render_as_kebab_case() {
        assert_eq!(Error::RoutingMismatch.code().as_str(), "routing-mismatch");
        assert_eq!(
            Error::CapacityExceeded("subscriber table full").code(),
            ReturnCode::CapacityExceeded
        );
        assert_eq!(ReturnCode::Ok.as_str(), "ok");
    }

    #[test]
    fn io_errors_convert() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("boom"));
    }
}
