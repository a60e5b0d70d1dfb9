use embedded_io_async::ErrorKind;

/// Failure classes surfaced by every public operation.
///
/// Transport failures are reported to the immediate caller and never
/// retried inside the crate; retry count and backoff belong to the layer
/// that knows the protocol (module bring-up, application logic).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// No matching response or event arrived within the deadline.
    Timeout,
    /// The capability is not registered for this module variant.
    Unsupported,
    /// A response or event did not match the expected grammar, or the
    /// module reported failure for the exchange.
    Protocol,
    /// A pool slot, queue or buffer limit was hit.
    Exhausted,
    /// Caller-supplied parameter outside protocol-defined bounds, or an
    /// operation issued in a state that does not permit it.
    InvalidArgument,
    /// The underlying serial device failed.
    Device(ErrorKind),
}

impl Error {
    pub(crate) fn device<E: embedded_io_async::Error>(e: E) -> Self {
        Error::Device(e.kind())
    }
}

impl From<embassy_time::TimeoutError> for Error {
    fn from(_: embassy_time::TimeoutError) -> Self {
        Error::Timeout
    }
}
