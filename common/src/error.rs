use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MoneyError {
    #[error("Money overflow")]
    Overflow,

    #[error("Invalid money literal: {0}")]
    InvalidLiteral(String),

    #[error("Money scale exceeds 4 fractional digits: {0}")]
    ScaleExceeded(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Idempotency key must be 8-64 printable characters")]
    BadIdempotencyKey,

    #[error("Timebox must be between 1 and {max} seconds, got {got}")]
    BadTimebox { got: u32, max: u32 },

    #[error("Reservation amount must be positive")]
    ZeroReservation,
}
