pub(crate) mod clock;
pub(crate) mod error;
pub(crate) mod idempotency;
pub(crate) mod retry;
pub(crate) mod text;
