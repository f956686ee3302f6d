//! The `utils` module provides definitions shared across the `unibroker` crate:
//! the common error type and the logging bootstrap.

pub mod error;
pub mod logging;

pub use error::{BrokerError, HandlerError, Result};
