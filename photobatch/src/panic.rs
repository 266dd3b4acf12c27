//! Panic payload helpers.
//!
//! Task bodies, operators and observers run under `catch_unwind`. The payload
//! of a caught panic is an opaque `Box<dyn Any>`; these helpers turn it into
//! something that fits in a log line or an error message.

use std::any::Any;

/// Extracts the message from a caught panic payload.
///
/// `panic!("literal")` yields a `&str`, formatted panics yield a `String`.
/// Anything else is reported generically.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
