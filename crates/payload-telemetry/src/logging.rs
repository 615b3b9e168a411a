//! Structured log helpers.
//!
//! Every payload log line carries a `payload` field holding the entry hash so
//! lines for one key can be grepped or filtered together.

/// Log an event for a payload entry with standard fields.
#[macro_export]
macro_rules! log_payload_event {
    ($level:ident, $hash:expr, $msg:expr $(, $($field:tt)*)?) => {
        tracing::$level!(
            payload = %$hash,
            $($($field)*,)?
            $msg
        )
    };
}

/// Log an approval-flow transition with standard fields.
#[macro_export]
macro_rules! log_approval_event {
    ($level:ident, $hash:expr, $msg:expr, $from:expr, $to:expr $(, $($field:tt)*)?) => {
        tracing::$level!(
            payload = %$hash,
            from = ?$from,
            to = ?$to,
            $($($field)*,)?
            $msg
        )
    };
}
