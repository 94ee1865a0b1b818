//! Provider response code classification.
//!
//! This table is the only place response codes are interpreted.

/// What a provider response code means for the order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    /// `00`: fulfilled, serial number available
    Success,
    /// `201`: accepted, the provider will call back
    Pending,
    /// `40`–`45`: definitive rejection
    Failed,
    /// `06`, `07`, `08`, `17`, `39`: transient
    Retryable,
    /// Anything else; retried with a longer delay
    Unknown,
}

pub fn classify(rc: &str) -> ResponseClass {
    match rc {
        "00" => ResponseClass::Success,
        "201" => ResponseClass::Pending,
        "40" | "41" | "42" | "43" | "44" | "45" => ResponseClass::Failed,
        "06" | "07" | "08" | "17" | "39" => ResponseClass::Retryable,
        _ => ResponseClass::Unknown,
    }
}
