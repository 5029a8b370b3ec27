// src/jobs/error_codes.rs
use crate::jobs::model::ErrorClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Timeout,
    ConnectionRefused,
    RateLimit,
    UpstreamUnavailable,
    DependencyDown,
    Conflict,
    BadPayload,
    Rejected,
    UnknownCategory,
    EntityNotFound,
    Panic,
    Cancelled,
    Stuck,
    Unknown,
}

impl ErrorCode {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_uppercase().as_str() {
            "TIMEOUT" => Self::Timeout,
            "CONNECTION_REFUSED" => Self::ConnectionRefused,
            "RATE_LIMIT" => Self::RateLimit,
            "UPSTREAM_UNAVAILABLE" => Self::UpstreamUnavailable,
            "DEPENDENCY_DOWN" => Self::DependencyDown,
            "CONFLICT" => Self::Conflict,
            "BAD_PAYLOAD" => Self::BadPayload,
            "REJECTED" => Self::Rejected,
            "UNKNOWN_CATEGORY" => Self::UnknownCategory,
            "ENTITY_NOT_FOUND" => Self::EntityNotFound,
            "PANIC" => Self::Panic,
            "CANCELLED" => Self::Cancelled,
            "STUCK" => Self::Stuck,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "TIMEOUT",
            Self::ConnectionRefused => "CONNECTION_REFUSED",
            Self::RateLimit => "RATE_LIMIT",
            Self::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            Self::DependencyDown => "DEPENDENCY_DOWN",
            Self::Conflict => "CONFLICT",
            Self::BadPayload => "BAD_PAYLOAD",
            Self::Rejected => "REJECTED",
            Self::UnknownCategory => "UNKNOWN_CATEGORY",
            Self::EntityNotFound => "ENTITY_NOT_FOUND",
            Self::Panic => "PANIC",
            Self::Cancelled => "CANCELLED",
            Self::Stuck => "STUCK",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Codes handlers return directly. `Unknown` is not listed: an unmapped
    /// code falls back to matching the message text.
    pub fn known_class(&self) -> Option<ErrorClass> {
        match self {
            Self::Timeout
            | Self::ConnectionRefused
            | Self::RateLimit
            | Self::UpstreamUnavailable
            | Self::DependencyDown
            | Self::Conflict => Some(ErrorClass::Retryable),
            Self::BadPayload
            | Self::Rejected
            | Self::UnknownCategory
            | Self::EntityNotFound
            | Self::Panic => Some(ErrorClass::Permanent),
            Self::Cancelled => Some(ErrorClass::Cancelled),
            Self::Stuck => Some(ErrorClass::Stuck),
            Self::Unknown => None,
        }
    }
}

pub fn suggested_action(code: &str) -> &'static str {
    match ErrorCode::parse(code) {
        ErrorCode::Timeout => {
            "Retry is automatic. Check downstream latency or raise the handler timeout."
        }
        ErrorCode::ConnectionRefused => {
            "Retry is automatic. Check that the downstream service is up and reachable."
        }
        ErrorCode::RateLimit => {
            "Back off. Lower worker concurrency or raise the downstream quota."
        }
        ErrorCode::UpstreamUnavailable => {
            "Retry is automatic. Downstream answered 5xx; check its health dashboard."
        }
        ErrorCode::DependencyDown => {
            "Retry later. Circuit breaker is open; wait for the dependency to recover."
        }
        ErrorCode::Conflict => {
            "Retry is automatic. Another process wrote the same subject concurrently."
        }
        ErrorCode::BadPayload => {
            "Non-retryable. Fix the producer, then re-enqueue or retry the job."
        }
        ErrorCode::Rejected => {
            "Non-retryable. Downstream rejected the request as invalid; inspect the payload."
        }
        ErrorCode::UnknownCategory => {
            "No handler is registered for this category on any running worker."
        }
        ErrorCode::EntityNotFound => {
            "The subject record was deleted. Cancel or delete the job."
        }
        ErrorCode::Panic => {
            "Handler panicked. Capture the panic message from logs and fix the handler."
        }
        ErrorCode::Cancelled => "Cancelled by an operator. Retry it if the cancel was a mistake.",
        ErrorCode::Stuck => {
            "A worker claimed the job and never reported back. Check for crashed or wedged workers."
        }
        ErrorCode::Unknown => {
            "Inspect the error message and logs. Add a code mapping once understood."
        }
    }
}
