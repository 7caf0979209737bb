//! Provider abstraction for live agent execution.
//!
//! The [`Provider`] trait decouples the harness from the actual LLM backend.
//! Wire clients (HTTP, SDKs) live outside the kernel; they implement this
//! trait and classify their failures into [`ProviderFault`]s. Tests use
//! scripted providers that return predetermined bytes without any network.

use std::time::Duration;

use thiserror::Error;

use crate::core::types::ErrorKind;

/// A single completion request, treated as opaque by the kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRequest {
    pub system: Option<String>,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f64,
    /// Hint for strict JSON output, when the backend supports it.
    pub response_format: Option<String>,
    /// Maximum time the backend may spend before giving up.
    pub timeout: Duration,
}

/// Raw provider output; the harness parses and validates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderResponse {
    pub body: Vec<u8>,
}

/// Failure classification a backend must perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderFault {
    /// Rate limit, gateway error, connection error. Retried.
    Transient,
    /// Client-side rejection (bad request, auth). Not retried.
    Permanent,
    /// The configured timeout elapsed. Not retried.
    Timeout,
}

#[derive(Debug, Clone, Error)]
#[error("provider error ({fault:?}): {message}")]
pub struct ProviderError {
    pub fault: ProviderFault,
    pub message: String,
}

impl ProviderError {
    pub fn new(fault: ProviderFault, message: impl Into<String>) -> Self {
        Self {
            fault,
            message: message.into(),
        }
    }

    /// The error kind a non-retried failure of this fault maps to.
    pub fn terminal_kind(&self) -> ErrorKind {
        match self.fault {
            ProviderFault::Transient => ErrorKind::ProviderTransientExhausted,
            ProviderFault::Permanent => ErrorKind::ProviderPermanent,
            ProviderFault::Timeout => ErrorKind::ProviderTimeout,
        }
    }
}

/// Abstraction over LLM completion backends.
pub trait Provider {
    /// Complete the request, returning raw response bytes.
    fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError>;
}

/// Classify an HTTP status for backends built on HTTP transports.
///
/// 429 and 5xx are transient; every other 4xx is permanent.
pub fn fault_for_status(status: u16) -> ProviderFault {
    match status {
        429 => ProviderFault::Transient,
        500..=599 => ProviderFault::Transient,
        _ => ProviderFault::Permanent,
    }
}
