//! Failure taxonomy for pipeline stages.
//!
//! Every failure leaving a stage is turned into a [`StageError`]: one of a
//! closed set of [`ErrorKind`]s plus a retryable verdict. Typed sources
//! (`std::io::Error`, `rusqlite::Error`, `reqwest::Error`) are inspected
//! first; anything else falls back to keyword matching on the rendered
//! error chain. A failure that is already a `StageError` passes through
//! untouched.

use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::io;
use strum::{Display, EnumString};
use thiserror::Error;

use crate::error::format_error_chain;

/// Boxed failure returned by stage engines and task handlers.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Closed set of failure kinds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    Network,
    ExternalApi,
    File,
    Parsing,
    Database,
    Unknown,
}

/// A classified failure: kind, retry verdict, message, and the original cause.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct StageError {
    pub kind: ErrorKind,
    pub retryable: bool,
    pub message: String,
    #[source]
    pub cause: Option<BoxError>,
}

impl StageError {
    pub fn retryable(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            retryable: true,
            message: message.into(),
            cause: None,
        }
    }

    pub fn non_retryable(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            retryable: false,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: impl Into<BoxError>) -> Self {
        self.cause = Some(cause.into());
        self
    }
}

/// Which external dependency a failure came from. Selects the keyword
/// rules used when the failure carries no typed source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDomain {
    ExternalApi,
    File,
    Database,
    Parsing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Verdict {
    kind: ErrorKind,
    retryable: bool,
    label: &'static str,
}

const fn retry(kind: ErrorKind, label: &'static str) -> Verdict {
    Verdict {
        kind,
        retryable: true,
        label,
    }
}

const fn fatal(kind: ErrorKind, label: &'static str) -> Verdict {
    Verdict {
        kind,
        retryable: false,
        label,
    }
}

/// Classify an arbitrary failure.
pub fn classify(error: BoxError, domain: Option<ErrorDomain>) -> StageError {
    let error = match error.downcast::<StageError>() {
        Ok(typed) => return *typed,
        Err(other) => other,
    };

    let chain = format_error_chain(error.as_ref());
    let verdict = classify_chain(error.as_ref(), &chain, domain);

    StageError {
        kind: verdict.kind,
        retryable: verdict.retryable,
        message: format!("{}: {}", verdict.label, chain),
        cause: Some(error),
    }
}

fn classify_chain(
    error: &(dyn StdError + 'static),
    chain: &str,
    domain: Option<ErrorDomain>,
) -> Verdict {
    let mut current: Option<&(dyn StdError + 'static)> = Some(error);
    while let Some(err) = current {
        if let Some(typed) = err.downcast_ref::<StageError>() {
            return Verdict {
                kind: typed.kind,
                retryable: typed.retryable,
                label: "Stage failure",
            };
        }
        if let Some(verdict) = err.downcast_ref::<io::Error>().and_then(classify_io) {
            return verdict;
        }
        if let Some(db_err) = err.downcast_ref::<rusqlite::Error>() {
            return classify_sqlite(db_err);
        }
        if let Some(http_err) = err.downcast_ref::<reqwest::Error>() {
            return classify_http(http_err);
        }
        current = err.source();
    }

    classify_message(chain, domain)
}

/// Only kinds with an unambiguous meaning get a verdict; `Other`,
/// `InvalidInput`, `Unsupported` and the rest are judged by their message.
fn classify_io(err: &io::Error) -> Option<Verdict> {
    use io::ErrorKind as Io;
    let verdict = match err.kind() {
        Io::NotFound => fatal(ErrorKind::File, "File not found"),
        Io::PermissionDenied => fatal(ErrorKind::File, "Permission denied"),
        Io::StorageFull => fatal(ErrorKind::Database, "Storage exhausted"),
        Io::InvalidData | Io::UnexpectedEof => fatal(ErrorKind::Parsing, "Corrupted document"),
        Io::OutOfMemory => retry(ErrorKind::Parsing, "Parser resources exhausted"),
        Io::Interrupted | Io::WouldBlock | Io::ResourceBusy => {
            retry(ErrorKind::File, "Transient I/O failure")
        }
        Io::TimedOut
        | Io::ConnectionRefused
        | Io::ConnectionReset
        | Io::ConnectionAborted
        | Io::NotConnected
        | Io::BrokenPipe => retry(ErrorKind::Network, "Network failure"),
        _ => return None,
    };
    Some(verdict)
}

fn classify_sqlite(err: &rusqlite::Error) -> Verdict {
    use rusqlite::ErrorCode;
    match err {
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                retry(ErrorKind::Database, "Storage busy")
            }
            ErrorCode::CannotOpen | ErrorCode::SystemIoFailure => {
                retry(ErrorKind::Database, "Storage connection failed")
            }
            ErrorCode::DiskFull | ErrorCode::TooBig => {
                fatal(ErrorKind::Database, "Storage exhausted")
            }
            _ => fatal(ErrorKind::Database, "Storage operation rejected"),
        },
        _ => fatal(ErrorKind::Database, "Storage operation rejected"),
    }
}

fn classify_http(err: &reqwest::Error) -> Verdict {
    if err.is_timeout() {
        return retry(ErrorKind::ExternalApi, "Request timed out");
    }
    if err.is_connect() {
        return retry(ErrorKind::Network, "Connection failed");
    }
    if let Some(status) = err.status() {
        return match status.as_u16() {
            429 => retry(ErrorKind::ExternalApi, "Rate limited"),
            401 | 403 => fatal(ErrorKind::ExternalApi, "Authentication failed"),
            400 | 404 | 413 | 422 => fatal(ErrorKind::ExternalApi, "Malformed request"),
            500..=599 => retry(ErrorKind::ExternalApi, "Upstream unavailable"),
            _ => fatal(ErrorKind::ExternalApi, "Unexpected response"),
        };
    }
    if err.is_decode() {
        return fatal(ErrorKind::ExternalApi, "Invalid response");
    }
    retry(ErrorKind::Network, "Network failure")
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

fn classify_message(chain: &str, domain: Option<ErrorDomain>) -> Verdict {
    let message = chain.to_lowercase();

    let inferred = infer_domain(&message);
    let domains = [domain, inferred.filter(|d| Some(*d) != domain)];
    for candidate in domains.into_iter().flatten() {
        if let Some(verdict) = domain_rules(candidate, &message) {
            return verdict;
        }
    }

    if contains_any(&message, &["rate limit", "quota", "too many requests"]) {
        return retry(ErrorKind::ExternalApi, "Rate limited");
    }
    if contains_any(&message, &["timeout", "timed out"]) {
        return retry(ErrorKind::Network, "Timed out");
    }
    if contains_any(&message, &["connection", "network", "unreachable"]) {
        return retry(ErrorKind::Network, "Network failure");
    }

    fatal(ErrorKind::Unknown, "Unclassified failure")
}

fn infer_domain(message: &str) -> Option<ErrorDomain> {
    if contains_any(message, &["api", "http", "ollama", "openai", "embedding"]) {
        Some(ErrorDomain::ExternalApi)
    } else if contains_any(message, &["file", "path"]) {
        Some(ErrorDomain::File)
    } else if contains_any(message, &["database", "sqlite", "vector store", "chroma"]) {
        Some(ErrorDomain::Database)
    } else if contains_any(message, &["parse", "parsing", "pdf", "document format"]) {
        Some(ErrorDomain::Parsing)
    } else {
        None
    }
}

fn domain_rules(domain: ErrorDomain, message: &str) -> Option<Verdict> {
    let verdict = match domain {
        ErrorDomain::ExternalApi => {
            if contains_any(message, &["rate limit", "quota", "too many requests"]) {
                retry(ErrorKind::ExternalApi, "Rate limited")
            } else if contains_any(message, &["timeout", "timed out"]) {
                retry(ErrorKind::ExternalApi, "Request timed out")
            } else if contains_any(message, &["connection", "network"]) {
                retry(ErrorKind::Network, "Network failure")
            } else if contains_any(
                message,
                &["unauthorized", "authentication", "forbidden", "api key"],
            ) {
                fatal(ErrorKind::ExternalApi, "Authentication failed")
            } else if contains_any(message, &["bad request", "invalid", "malformed"]) {
                fatal(ErrorKind::ExternalApi, "Malformed request")
            } else {
                return None;
            }
        }
        ErrorDomain::File => {
            if contains_any(message, &["not found", "no such file"]) {
                fatal(ErrorKind::File, "File not found")
            } else if contains_any(message, &["permission", "access denied"]) {
                fatal(ErrorKind::File, "Permission denied")
            } else if contains_any(message, &["i/o", "io error", "interrupted"]) {
                retry(ErrorKind::File, "Transient I/O failure")
            } else {
                return None;
            }
        }
        ErrorDomain::Database => {
            if contains_any(message, &["lock", "busy"]) {
                retry(ErrorKind::Database, "Storage busy")
            } else if contains_any(message, &["connection", "timeout", "timed out"]) {
                retry(ErrorKind::Database, "Storage connection failed")
            } else if contains_any(message, &["disk", "space", "full"]) {
                fatal(ErrorKind::Database, "Storage exhausted")
            } else {
                return None;
            }
        }
        ErrorDomain::Parsing => {
            if contains_any(message, &["corrupt", "damaged"]) {
                fatal(ErrorKind::Parsing, "Corrupted document")
            } else if contains_any(message, &["unsupported", "format"]) {
                fatal(ErrorKind::Parsing, "Unsupported document format")
            } else if contains_any(message, &["memory", "resource"]) {
                retry(ErrorKind::Parsing, "Parser resources exhausted")
            } else {
                return None;
            }
        }
    };
    Some(verdict)
}
