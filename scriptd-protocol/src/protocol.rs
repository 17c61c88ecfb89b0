use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// Which adapter produced a request.
///
/// An opaque capability: it only names the transport so response shaping can
/// differ per adapter; it owns nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportKind {
    Json,
    Textproto,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Textproto => "textproto",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single inbound command: a script (or built-in) name plus raw string
/// parameters, as assembled by a transport adapter.
#[derive(Debug, Clone)]
pub struct Request {
    pub script_name: String,
    pub params: HashMap<String, String>,
    /// Epoch seconds at which the adapter accepted the request.
    pub ts: i64,
    pub remote_addr: String,
    pub transport: TransportKind,
}

impl Request {
    /// Convenience lookup returning `""` for absent params, matching the
    /// built-in commands' treatment of optional ids.
    pub fn param(&self, name: &str) -> &str {
        self.params.get(name).map(String::as_str).unwrap_or("")
    }
}

/// Client-visible request failures. Display strings are part of the wire
/// contract; clients grep for them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("Script or command does not exist")]
    UnknownScript,

    #[error("Unable to parse `{value}` as {name} ({ty})")]
    ParamParse {
        name: String,
        ty: String,
        value: String,
    },

    #[error("ScriptRun with id {0} does not exist")]
    RunNotFound(String),

    #[error("{0}")]
    Other(String),
}

/// Outcome of handling a [`Request`].
///
/// JSON serialization emits `status_code`, `body`, `error_str`, and
/// `run_statii`; the structured `error` is for in-process inspection only.
#[derive(Debug, Clone, Serialize, Default)]
pub struct Response {
    pub status_code: u16,
    pub body: String,
    #[serde(skip)]
    pub error: Option<RequestError>,
    pub error_str: String,
    pub run_statii: Vec<RunStatus>,
}

impl Response {
    pub fn with_body(status_code: u16, body: impl Into<String>) -> Self {
        Self {
            status_code,
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_statii(status_code: u16, run_statii: Vec<RunStatus>) -> Self {
        Self {
            status_code,
            run_statii,
            ..Default::default()
        }
    }

    pub fn err(status_code: u16, error: RequestError) -> Self {
        Self {
            status_code,
            error_str: error.to_string(),
            error: Some(error),
            ..Default::default()
        }
    }

    /// The text protocol replies `ERR` instead of `OK` under this predicate.
    pub fn is_err(&self) -> bool {
        self.error.is_some() || self.status_code >= 400
    }
}

/// Point-in-time snapshot of a single run, safe to hand across the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunStatus {
    pub script_name: String,
    pub id: String,
    /// `parsed_ts` of the script the run was created from.
    pub script_ts: i64,
    pub params: BTreeMap<String, String>,
    pub outputs: BTreeMap<String, String>,
    pub timeout_set_ts: i64,
    pub start_ts: i64,
    pub finish_ts: i64,
    pub finished: bool,
    pub exit_code: i32,
}

impl std::fmt::Display for RunStatus {
    /// The line-oriented text form: every line is prefixed with the run id so
    /// concatenated snapshots from a `status` listing stay attributable.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{} name {}", self.id, self.script_name)?;
        writeln!(f, "{} id {}", self.id, self.id)?;
        for (key, val) in &self.params {
            writeln!(f, "{} param {} {}", self.id, key, val)?;
        }
        for (key, val) in &self.outputs {
            writeln!(f, "{} output {} {}", self.id, key, val)?;
        }
        writeln!(f, "{} timeout_set_ts {}", self.id, self.timeout_set_ts)?;
        writeln!(f, "{} start_ts {}", self.id, self.start_ts)?;
        writeln!(f, "{} finish_ts {}", self.id, self.finish_ts)?;
        writeln!(f, "{} finished {}", self.id, self.finished)?;
        writeln!(f, "{} exit_code {}", self.id, self.exit_code)
    }
}

#[cfg(test)]
mod tests;
