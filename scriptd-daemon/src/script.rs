//! Script parsing: the annotation mini-language embedded in leading comments,
//! and the templated body.
//!
//! A script is a regular bash script whose body is a `minijinja` template.
//! Its leading `#` comment block may declare a description, typed parameters,
//! and output variables:
//!
//! ```text
//! # @desc <text>
//! # @param <pname> (int|float|string|bool|unsafe) `<default>` <pdesc>
//! # @output <vname> (a|w)
//! ```
//!
//! `string` params are shell-escaped before substitution, `unsafe` params are
//! substituted raw. Output variables are written from inside the script
//! through dedicated file descriptors; the parser emits a preamble binding
//! `_clear`, `_timeout`, and each output name to its descriptor number so the
//! body can `echo value >&$name`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::Utc;
use minijinja::{AutoEscape, Environment};
use regex::Regex;
use serde::Serialize;

use crate::errors::{DaemonError, Result};
use crate::escape::escape_shell_arg;
use scriptd_protocol::RequestError;

/// Descriptor numbers bound by the emitted preamble. Outputs start above the
/// two reserved control channels.
pub const CLEAR_FD: i32 = 3;
pub const TIMEOUT_FD: i32 = 4;
pub const OUTPUT_FD_BASE: i32 = 5;

const TEMPLATE_NAME: &str = "body";

static DESC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#\s+@desc\s*(.*)$").unwrap());
static PARAM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^#\s+@param\s+(\S+)\s+(int|float|string|bool|unsafe)\s+`([^`]*)`\s+(.*)$")
        .unwrap()
});
static OUTPUT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#\s+@output\s+(\S+)\s+(a|w)$").unwrap());

/// Declared type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Int,
    Float,
    String,
    Bool,
    Unsafe,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Float => "float",
            Self::String => "string",
            Self::Bool => "bool",
            Self::Unsafe => "unsafe",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token {
            "int" => Some(Self::Int),
            "float" => Some(Self::Float),
            "string" => Some(Self::String),
            "bool" => Some(Self::Bool),
            "unsafe" => Some(Self::Unsafe),
            _ => None,
        }
    }
}

/// Retention policy of an output variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// `a`: raw writes concatenate, newlines preserved.
    Append,
    /// `w`: the buffer is replaced with the last trimmed line.
    Overwrite,
}

impl OutputMode {
    fn from_token(token: &str) -> Option<Self> {
        match token {
            "a" => Some(Self::Append),
            "w" => Some(Self::Overwrite),
            _ => None,
        }
    }
}

/// A typed parameter value after normalization.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Str(v) => f.write_str(v),
        }
    }
}

/// One `@param` declaration.
#[derive(Debug, Clone)]
pub struct ParamDef {
    pub name: String,
    pub ty: ParamType,
    pub default_str: String,
    pub default: ParamValue,
    pub desc: String,
}

impl ParamDef {
    /// Normalize a raw string into this parameter's typed value.
    pub fn to_value(&self, input: &str) -> std::result::Result<ParamValue, RequestError> {
        normalize_value(&self.name, self.ty, input)
    }
}

/// Normalize a raw string into a typed value.
///
/// `int` and `float` JSON-decode as numbers (`int` truncates); `bool`
/// JSON-decodes as a boolean; `string` and `unsafe` are wrapped in double
/// quotes when not already quoted and JSON-decoded as strings, after which
/// `string` values are shell-escaped and `unsafe` values pass through
/// untouched.
fn normalize_value(
    name: &str,
    ty: ParamType,
    input: &str,
) -> std::result::Result<ParamValue, RequestError> {
    let parse_err = |shown: &str| RequestError::ParamParse {
        name: name.to_string(),
        ty: ty.as_str().to_string(),
        value: shown.to_string(),
    };
    match ty {
        ParamType::Int => serde_json::from_str::<f64>(input)
            .map(|v| ParamValue::Int(v as i64))
            .map_err(|_| parse_err(input)),
        ParamType::Float => serde_json::from_str::<f64>(input)
            .map(ParamValue::Float)
            .map_err(|_| parse_err(input)),
        ParamType::Bool => serde_json::from_str::<bool>(input)
            .map(ParamValue::Bool)
            .map_err(|_| parse_err(input)),
        ParamType::String | ParamType::Unsafe => {
            let wrapped;
            let quoted = if input.starts_with('"') {
                input
            } else {
                wrapped = format!("\"{input}\"");
                &wrapped
            };
            let decoded: String = serde_json::from_str(quoted).map_err(|_| parse_err(quoted))?;
            Ok(if ty == ParamType::String {
                ParamValue::Str(escape_shell_arg(&decoded))
            } else {
                ParamValue::Str(decoded)
            })
        }
    }
}

/// One `@output` declaration.
#[derive(Debug, Clone)]
pub struct OutputDef {
    pub name: String,
    pub mode: OutputMode,
}

/// A parsed, validated, compiled view of a script file. Immutable after
/// parse; a catalog reload replaces the whole `Script`, never mutates it.
pub struct Script {
    pub name: String,
    pub path: PathBuf,
    /// Every matched annotation line, verbatim.
    pub help: String,
    /// Concatenated `@desc` texts.
    pub desc: String,
    pub param_defs: Vec<ParamDef>,
    pub output_defs: Vec<OutputDef>,
    /// Epoch seconds at which the script was parsed.
    pub parsed_ts: i64,
    /// Owns the single compiled body template.
    template: Environment<'static>,
}

impl std::fmt::Debug for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Script")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("param_defs", &self.param_defs)
            .field("output_defs", &self.output_defs)
            .field("parsed_ts", &self.parsed_ts)
            .finish()
    }
}

impl Script {
    /// Parse `source` into a `Script`.
    ///
    /// Annotation matching is confined to the leading `#` comment block. At
    /// the transition to the body, the descriptor-binding preamble is
    /// inserted ahead of the first non-comment line; everything after is
    /// copied verbatim, then the whole buffer is compiled as a template.
    pub fn parse(script_path: &Path, source: &str) -> Result<Self> {
        let name = script_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut help = String::new();
        let mut desc = String::new();
        let mut param_defs: Vec<ParamDef> = Vec::new();
        let mut output_defs: Vec<OutputDef> = Vec::new();
        let mut template_src = String::new();
        let mut in_body = false;

        for line in source.split_inclusive('\n') {
            if !in_body && !line.starts_with('#') {
                // End of leading comments: bind _clear, _timeout, and the
                // output var descriptors before the body starts.
                template_src.push_str(&format!("_clear={CLEAR_FD}\n_timeout={TIMEOUT_FD}\n"));
                for (idx, output) in output_defs.iter().enumerate() {
                    template_src.push_str(&format!(
                        "{}={}\n",
                        output.name,
                        OUTPUT_FD_BASE + idx as i32
                    ));
                }
                in_body = true;
            }
            template_src.push_str(line);
            if in_body {
                continue;
            }

            let trimmed = line.trim_end_matches(['\n', '\r']);
            if let Some(caps) = DESC_RE.captures(trimmed) {
                desc.push_str(caps[1].trim());
            } else if let Some(caps) = PARAM_RE.captures(trimmed) {
                let param_name = caps[1].to_string();
                let ty = ParamType::from_token(&caps[2]).unwrap_or(ParamType::String);
                let default_str = caps[3].to_string();
                let default = normalize_value(&param_name, ty, &default_str).map_err(
                    |source| DaemonError::BadDefault {
                        script: name.clone(),
                        param: param_name.clone(),
                        source,
                    },
                )?;
                param_defs.push(ParamDef {
                    name: param_name,
                    ty,
                    default_str,
                    default,
                    desc: caps[4].to_string(),
                });
            } else if let Some(caps) = OUTPUT_RE.captures(trimmed) {
                output_defs.push(OutputDef {
                    name: caps[1].to_string(),
                    mode: OutputMode::from_token(&caps[2])
                        .unwrap_or(OutputMode::Append),
                });
            } else {
                continue;
            }
            help.push_str(line);
        }

        let mut env = Environment::new();
        env.set_auto_escape_callback(|_| AutoEscape::None);
        env.add_template_owned(TEMPLATE_NAME, template_src)
            .map_err(|source| DaemonError::TemplateCompile {
                script: name.clone(),
                source,
            })?;

        Ok(Self {
            name,
            path: script_path.to_path_buf(),
            help,
            desc,
            param_defs,
            output_defs,
            parsed_ts: Utc::now().timestamp(),
            template: env,
        })
    }

    /// Render the body template with a typed parameter map, producing the
    /// concrete bash script of a run.
    pub fn render(&self, params: &BTreeMap<String, ParamValue>) -> Result<String> {
        let render = || -> std::result::Result<String, minijinja::Error> {
            self.template.get_template(TEMPLATE_NAME)?.render(params)
        };
        render().map_err(|source| DaemonError::TemplateRender {
            script: self.name.clone(),
            source,
        })
    }

    /// Normalize raw request params into typed values, in declaration order.
    /// Missing params take their precomputed defaults; unknown keys are
    /// ignored.
    pub fn normalize_params(
        &self,
        raw: &HashMap<String, String>,
    ) -> std::result::Result<BTreeMap<String, ParamValue>, RequestError> {
        let mut out = BTreeMap::new();
        for def in &self.param_defs {
            let value = match raw.get(&def.name) {
                Some(input) => def.to_value(input)?,
                None => def.default.clone(),
            };
            out.insert(def.name.clone(), value);
        }
        Ok(out)
    }

    /// Index of the output named `name`, if declared.
    pub fn output_idx_by_name(&self, name: &str) -> Option<usize> {
        self.output_defs.iter().position(|def| def.name == name)
    }
}
