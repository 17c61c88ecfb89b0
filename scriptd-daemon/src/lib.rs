//! scriptd: a daemon exposing a curated directory of annotated bash scripts
//! as network-callable commands.
//!
//! A client submits a script name and parameters; the daemon validates and
//! type-coerces them against the declaration block embedded in the script's
//! leading comments, renders the body through a template engine, runs it in
//! its own process group, and streams outputs back through a multi-descriptor
//! pipe protocol while enforcing a script-adjustable timeout.

pub mod config;
pub mod errors;
pub mod escape;
pub mod http;
pub mod run;
pub mod script;
pub mod server;
pub mod textproto;
