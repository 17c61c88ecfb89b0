use std::path::PathBuf;

/// Daemon configuration, assembled from the command line at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory of annotated scripts; also becomes the working directory.
    pub script_dir: PathBuf,
    /// Listen address for the JSON-over-HTTP transport; empty disables it.
    pub json_addr: String,
    /// Listen address for the textproto transport; empty disables it.
    pub textproto_addr: String,
    /// Info log destination; `None` writes to stdout.
    pub info_log_path: Option<PathBuf>,
    /// Error log destination; `None` writes to stderr.
    pub err_log_path: Option<PathBuf>,
}

/// Accept the `:port` shorthand for all-interfaces listen addresses.
pub fn normalize_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

#[cfg(test)]
mod tests;
