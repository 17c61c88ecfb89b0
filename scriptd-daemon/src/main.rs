use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::filter::{filter_fn, EnvFilter};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use scriptd_daemon::config::Config;
use scriptd_daemon::server::Server;
use scriptd_daemon::{http, textproto};

/// scriptd - serve a directory of annotated bash scripts as commands
#[derive(Parser, Debug)]
#[command(name = "scriptd")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Bash script directory
    #[arg(short = 'd', long = "script-dir", default_value = "/etc/scriptd.d/")]
    script_dir: PathBuf,

    /// If not empty, listen for JSON requests at this address
    #[arg(short = 'j', long = "json-addr", default_value = ":4488")]
    json_addr: String,

    /// If not empty, listen for textproto requests at this address
    #[arg(short = 't', long = "textproto-addr", default_value = ":4489")]
    textproto_addr: String,

    /// If set, write the info log here instead of stdout
    #[arg(short = 'i', long = "info-log")]
    info_log: Option<PathBuf>,

    /// If set, write the error log here instead of stderr
    #[arg(short = 'e', long = "err-log")]
    err_log: Option<PathBuf>,

    /// Print version and exit
    #[arg(short = 'v', long = "print-version")]
    print_version: bool,
}

impl Cli {
    fn into_config(self) -> Config {
        Config {
            script_dir: self.script_dir,
            json_addr: self.json_addr,
            textproto_addr: self.textproto_addr,
            info_log_path: self.info_log,
            err_log_path: self.err_log,
        }
    }
}

/// Route WARN/ERROR to the error destination and everything else to the
/// info destination, mirroring the classic split info/error log pair.
fn init_logging(config: &Config) -> Result<()> {
    let info_writer = match &config.info_log_path {
        Some(path) => BoxMakeWriter::new(open_log(path)?),
        None => BoxMakeWriter::new(std::io::stdout),
    };
    let err_writer = match &config.err_log_path {
        Some(path) => BoxMakeWriter::new(open_log(path)?),
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let info_layer = tracing_subscriber::fmt::layer()
        .with_writer(info_writer)
        .with_filter(filter_fn(|meta| *meta.level() > Level::WARN));
    let err_layer = tracing_subscriber::fmt::layer()
        .with_writer(err_writer)
        .with_filter(filter_fn(|meta| *meta.level() <= Level::WARN));

    tracing_subscriber::registry()
        .with(
            EnvFilter::from_default_env().add_directive(Level::INFO.into()),
        )
        .with(info_layer)
        .with(err_layer)
        .init();
    Ok(())
}

fn open_log(path: &PathBuf) -> Result<Arc<std::fs::File>> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map(Arc::new)
        .with_context(|| format!("opening log file {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.print_version {
        println!("scriptd version={}", scriptd_daemon::server::VERSION);
        return Ok(());
    }

    let config = cli.into_config();
    init_logging(&config)?;

    std::env::set_current_dir(&config.script_dir).with_context(|| {
        format!("changing to script directory {}", config.script_dir.display())
    })?;

    info!("Starting scriptd in {}", config.script_dir.display());

    let server = Arc::new(Server::new("."));
    server.load_scripts();
    let _hup = server
        .spawn_hup_reload()
        .context("subscribing to SIGHUP")?;

    let mut listeners = Vec::new();
    if !config.json_addr.is_empty() {
        listeners.push(tokio::spawn(http::listen(
            config.json_addr.clone(),
            server.clone(),
        )));
    }
    if !config.textproto_addr.is_empty() {
        listeners.push(tokio::spawn(textproto::listen(
            config.textproto_addr.clone(),
            server.clone(),
        )));
    }

    if listeners.is_empty() {
        warn!("No transports enabled, exiting");
        return Ok(());
    }
    for listener in listeners {
        let _ = listener.await;
    }
    Ok(())
}
