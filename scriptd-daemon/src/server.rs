//! The run registry and request dispatcher: holds the script catalog and the
//! history of runs, answers the built-in commands, and launches script runs.

use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use crate::errors::DaemonError;
use crate::run::ScriptRun;
use crate::script::Script;
use scriptd_protocol::{Request, RequestError, Response, RunStatus};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Owner of the script catalog and the run history.
///
/// The catalog is replaced wholesale on (re)load; in-flight runs keep their
/// `Arc<Script>` reference and complete safely against it. Runs are appended
/// on dispatch and removed only by `purge`.
pub struct Server {
    script_dir: PathBuf,
    scripts: RwLock<HashMap<String, Arc<Script>>>,
    script_runs: Mutex<Vec<Arc<ScriptRun>>>,
}

impl Server {
    pub fn new(script_dir: impl Into<PathBuf>) -> Self {
        Self {
            script_dir: script_dir.into(),
            scripts: RwLock::new(HashMap::new()),
            script_runs: Mutex::new(Vec::new()),
        }
    }

    /// (Re)load the catalog from the script directory, replacing it
    /// wholesale. Only regular files that are readable and executable by the
    /// owner and owned by the current user are considered; parse failures
    /// are logged and the script skipped.
    pub fn load_scripts(&self) {
        let entries = match std::fs::read_dir(&self.script_dir) {
            Ok(entries) => entries,
            Err(source) => {
                error!(
                    "{}",
                    DaemonError::ScriptDir {
                        path: self.script_dir.clone(),
                        source,
                    }
                );
                return;
            }
        };

        let mut catalog = HashMap::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !eligible_script(&path) {
                continue;
            }
            let source = match std::fs::read_to_string(&path) {
                Ok(source) => source,
                Err(source) => {
                    error!("{}", DaemonError::ScriptRead { path, source });
                    continue;
                }
            };
            match Script::parse(&path, &source) {
                Ok(script) => {
                    info!("Loaded script {}", script.name);
                    catalog.insert(script.name.clone(), Arc::new(script));
                }
                Err(err) => error!("Failed to parse script {:?}: {}", path, err),
            }
        }

        *self.scripts.write() = catalog;
    }

    /// Handle one request: answer a built-in command synchronously, or
    /// create a run, launch its supervisor asynchronously, and return the
    /// initial status snapshot.
    pub async fn handle(&self, req: Request) -> Response {
        match req.script_name.as_str() {
            "help" => Response::with_body(200, self.script_help()),
            "status" => match self.run_statii(req.param("id")) {
                Ok(statii) => Response::with_statii(200, statii),
                Err(err) => Response::err(400, err),
            },
            "view" => match self.bash_script(req.param("id")) {
                Ok(bash_script) => Response::with_body(200, bash_script),
                Err(err) => Response::err(400, err),
            },
            "kill" => match self.kill_run(req.param("id")) {
                Ok(()) => Response::with_body(
                    200,
                    format!("Sent kill to ScriptRun {}", req.param("id")),
                ),
                Err(err) => Response::err(400, err),
            },
            "version" => Response::with_body(200, VERSION),
            "purge" => Response::with_body(
                200,
                format!(
                    "Purged {} ScriptRuns from status history",
                    self.purge_runs(0)
                ),
            ),
            _ => self.dispatch_script(req).await,
        }
    }

    async fn dispatch_script(&self, req: Request) -> Response {
        let script = self.scripts.read().get(&req.script_name).cloned();
        let Some(script) = script else {
            return Response::err(404, RequestError::UnknownScript);
        };
        match self.make_script_run(script, req) {
            Ok(run) => {
                tokio::spawn(run.clone().supervise());
                Response::with_statii(200, vec![run.status()])
            }
            Err(err) => Response::err(400, err),
        }
    }

    /// Normalize params, render the body, and register a new run. The
    /// supervisor is not yet started.
    fn make_script_run(
        &self,
        script: Arc<Script>,
        req: Request,
    ) -> Result<Arc<ScriptRun>, RequestError> {
        let params = script.normalize_params(&req.params)?;
        let bash_script = script
            .render(&params)
            .map_err(|err| RequestError::Other(err.to_string()))?;
        let run = Arc::new(ScriptRun::new(
            Uuid::new_v4().to_string(),
            script,
            req,
            params,
            bash_script,
        ));
        self.script_runs.lock().push(run.clone());
        Ok(run)
    }

    /// Drop finished runs older than `max_age` seconds; returns how many
    /// were removed. Unfinished runs are always retained.
    pub fn purge_runs(&self, max_age: u64) -> usize {
        let now = chrono::Utc::now().timestamp();
        let mut runs = self.script_runs.lock();
        let before = runs.len();
        runs.retain(|run| match run.finished_at() {
            Some(finish_ts) => now - finish_ts <= max_age as i64,
            None => true,
        });
        before - runs.len()
    }

    /// The `help` body: for each script, its name, parse timestamp, and the
    /// verbatim annotation block.
    fn script_help(&self) -> String {
        let scripts = self.scripts.read();
        let mut names: Vec<_> = scripts.keys().collect();
        names.sort();
        let mut help = String::from("\n");
        for name in names {
            let script = &scripts[name];
            help.push_str(name);
            help.push('\n');
            help.push_str(&script.parsed_ts.to_string());
            help.push('\n');
            help.push_str(&script.help);
            help.push('\n');
        }
        help
    }

    /// Status of one run (by id) or of every run (empty id).
    fn run_statii(&self, id: &str) -> Result<Vec<RunStatus>, RequestError> {
        let runs = self.script_runs.lock();
        if id.is_empty() {
            Ok(runs.iter().map(|run| run.status()).collect())
        } else {
            find_run(&runs, id)
                .map(|run| vec![run.status()])
                .ok_or_else(|| RequestError::RunNotFound(id.to_string()))
        }
    }

    fn bash_script(&self, id: &str) -> Result<String, RequestError> {
        let runs = self.script_runs.lock();
        find_run(&runs, id)
            .map(|run| run.bash_script.clone())
            .ok_or_else(|| RequestError::RunNotFound(id.to_string()))
    }

    fn kill_run(&self, id: &str) -> Result<(), RequestError> {
        let run = {
            let runs = self.script_runs.lock();
            find_run(&runs, id)
                .cloned()
                .ok_or_else(|| RequestError::RunNotFound(id.to_string()))?
        };
        run.kill()
            .map_err(|err| RequestError::Other(err.to_string()))
    }

    /// Subscribe to SIGHUP and rebuild the catalog on each delivery, for the
    /// process lifetime.
    pub fn spawn_hup_reload(self: &Arc<Self>) -> std::io::Result<JoinHandle<()>> {
        let mut hup = signal(SignalKind::hangup())?;
        let server = Arc::clone(self);
        Ok(tokio::spawn(async move {
            while hup.recv().await.is_some() {
                info!("Caught SIGHUP, reloading scripts");
                server.load_scripts();
            }
        }))
    }
}

fn find_run<'a>(runs: &'a [Arc<ScriptRun>], id: &str) -> Option<&'a Arc<ScriptRun>> {
    runs.iter().find(|run| run.id == id)
}

/// Catalog eligibility: a regular file (not a symlink), readable and
/// executable by the owner, owned by the current user.
fn eligible_script(path: &Path) -> bool {
    let Ok(meta) = std::fs::symlink_metadata(path) else {
        return false;
    };
    meta.file_type().is_file()
        && meta.mode() & 0o500 == 0o500
        && meta.uid() == nix::unistd::getuid().as_raw()
}
