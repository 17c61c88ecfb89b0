//! A single invocation of a script: child-process launch with the extra
//! descriptor protocol, per-descriptor reader tasks, the timeout state
//! machine, and kill support.

use std::collections::BTreeMap;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::errors::{DaemonError, Result};
use crate::script::{OutputMode, ParamValue, Script, CLEAR_FD, OUTPUT_FD_BASE};
use scriptd_protocol::{Request, RunStatus};

/// Sleep used as an idle heartbeat when no timeout is armed.
const IDLE_TICK_SECS: u64 = 3600;

/// Grace period for reader tasks to drain once the child has exited and the
/// retained write ends are closed. Readers still blocked after this (their
/// descriptors inherited by orphaned grandchildren) are aborted, which closes
/// the read ends.
const READER_DRAIN_SECS: u64 = 5;

fn epoch_secs() -> i64 {
    Utc::now().timestamp()
}

/// The current timeout window. Both fields move together: `set_ts` marks the
/// instant `secs` began counting.
struct TimeoutState {
    secs: u64,
    set_ts: i64,
}

#[derive(Default)]
struct RunState {
    start_ts: i64,
    finish_ts: i64,
    finished: bool,
    exit_code: i32,
}

/// Which descriptor a reader task is consuming.
#[derive(Debug, Clone, Copy)]
enum FdRole {
    Stdout,
    Stderr,
    Clear,
    Timeout,
    Output(usize),
}

/// One invocation of a [`Script`], bound to a request and typed params.
///
/// Mutated by exactly one supervisor task; snapshot readers take the
/// per-output locks for any observation of an output buffer.
pub struct ScriptRun {
    pub id: String,
    /// Optional caller-supplied correlator (`logid` request param).
    pub log_id: String,
    pub script: Arc<Script>,
    pub request: Request,
    /// The rendered body the child executes.
    pub bash_script: String,
    pub params: BTreeMap<String, ParamValue>,
    /// Index-aligned with `script.output_defs`.
    outputs: Vec<Mutex<String>>,
    timeout: Mutex<TimeoutState>,
    /// Single-permit wake slot; redundant signals coalesce, so the
    /// supervisor always re-reads the `timeout` pair on wake.
    timeout_set: Notify,
    state: Mutex<RunState>,
    child_pid: Mutex<Option<u32>>,
}

struct LaunchedChild {
    child: Child,
    /// Parent copies of the write ends handed to the child; closing them
    /// after child exit is what lets reader tasks see end-of-input.
    write_ends: Vec<OwnedFd>,
    readers: Vec<JoinHandle<()>>,
}

impl ScriptRun {
    pub fn new(
        id: String,
        script: Arc<Script>,
        request: Request,
        params: BTreeMap<String, ParamValue>,
        bash_script: String,
    ) -> Self {
        let log_id = request.param("logid").to_string();
        let outputs = script
            .output_defs
            .iter()
            .map(|_| Mutex::new(String::new()))
            .collect();
        Self {
            id,
            log_id,
            script,
            request,
            bash_script,
            params,
            outputs,
            timeout: Mutex::new(TimeoutState {
                secs: 0,
                set_ts: epoch_secs(),
            }),
            timeout_set: Notify::new(),
            state: Mutex::new(RunState::default()),
            child_pid: Mutex::new(None),
        }
    }

    /// Point-in-time status snapshot. Output contents are copied under their
    /// per-output locks.
    pub fn status(&self) -> RunStatus {
        let params = self
            .params
            .iter()
            .map(|(k, v)| (k.clone(), v.to_string()))
            .collect();
        let outputs = self
            .script
            .output_defs
            .iter()
            .zip(&self.outputs)
            .map(|(def, buf)| (def.name.clone(), buf.lock().clone()))
            .collect();
        let timeout_set_ts = self.timeout.lock().set_ts;
        let state = self.state.lock();
        RunStatus {
            script_name: self.script.name.clone(),
            id: self.id.clone(),
            script_ts: self.script.parsed_ts,
            params,
            outputs,
            timeout_set_ts,
            start_ts: state.start_ts,
            finish_ts: state.finish_ts,
            finished: state.finished,
            exit_code: state.exit_code,
        }
    }

    /// `finish_ts` when the run has finished, `None` while it is live.
    pub fn finished_at(&self) -> Option<i64> {
        let state = self.state.lock();
        state.finished.then_some(state.finish_ts)
    }

    /// Send SIGKILL to the child's process group, terminating the whole tree.
    /// Fails if the run never launched a child.
    pub fn kill(&self) -> Result<()> {
        let pid = self
            .child_pid
            .lock()
            .ok_or_else(|| DaemonError::NoProcess {
                id: self.id.clone(),
            })?;
        scriptd_unix::process::kill_process_group(pid).map_err(|source| DaemonError::Kill {
            id: self.id.clone(),
            source,
        })
    }

    /// Drive the run to completion: launch, supervise with the timeout state
    /// machine, tear down pipes, record the exit code, mark finished.
    pub async fn supervise(self: Arc<Self>) {
        match self.launch() {
            Ok(launched) => self.run_with_timeout(launched).await,
            Err(err) => self.log_err(format_args!("Launch failed: {err}")),
        }

        let exit_code = {
            let mut state = self.state.lock();
            state.finish_ts = epoch_secs();
            state.finished = true;
            state.exit_code
        };
        self.log_info(format_args!("Finished exit_code={exit_code}"));
    }

    /// Spawn `bash -c <bash_script>` in a fresh process group with the extra
    /// descriptors attached, and start one reader task per descriptor.
    fn launch(self: &Arc<Self>) -> Result<LaunchedChild> {
        let extra = 2 + self.outputs.len();

        // One pipe per control channel and output var. Both ends CLOEXEC so
        // unrelated children never inherit them; the pre_exec dup2 below is
        // what re-binds the write ends into the child. Sources are moved
        // above the target range first so the dup2 loop cannot clobber one.
        let min_source = CLEAR_FD + extra as RawFd;
        let mut read_ends = Vec::with_capacity(extra);
        let mut write_ends = Vec::with_capacity(extra);
        for _ in 0..extra {
            let (read_fd, write_fd) =
                scriptd_unix::pipe::pipe_cloexec().map_err(DaemonError::Pipe)?;
            read_ends.push(read_fd);
            write_ends
                .push(scriptd_unix::pipe::dup_above_cloexec(write_fd, min_source)
                    .map_err(DaemonError::Pipe)?);
        }

        let mut cmd = Command::new("bash");
        cmd.arg("-c")
            .arg(&self.bash_script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let raw_writes: Vec<RawFd> = write_ends.iter().map(AsRawFd::as_raw_fd).collect();
        // SAFETY: runs between fork and exec; dup2 is async-signal-safe and
        // the captured Vec is only read.
        unsafe {
            cmd.pre_exec(move || {
                for (idx, &raw) in raw_writes.iter().enumerate() {
                    scriptd_unix::pipe::dup_to_fd(raw, CLEAR_FD + idx as RawFd)?;
                }
                Ok(())
            });
        }

        self.state.lock().start_ts = epoch_secs();
        let mut child = cmd.spawn().map_err(|source| DaemonError::Spawn {
            id: self.id.clone(),
            source,
        })?;
        *self.child_pid.lock() = child.id();

        let mut readers = Vec::with_capacity(2 + extra);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(self.clone().read_lines(FdRole::Stdout, stdout)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(self.clone().read_lines(FdRole::Stderr, stderr)));
        }
        for (idx, read_fd) in read_ends.into_iter().enumerate() {
            let role = match CLEAR_FD + idx as RawFd {
                CLEAR_FD => FdRole::Clear,
                crate::script::TIMEOUT_FD => FdRole::Timeout,
                fd => FdRole::Output((fd - OUTPUT_FD_BASE) as usize),
            };
            let receiver = pipe::Receiver::from_owned_fd(read_fd).map_err(|source| {
                DaemonError::Spawn {
                    id: self.id.clone(),
                    source,
                }
            })?;
            readers.push(tokio::spawn(self.clone().read_lines(role, receiver)));
        }

        Ok(LaunchedChild {
            child,
            write_ends,
            readers,
        })
    }

    /// Block on the three event sources (child exit, timeout update, wall
    /// clock) until the child exits, then tear down pipes and record the
    /// exit code.
    async fn run_with_timeout(&self, mut launched: LaunchedChild) {
        let mut killed = false;
        let wait_result = loop {
            let wait_secs = {
                let timeout = self.timeout.lock();
                if timeout.secs == 0 {
                    IDLE_TICK_SECS
                } else {
                    timeout.secs
                }
            };
            tokio::select! {
                status = launched.child.wait() => break status,
                _ = self.timeout_set.notified() => {
                    let secs = self.timeout.lock().secs;
                    self.log_info(format_args!("Timeout updated to {secs}"));
                }
                _ = tokio::time::sleep(Duration::from_secs(wait_secs)) => {
                    let (secs, set_ts) = {
                        let timeout = self.timeout.lock();
                        (timeout.secs, timeout.set_ts)
                    };
                    if !killed && secs > 0 && epoch_secs() - set_ts >= secs as i64 {
                        self.log_info(format_args!("Timed out; sending kill signal"));
                        if let Err(err) = self.kill() {
                            self.log_err(format_args!("Kill failed: {err}"));
                        }
                        killed = true;
                    }
                }
            }
        };

        // Closing our write ends is what delivers end-of-input to the
        // readers now that the child's copies died with it.
        launched.write_ends.clear();
        self.drain_readers(launched.readers).await;

        match wait_result {
            Ok(status) => {
                let code = exit_code_of(&status).unwrap_or_else(|| {
                    self.log_err(format_args!("Unable to get exit status"));
                    1
                });
                self.state.lock().exit_code = code;
            }
            Err(err) => {
                self.log_err(format_args!("Failed to wait on child: {err}"));
                self.state.lock().exit_code = 1;
            }
        }
    }

    /// Wait for reader tasks to hit end-of-input; abort any that stay
    /// blocked past the grace period (dropping their read ends).
    async fn drain_readers(&self, readers: Vec<JoinHandle<()>>) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(READER_DRAIN_SECS);
        for mut reader in readers {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, &mut reader).await.is_err() {
                reader.abort();
            }
        }
    }

    /// Consume newline-terminated records from one descriptor until
    /// end-of-input. A partial trailing record that never reaches a newline
    /// is discarded.
    async fn read_lines<R>(self: Arc<Self>, role: FdRole, stream: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    if buf.last() != Some(&b'\n') {
                        break;
                    }
                    let line = String::from_utf8_lossy(&buf);
                    self.handle_line(role, &line);
                }
                Err(_) => break,
            }
        }
    }

    fn handle_line(&self, role: FdRole, line: &str) {
        match role {
            FdRole::Stdout => self.log_info(format_args!("{}", line.trim_end())),
            FdRole::Stderr => self.log_err(format_args!("{}", line.trim_end())),
            FdRole::Clear => {
                let name = line.trim();
                match self.script.output_idx_by_name(name) {
                    Some(idx) => self.outputs[idx].lock().clear(),
                    None => {
                        self.log_err(format_args!("Failed to _clear {name}; no such output"))
                    }
                }
            }
            FdRole::Timeout => match line.trim().parse::<u64>() {
                Ok(secs) => {
                    // The pair moves together, before the wake notification.
                    {
                        let mut timeout = self.timeout.lock();
                        timeout.secs = secs;
                        timeout.set_ts = epoch_secs();
                    }
                    self.timeout_set.notify_one();
                }
                Err(_) => {
                    self.log_err(format_args!("Failed to set _timeout to {}", line.trim()))
                }
            },
            FdRole::Output(idx) => {
                let def = &self.script.output_defs[idx];
                let trimmed = line.trim();
                {
                    let mut buf = self.outputs[idx].lock();
                    match def.mode {
                        OutputMode::Overwrite => {
                            buf.clear();
                            buf.push_str(trimmed);
                        }
                        OutputMode::Append => buf.push_str(line),
                    }
                }
                self.log_info(format_args!("{}: {}", def.name, trimmed));
            }
        }
    }

    fn log_info(&self, msg: std::fmt::Arguments<'_>) {
        info!(
            script = %self.script.name,
            log_id = %self.log_id,
            run = %self.id,
            "{msg}"
        );
    }

    fn log_err(&self, msg: std::fmt::Arguments<'_>) {
        error!(
            script = %self.script.name,
            log_id = %self.log_id,
            run = %self.id,
            "{msg}"
        );
    }
}

/// Map a wait status to the recorded exit code: the exit status when the
/// child exited, `-1` when a signal terminated it (unix wait semantics),
/// `None` when neither can be extracted.
fn exit_code_of(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;

    if let Some(code) = status.code() {
        Some(code)
    } else {
        status.signal().map(|_| -1)
    }
}
