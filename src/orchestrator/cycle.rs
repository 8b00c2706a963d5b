//! One dreaming cycle: resolve the engine, run it, interpret the exit.
//!
//! At most one cycle is active. The active slot is the Running guard: a second
//! `run_cycle` sees it occupied and returns at once, and `cancel` empties it so the
//! cancelled cycle can no longer publish its outcome.

use crate::error::{CycleFailure, ResolveError};
use crate::resolver::ExecutableResolver;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

pub const DREAM_SUBCOMMAND: &str = "dream";
pub const QUIET_FLAG: &str = "--quiet";
pub const DAYS_FLAG: &str = "--days";
/// Lookback passed on a first run. Fixed regardless of any configured lookback.
pub const FIRST_RUN_LOOKBACK_DAYS: u32 = 14;
/// Printed by the engine when there is nothing to analyze.
pub const NO_NEW_WORK_SENTINEL: &str = "No new conversations to analyze";
/// How long to keep draining output once the engine has exited or been killed.
/// Background children that inherited the pipes can hold them open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Observable orchestration state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Running,
    Succeeded,
    NoNewWork,
    Failed(CycleFailure),
}

impl CycleState {
    pub fn is_running(&self) -> bool {
        matches!(self, CycleState::Running)
    }
}

/// What a single `run_cycle` call produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleResult {
    Succeeded { output: String },
    NoNewWork,
    Failed(CycleFailure),
    /// Another cycle was active; nothing was started.
    AlreadyRunning,
    /// `cancel` was called; the engine was sent a kill and not awaited.
    Cancelled,
}

#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    /// Optional hard deadline per cycle. `None` waits for the engine indefinitely.
    pub timeout: Option<Duration>,
}

#[derive(Debug)]
enum CycleControl {
    Cancel,
}

/// A cycle that holds the active slot but has not launched the engine yet.
pub struct StartedCycle {
    id: u64,
    first_run: bool,
    ctrl_rx: mpsc::UnboundedReceiver<CycleControl>,
}

struct ActiveCycle {
    id: u64,
    ctrl_tx: mpsc::UnboundedSender<CycleControl>,
}

enum Waited {
    Exited(std::io::Result<std::process::ExitStatus>),
    Cancelled,
    TimedOut(Duration),
}

pub struct DreamOrchestrator {
    resolver: ExecutableResolver,
    config: OrchestratorConfig,
    state_tx: watch::Sender<CycleState>,
    active: Mutex<Option<ActiveCycle>>,
    next_id: AtomicU64,
}

impl DreamOrchestrator {
    pub fn new(resolver: ExecutableResolver, config: OrchestratorConfig) -> Self {
        let (state_tx, _) = watch::channel(CycleState::Idle);
        Self {
            resolver,
            config,
            state_tx,
            active: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<CycleState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> CycleState {
        self.state_tx.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.slot().is_some()
    }

    /// Run one cycle to completion. Returns `AlreadyRunning` immediately if a cycle is active.
    pub async fn run_cycle(&self, first_run: bool) -> CycleResult {
        match self.try_start(first_run) {
            Some(cycle) => self.complete(cycle).await,
            None => CycleResult::AlreadyRunning,
        }
    }

    /// Claim the active slot and publish `Running` on the caller's side.
    ///
    /// From here on `cancel` reaches the cycle, even before `complete` is polled.
    pub fn try_start(&self, first_run: bool) -> Option<StartedCycle> {
        let Some((id, ctrl_rx)) = self.begin() else {
            debug!("cycle requested while another is running; ignoring");
            return None;
        };
        info!(cycle = id, first_run, "dream cycle started");
        Some(StartedCycle {
            id,
            first_run,
            ctrl_rx,
        })
    }

    /// Drive a cycle claimed by `try_start` and publish its outcome.
    pub async fn complete(&self, cycle: StartedCycle) -> CycleResult {
        let StartedCycle {
            id,
            first_run,
            ctrl_rx,
        } = cycle;
        let result = self.drive(first_run, ctrl_rx).await;
        self.finish(id, &result);
        result
    }

    /// Kill the in-flight engine, if any, and report `Idle` right away.
    pub fn cancel(&self) -> bool {
        let Some(active) = self.slot().take() else {
            return false;
        };
        let _ = active.ctrl_tx.send(CycleControl::Cancel);
        self.state_tx.send_replace(CycleState::Idle);
        info!(cycle = active.id, "dream cycle cancelled");
        true
    }

    /// Return a finished cycle's terminal state to `Idle`.
    pub fn acknowledge(&self) {
        let slot = self.slot();
        if slot.is_none() {
            self.state_tx.send_replace(CycleState::Idle);
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<ActiveCycle>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn begin(&self) -> Option<(u64, mpsc::UnboundedReceiver<CycleControl>)> {
        let mut slot = self.slot();
        if slot.is_some() {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        *slot = Some(ActiveCycle { id, ctrl_tx });
        self.state_tx.send_replace(CycleState::Running);
        Some((id, ctrl_rx))
    }

    /// Publish the outcome only if this cycle still owns the slot.
    fn finish(&self, id: u64, result: &CycleResult) {
        let mut slot = self.slot();
        if slot.as_ref().map(|a| a.id) != Some(id) {
            debug!(cycle = id, "cycle no longer active; outcome not published");
            return;
        }
        *slot = None;
        let state = match result {
            CycleResult::Succeeded { .. } => CycleState::Succeeded,
            CycleResult::NoNewWork => CycleState::NoNewWork,
            CycleResult::Failed(f) => CycleState::Failed(f.clone()),
            CycleResult::AlreadyRunning | CycleResult::Cancelled => CycleState::Idle,
        };
        self.state_tx.send_replace(state);
    }

    async fn drive(
        &self,
        first_run: bool,
        mut ctrl_rx: mpsc::UnboundedReceiver<CycleControl>,
    ) -> CycleResult {
        let resolver = self.resolver.clone();
        let location = match tokio::task::spawn_blocking(move || resolver.resolve()).await {
            Ok(Ok(loc)) => loc,
            Ok(Err(ResolveError::NotFound)) => {
                return CycleResult::Failed(CycleFailure::EngineNotFound);
            }
            Err(e) => {
                warn!(error = %e, "executable resolution task failed");
                return CycleResult::Failed(CycleFailure::EngineNotFound);
            }
        };

        if ctrl_rx.try_recv().is_ok() {
            debug!("cycle cancelled before launch");
            return CycleResult::Cancelled;
        }

        let args = engine_args(first_run);
        let invocation = invocation_string(&location.path, &args);
        debug!(%invocation, "launching engine");

        let mut child = match Command::new(&location.path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(c) => c,
            Err(e) => {
                return CycleResult::Failed(CycleFailure::Launch {
                    invocation,
                    error: e.to_string(),
                });
            }
        };

        // stdout and stderr interleave line by line into one capture.
        let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, line_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, line_tx.clone());
        }
        drop(line_tx);

        let waited = tokio::select! {
            status = child.wait() => Waited::Exited(status),
            _ = ctrl_rx.recv() => Waited::Cancelled,
            limit = deadline(self.config.timeout) => Waited::TimedOut(limit),
        };

        match waited {
            Waited::Cancelled => {
                let _ = child.start_kill();
                CycleResult::Cancelled
            }
            Waited::TimedOut(limit) => {
                let _ = child.start_kill();
                let output = drain_output(&mut line_rx).await;
                warn!(%invocation, ?limit, "engine exceeded cycle deadline");
                CycleResult::Failed(CycleFailure::Timeout {
                    invocation,
                    limit,
                    output,
                })
            }
            Waited::Exited(Err(e)) => CycleResult::Failed(CycleFailure::Launch {
                invocation,
                error: format!("failed waiting for process: {e}"),
            }),
            Waited::Exited(Ok(status)) => {
                let output = tokio::select! {
                    out = drain_output(&mut line_rx) => out,
                    _ = ctrl_rx.recv() => return CycleResult::Cancelled,
                };
                info!(code = ?status.code(), "engine exited");
                interpret_exit(invocation, status.code(), output)
            }
        }
    }
}

/// `dream --quiet`, plus the lookback window on a first run.
pub fn engine_args(first_run: bool) -> Vec<String> {
    let mut args = vec![DREAM_SUBCOMMAND.to_string(), QUIET_FLAG.to_string()];
    if first_run {
        args.push(DAYS_FLAG.to_string());
        args.push(FIRST_RUN_LOOKBACK_DAYS.to_string());
    }
    args
}

fn invocation_string(path: &Path, args: &[String]) -> String {
    let mut s = path.display().to_string();
    for a in args {
        s.push(' ');
        s.push_str(a);
    }
    s
}

pub fn interpret_exit(invocation: String, code: Option<i32>, output: String) -> CycleResult {
    match code {
        Some(0) if output.contains(NO_NEW_WORK_SENTINEL) => CycleResult::NoNewWork,
        Some(0) => CycleResult::Succeeded { output },
        exit_code => CycleResult::Failed(CycleFailure::NonZeroExit {
            invocation,
            exit_code,
            output,
        }),
    }
}

/// Forward `reader` line by line until EOF. Invalid UTF-8 is replaced, never fatal, so
/// the pipe is always drained and the engine never sees a closed pipe.
fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    if buf.last() == Some(&b'\n') {
                        buf.pop();
                    }
                    // The receiver may be gone after a cancel; keep draining regardless.
                    let _ = tx.send(String::from_utf8_lossy(&buf).into_owned());
                }
                Err(e) => {
                    debug!(error = %e, "engine output stream failed");
                    break;
                }
            }
        }
    });
}

/// Collect forwarded lines until every writer closes or `DRAIN_GRACE` passes.
async fn drain_output(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    let mut out = String::new();
    let grace = tokio::time::sleep(DRAIN_GRACE);
    tokio::pin!(grace);
    loop {
        tokio::select! {
            biased;
            line = rx.recv() => match line {
                Some(line) => {
                    out.push_str(&line);
                    out.push('\n');
                }
                None => break,
            },
            _ = &mut grace => {
                debug!("engine output still open after exit; keeping what arrived");
                break;
            }
        }
    }
    out
}

async fn deadline(limit: Option<Duration>) -> Duration {
    match limit {
        Some(d) => {
            tokio::time::sleep(d).await;
            d
        }
        None => futures::future::pending().await,
    }
}
