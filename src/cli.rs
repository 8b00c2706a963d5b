use crate::apply::{default_target, ApplicationEngine, ApplyConfig};
use crate::model::{ApplyTarget, ProposalAction};
use crate::orchestrator::{
    run_controller, Core, CoreEvent, CycleResult, CycleState, DreamOrchestrator,
    OrchestratorConfig, UiCommand,
};
use crate::resolver::{ExecutableResolver, LocationSource, ResolverConfig};
use crate::store::{ResolutionStore, StatusWrite};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// One unit of command output.
#[derive(Debug)]
enum Output {
    /// Result text for stdout.
    Line(String),
    /// Progress and warnings for stderr, so stdout stays parseable.
    Note(String),
    /// Pretty-printed on stdout for `--json`.
    Json(serde_json::Value),
}

/// Handle commands print through; the writer task owns the terminal.
#[derive(Clone)]
struct Printer {
    tx: mpsc::UnboundedSender<Output>,
}

impl Printer {
    fn line(&self, msg: impl Into<String>) {
        let _ = self.tx.send(Output::Line(msg.into()));
    }

    fn note(&self, msg: impl Into<String>) {
        let _ = self.tx.send(Output::Note(msg.into()));
    }

    fn json(&self, value: serde_json::Value) {
        let _ = self.tx.send(Output::Json(value));
    }
}

/// Spawn a blocking writer for stdout/stderr so async tasks never block on the terminal.
fn spawn_printer() -> (Printer, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Output>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(item) = rx.blocking_recv() {
            let _ = match item {
                Output::Line(msg) => writeln!(out, "{msg}"),
                Output::Note(msg) => writeln!(err, "{msg}"),
                Output::Json(value) => match serde_json::to_string_pretty(&value) {
                    Ok(text) => writeln!(out, "{text}"),
                    Err(e) => writeln!(err, "failed to encode output: {e}"),
                },
            };
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (Printer { tx }, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "good-night-bar",
    version,
    about = "Drive the good-night dreaming engine and apply the resolutions it proposes"
)]
pub struct Cli {
    /// Engine runtime directory (holds resolutions/ and state.json)
    #[arg(long, global = true)]
    pub runtime_dir: Option<PathBuf>,

    /// Root for globally scoped artifacts (defaults to the home directory)
    #[arg(long, global = true)]
    pub home: Option<PathBuf>,

    /// Print machine-readable JSON on stdout
    #[arg(long, global = true)]
    pub json: bool,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Show which engine executable a cycle would launch
    Locate,
    /// Run one dreaming cycle
    Dream {
        /// Pass the first-run lookback window regardless of engine state
        #[arg(long, conflicts_with = "no_first_run")]
        first_run: bool,
        /// Never pass the lookback window
        #[arg(long)]
        no_first_run: bool,
        /// Kill the engine if the cycle runs longer than this (e.g. 30m)
        #[arg(long)]
        timeout: Option<humantime::Duration>,
    },
    /// List pending resolutions
    List,
    /// Show one pending resolution in full
    Show {
        /// 1-based index from `list`
        index: usize,
    },
    /// Apply a pending resolution
    Apply {
        /// 1-based index from `list`
        index: usize,
        /// Write to the global scope
        #[arg(long, conflicts_with = "dirs")]
        global: bool,
        /// Write into this project directory (repeatable)
        #[arg(long = "dir")]
        dirs: Vec<PathBuf>,
    },
    /// Reject a pending resolution
    Dismiss {
        /// 1-based index from `list`
        index: usize,
    },
}

/// Resolved locations every command works from.
#[derive(Debug, Clone)]
pub struct Settings {
    pub runtime_dir: PathBuf,
    pub home: PathBuf,
    pub resolutions_dir: PathBuf,
}

pub fn build_settings(args: &Cli) -> Result<Settings> {
    let home = match args.home.clone() {
        Some(h) => h,
        None => dirs::home_dir().context("could not determine home directory; pass --home")?,
    };
    let runtime_dir = args
        .runtime_dir
        .clone()
        .unwrap_or_else(|| home.join(".good-night"));
    Ok(Settings {
        resolutions_dir: runtime_dir.join("resolutions"),
        runtime_dir,
        home,
    })
}

fn build_core(settings: &Settings, config: OrchestratorConfig) -> Core {
    let resolver = ExecutableResolver::new(ResolverConfig::for_home(&settings.home));
    Core {
        orchestrator: Arc::new(DreamOrchestrator::new(resolver, config)),
        store: ResolutionStore::new(&settings.resolutions_dir),
        engine: ApplicationEngine::new(ApplyConfig::for_home(&settings.home)),
    }
}

pub async fn run(args: Cli) -> Result<()> {
    let settings = build_settings(&args)?;
    let (printer, writer) = spawn_printer();
    let json = args.json;

    let result = match args.command.clone() {
        Command::Locate => run_locate(&settings, &printer, json),
        Command::Dream {
            first_run,
            no_first_run,
            timeout,
        } => {
            let first_run = if first_run {
                true
            } else if no_first_run {
                false
            } else {
                crate::state::is_first_run(&settings.runtime_dir)
            };
            let timeout = timeout.map(Duration::from);
            run_dream(&settings, &printer, first_run, timeout, json).await
        }
        Command::List => {
            let pending = ResolutionStore::new(&settings.resolutions_dir).load();
            print_list(&printer, &settings.resolutions_dir, &pending, json)
        }
        Command::Show { index } => run_show(&settings, &printer, index),
        Command::Apply {
            index,
            global,
            dirs,
        } => run_apply(&settings, &printer, index, global, dirs, json),
        Command::Dismiss { index } => run_dismiss(&settings, &printer, index, json),
    };

    drop(printer);
    let _ = writer.await;
    result
}

fn run_locate(settings: &Settings, printer: &Printer, json: bool) -> Result<()> {
    let resolver = ExecutableResolver::new(ResolverConfig::for_home(&settings.home));
    let location = resolver.resolve()?;
    let source = match &location.source {
        LocationSource::WellKnown => "well-known path".to_string(),
        LocationSource::PathLookup => "PATH".to_string(),
        LocationSource::InterpreterWrapper { interpreter } => {
            format!("wrapper around {interpreter}")
        }
    };
    if json {
        printer.json(serde_json::json!({
            "path": location.path,
            "source": source,
        }));
    } else {
        printer.line(format!("{} ({source})", location.path.display()));
    }
    Ok(())
}

async fn run_dream(
    settings: &Settings,
    printer: &Printer,
    first_run: bool,
    timeout: Option<Duration>,
    json: bool,
) -> Result<()> {
    let core = build_core(settings, OrchestratorConfig { timeout });
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<CoreEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();
    let controller = tokio::spawn(run_controller(core, event_tx, cmd_rx));

    let _ = cmd_tx.send(UiCommand::StartCycle { first_run });
    if first_run {
        printer.note("First run: analyzing the last 14 days of history");
    }

    let mut outcome: Option<CycleResult> = None;
    let mut pending_count = 0usize;
    let mut last_error: Option<String> = None;
    loop {
        tokio::select! {
            ev = event_rx.recv() => {
                match ev {
                    Some(CoreEvent::State(CycleState::Running)) => printer.note("Dreaming…"),
                    Some(CoreEvent::State(_)) => {}
                    Some(CoreEvent::Resolutions(list)) => pending_count = list.len(),
                    Some(CoreEvent::Notice(msg)) => printer.note(msg),
                    // Cycle failures come back through `outcome`; keep the text for task errors.
                    Some(CoreEvent::Error(msg)) => last_error = Some(msg),
                    Some(CoreEvent::CycleFinished(result)) => {
                        outcome = Some(result);
                        let _ = cmd_tx.send(UiCommand::Quit);
                    }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                let _ = cmd_tx.send(UiCommand::Cancel);
            }
        }
    }

    controller.await.context("controller task failed")??;

    let summary = match &outcome {
        Some(CycleResult::Succeeded { .. }) => "succeeded",
        Some(CycleResult::NoNewWork) => "no_new_work",
        Some(CycleResult::Failed(_)) => "failed",
        Some(CycleResult::Cancelled) => "cancelled",
        Some(CycleResult::AlreadyRunning) | None => "not_started",
    };
    if json {
        printer.json(serde_json::json!({ "outcome": summary, "pending": pending_count }));
    } else if let Some(CycleResult::Succeeded { .. }) = &outcome {
        printer.line(format!("{pending_count} resolution(s) pending"));
    }

    match (outcome, last_error) {
        (Some(CycleResult::Failed(failure)), _) => Err(anyhow::Error::new(failure)),
        (None, Some(msg)) => Err(anyhow::anyhow!(msg)),
        _ => Ok(()),
    }
}

fn select(pending: &[ProposalAction], index: usize) -> Result<&ProposalAction> {
    index
        .checked_sub(1)
        .and_then(|i| pending.get(i))
        .with_context(|| {
            format!(
                "no pending resolution #{index} ({} pending)",
                pending.len()
            )
        })
}

fn format_created(created: std::time::SystemTime) -> String {
    let offset = time::UtcOffset::current_local_offset().unwrap_or(time::UtcOffset::UTC);
    time::OffsetDateTime::from(created)
        .to_offset(offset)
        .format(time::macros::format_description!(
            "[year]-[month]-[day] [hour]:[minute]"
        ))
        .unwrap_or_else(|_| "-".into())
}

fn print_list(
    printer: &Printer,
    dir: &std::path::Path,
    pending: &[ProposalAction],
    json: bool,
) -> Result<()> {
    if json {
        printer.json(serde_json::to_value(pending)?);
        return Ok(());
    }
    if pending.is_empty() {
        printer.line(format!("No pending resolutions in {}", dir.display()));
        return Ok(());
    }
    for (i, action) in pending.iter().enumerate() {
        let scope = if action.is_local_change { "local" } else { "global" };
        printer.line(format!(
            "[{}] {:<12} {}  ({scope}, {})",
            i + 1,
            action.kind.label(),
            action.name,
            format_created(action.document_created)
        ));
        if !action.description.is_empty() {
            printer.line(format!("      {}", action.description));
        }
        if !action.directories.is_empty() {
            let dirs: Vec<String> = action
                .directories
                .iter()
                .map(|d| d.display().to_string())
                .collect();
            printer.line(format!("      dirs: {}", dirs.join(", ")));
        }
    }
    Ok(())
}

fn run_show(settings: &Settings, printer: &Printer, index: usize) -> Result<()> {
    let pending = ResolutionStore::new(&settings.resolutions_dir).load();
    let action = select(&pending, index)?;
    printer.json(serde_json::to_value(action)?);
    Ok(())
}

const STATUS_NOT_SAVED: &str = "warning: could not record status; this resolution may reappear";

fn run_apply(
    settings: &Settings,
    printer: &Printer,
    index: usize,
    global: bool,
    dirs: Vec<PathBuf>,
    json: bool,
) -> Result<()> {
    let store = ResolutionStore::new(&settings.resolutions_dir);
    let engine = ApplicationEngine::new(ApplyConfig::for_home(&settings.home));
    let mut pending = store.load();
    let action = select(&pending, index)?;
    let target = if global {
        ApplyTarget::Global
    } else if !dirs.is_empty() {
        ApplyTarget::Directories(dirs)
    } else {
        default_target(action)
    };
    let id = action.id;

    let report = engine.apply(&mut pending, id, &target)?;
    if json {
        printer.json(serde_json::json!({
            "action": report.action,
            "written": report.written,
            "status_saved": report.status == StatusWrite::Written,
            "unresolved": report.unresolved,
        }));
        return Ok(());
    }
    if report.unresolved {
        printer.note(format!(
            "\"{}\" had nothing to write; marked applied without changes",
            report.action
        ));
    }
    for path in &report.written {
        printer.line(format!("wrote {}", path.display()));
    }
    if report.status == StatusWrite::Skipped {
        printer.note(STATUS_NOT_SAVED);
    }
    Ok(())
}

fn run_dismiss(settings: &Settings, printer: &Printer, index: usize, json: bool) -> Result<()> {
    let store = ResolutionStore::new(&settings.resolutions_dir);
    let engine = ApplicationEngine::new(ApplyConfig::for_home(&settings.home));
    let mut pending = store.load();
    let action = select(&pending, index)?;
    let (id, name) = (action.id, action.name.clone());

    let status = engine.dismiss(&mut pending, id)?;
    if json {
        printer.json(serde_json::json!({
            "action": name,
            "status_saved": status == StatusWrite::Written,
        }));
    } else {
        printer.line(format!("dismissed \"{name}\""));
        if status == StatusWrite::Skipped {
            printer.note(STATUS_NOT_SAVED);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_derive_from_home() {
        let args = Cli::parse_from(["good-night-bar", "--home", "/h", "list"]);
        let s = build_settings(&args).unwrap();
        assert_eq!(s.runtime_dir, PathBuf::from("/h/.good-night"));
        assert_eq!(s.resolutions_dir, PathBuf::from("/h/.good-night/resolutions"));
    }

    #[test]
    fn apply_flags_conflict() {
        let res = Cli::try_parse_from(["good-night-bar", "apply", "1", "--global", "--dir", "/p"]);
        assert!(res.is_err());
        let ok = Cli::try_parse_from(["good-night-bar", "apply", "2", "--dir", "/p", "--dir", "/q"]);
        match ok.unwrap().command {
            Command::Apply { index, dirs, global } => {
                assert_eq!(index, 2);
                assert!(!global);
                assert_eq!(dirs, vec![PathBuf::from("/p"), PathBuf::from("/q")]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn dream_timeout_parses_humantime() {
        let args = Cli::try_parse_from(["good-night-bar", "dream", "--timeout", "30m"]).unwrap();
        match args.command {
            Command::Dream { timeout, .. } => {
                assert_eq!(timeout.map(Duration::from), Some(Duration::from_secs(1800)));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    fn drain(mut rx: mpsc::UnboundedReceiver<Output>) -> Vec<Output> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            out.push(item);
        }
        out
    }

    #[test]
    fn list_prints_numbered_entries_to_stdout() {
        let dir = tempfile::tempdir().unwrap();
        crate::store::tests::write_doc(
            dir.path(),
            "doc.json",
            &serde_json::json!({"resolutions": [{"actions": [
                {"name": "Run Tests", "type": "skill", "description": "Run the suite"},
                {"name": "Style", "type": "claude-md", "local_change": true,
                 "references": [{"working_directory": "/proj"}]}
            ]}]}),
        );
        let pending = ResolutionStore::new(dir.path()).load();
        let (tx, rx) = mpsc::unbounded_channel();

        print_list(&Printer { tx }, dir.path(), &pending, false).unwrap();

        let lines: Vec<String> = drain(rx)
            .into_iter()
            .map(|item| match item {
                Output::Line(line) => line,
                other => panic!("list should only print to stdout, got {other:?}"),
            })
            .collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("[1] skill        Run Tests  (global, "));
        assert_eq!(lines[1], "      Run the suite");
        assert!(lines[2].starts_with("[2] preferences  Style  (local, "));
        assert_eq!(lines[3], "      dirs: /proj");
    }

    #[test]
    fn empty_list_in_json_is_an_empty_array() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        print_list(&Printer { tx }, dir.path(), &[], true).unwrap();

        match drain(rx).as_slice() {
            [Output::Json(value)] => assert_eq!(value, &serde_json::json!([])),
            other => panic!("unexpected output: {other:?}"),
        }
    }

    #[test]
    fn index_is_one_based() {
        let pending: Vec<ProposalAction> = Vec::new();
        assert!(select(&pending, 0).is_err());
        assert!(select(&pending, 1).is_err());
    }
}
