//! Command surface for presentation layers.
//!
//! Owns the pending resolution list and the cycle task, forwards user intents to the
//! orchestrator and application engine, and emits events back.

use super::cycle::{CycleResult, CycleState, DreamOrchestrator};
use super::post_process::process_cycle_completion;
use crate::apply::ApplicationEngine;
use crate::model::{ApplyTarget, ProposalAction};
use crate::store::{ResolutionStore, StatusWrite};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::debug;
use uuid::Uuid;

/// Intents forwarded by UI layers.
#[derive(Debug, Clone)]
pub(crate) enum UiCommand {
    StartCycle { first_run: bool },
    Cancel,
    /// Clear a finished cycle's outcome back to idle.
    Acknowledge,
    Reload,
    Apply { id: Uuid, target: ApplyTarget },
    Dismiss { id: Uuid },
    Quit,
}

/// Everything presentation layers observe.
#[derive(Debug, Clone)]
pub(crate) enum CoreEvent {
    State(CycleState),
    Resolutions(Vec<ProposalAction>),
    CycleFinished(CycleResult),
    Notice(String),
    Error(String),
}

/// Components the controller drives.
pub(crate) struct Core {
    pub orchestrator: Arc<DreamOrchestrator>,
    pub store: ResolutionStore,
    pub engine: ApplicationEngine,
}

pub(crate) async fn run_controller(
    core: Core,
    event_tx: UnboundedSender<CoreEvent>,
    mut cmd_rx: UnboundedReceiver<UiCommand>,
) -> Result<()> {
    let Core {
        orchestrator,
        store,
        engine,
    } = core;
    let mut state_rx = orchestrator.subscribe();
    let mut pending = store.load();
    let _ = event_tx.send(CoreEvent::State(state_rx.borrow_and_update().clone()));
    let _ = event_tx.send(CoreEvent::Resolutions(pending.clone()));

    let mut cycle: Option<tokio::task::JoinHandle<CycleResult>> = None;
    let mut quit_pending = false;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv(), if !quit_pending => {
                match cmd {
                    Some(UiCommand::StartCycle { first_run }) => {
                        // Claim the slot here so a Cancel or Quit right behind this command
                        // finds the cycle.
                        let started = if cycle.is_none() {
                            orchestrator.try_start(first_run)
                        } else {
                            None
                        };
                        match started {
                            Some(started) => {
                                let orch = orchestrator.clone();
                                cycle = Some(tokio::spawn(async move { orch.complete(started).await }));
                            }
                            None => {
                                let _ = event_tx.send(CoreEvent::Notice(
                                    "A dream cycle is already running.".into(),
                                ));
                            }
                        }
                    }
                    Some(UiCommand::Cancel) => {
                        if orchestrator.cancel() {
                            let _ = event_tx.send(CoreEvent::Notice("Cancelling…".into()));
                        }
                    }
                    Some(UiCommand::Acknowledge) => orchestrator.acknowledge(),
                    Some(UiCommand::Reload) => {
                        pending = store.load();
                        let _ = event_tx.send(CoreEvent::Resolutions(pending.clone()));
                    }
                    Some(UiCommand::Apply { id, target }) => {
                        match engine.apply(&mut pending, id, &target) {
                            Ok(report) => {
                                let mut msg = if report.unresolved {
                                    format!("Marked \"{}\" applied; its kind has no handler so nothing was written.", report.action)
                                } else {
                                    format!("Applied \"{}\" ({} file(s)).", report.action, report.written.len())
                                };
                                if report.status == StatusWrite::Skipped {
                                    msg.push_str(" Status could not be saved; it may reappear.");
                                }
                                let _ = event_tx.send(CoreEvent::Notice(msg));
                                let _ = event_tx.send(CoreEvent::Resolutions(pending.clone()));
                            }
                            Err(e) => {
                                let _ = event_tx.send(CoreEvent::Error(format!("Apply failed: {e}")));
                            }
                        }
                    }
                    Some(UiCommand::Dismiss { id }) => {
                        match engine.dismiss(&mut pending, id) {
                            Ok(_) => {
                                let _ = event_tx.send(CoreEvent::Resolutions(pending.clone()));
                            }
                            Err(e) => {
                                let _ = event_tx.send(CoreEvent::Error(format!("Dismiss failed: {e}")));
                            }
                        }
                    }
                    Some(UiCommand::Quit) | None => {
                        // Quit waits for the current cycle to wind down so its outcome is still reported.
                        quit_pending = true;
                        if cycle.is_some() {
                            orchestrator.cancel();
                        } else {
                            return Ok(());
                        }
                    }
                }
            }
            // Do not take the JoinHandle before this branch wins; otherwise it can be dropped
            // if another select branch is chosen, and we'll never observe completion.
            maybe_done = async {
                if let Some(h) = cycle.as_mut() {
                    return Some(h.await);
                }
                futures::future::pending().await
            } => {
                if let Some(join_res) = maybe_done {
                    cycle = None;
                    match join_res {
                        Ok(result) => {
                            let processed = process_cycle_completion(&result, &store);
                            if let Some(fresh) = processed.refreshed {
                                pending = fresh;
                                let _ = event_tx.send(CoreEvent::Resolutions(pending.clone()));
                            }
                            if let Some(notice) = processed.notice {
                                let _ = event_tx.send(CoreEvent::Notice(notice));
                            }
                            if let Some(error) = processed.error {
                                let _ = event_tx.send(CoreEvent::Error(error));
                            }
                            let _ = event_tx.send(CoreEvent::CycleFinished(result));
                        }
                        Err(e) => {
                            let _ = event_tx.send(CoreEvent::Error(format!("Dream cycle task failed: {e}")));
                        }
                    }
                    if quit_pending {
                        return Ok(());
                    }
                }
            }
            changed = state_rx.changed() => {
                if changed.is_ok() {
                    let state = state_rx.borrow_and_update().clone();
                    debug!(?state, "cycle state changed");
                    let _ = event_tx.send(CoreEvent::State(state));
                }
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::apply::ApplyConfig;
    use crate::orchestrator::cycle::OrchestratorConfig;
    use crate::resolver::{ExecutableResolver, ResolverConfig};
    use crate::store::tests::write_doc;
    use serde_json::json;
    use std::path::Path;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn core_with_engine(root: &Path, body: &str) -> Core {
        use std::os::unix::fs::PermissionsExt;

        let docs = root.join("resolutions");
        std::fs::create_dir_all(&docs).unwrap();
        let engine_path = root.join("good-night");
        std::fs::write(&engine_path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&engine_path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let resolver = ExecutableResolver::new(ResolverConfig {
            engine_name: "good-night-test-engine-that-is-not-installed".into(),
            module: "good_night_test_module_missing".into(),
            well_known_paths: vec![engine_path],
            interpreters: Vec::new(),
            wrapper_path: root.join("wrapper.sh"),
        });
        Core {
            orchestrator: Arc::new(DreamOrchestrator::new(resolver, OrchestratorConfig::default())),
            store: ResolutionStore::new(docs),
            engine: ApplicationEngine::new(ApplyConfig::for_home(&root.join("home"))),
        }
    }

    async fn next_matching<F>(rx: &mut mpsc::UnboundedReceiver<CoreEvent>, mut pred: F) -> CoreEvent
    where
        F: FnMut(&CoreEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let ev = rx.recv().await.expect("controller closed the event channel");
                if pred(&ev) {
                    return ev;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    #[tokio::test]
    async fn successful_cycle_refreshes_resolutions() {
        let dir = tempfile::tempdir().unwrap();
        let docs = dir.path().join("resolutions");
        // The fake engine deposits a document, like the real one does.
        let body = format!(
            "cat > '{}/new.json' <<'EOF'\n{}\nEOF",
            docs.display(),
            json!({"resolutions": [{"actions": [{"name": "Run Tests", "type": "skill",
                "content": {"name": "Run Tests", "instructions": "pytest"}}]}]})
        );
        let core = core_with_engine(dir.path(), &body);
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let controller = tokio::spawn(run_controller(core, event_tx, cmd_rx));

        let initial = next_matching(&mut event_rx, |e| matches!(e, CoreEvent::Resolutions(_))).await;
        assert!(matches!(initial, CoreEvent::Resolutions(ref r) if r.is_empty()));

        cmd_tx.send(UiCommand::StartCycle { first_run: false }).unwrap();
        let refreshed = next_matching(&mut event_rx, |e| matches!(e, CoreEvent::Resolutions(_))).await;
        let CoreEvent::Resolutions(list) = refreshed else { unreachable!() };
        assert_eq!(list.len(), 1);
        let id = list[0].id;

        let finished = next_matching(&mut event_rx, |e| matches!(e, CoreEvent::CycleFinished(_))).await;
        assert!(matches!(finished, CoreEvent::CycleFinished(CycleResult::Succeeded { .. })));

        cmd_tx
            .send(UiCommand::Apply { id, target: ApplyTarget::Global })
            .unwrap();
        let after = next_matching(&mut event_rx, |e| matches!(e, CoreEvent::Resolutions(_))).await;
        assert!(matches!(after, CoreEvent::Resolutions(ref r) if r.is_empty()));
        assert!(dir
            .path()
            .join("home/.claude/skills/run-tests/SKILL.md")
            .exists());

        cmd_tx.send(UiCommand::Quit).unwrap();
        controller.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn dismiss_and_reload_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let core = core_with_engine(dir.path(), "exit 1");
        write_doc(
            &dir.path().join("resolutions"),
            "doc.json",
            &json!({"resolutions": [{"actions": [
                {"name": "keep", "type": "claude-md"},
                {"name": "drop", "type": "claude-md"}
            ]}]}),
        );
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let controller = tokio::spawn(run_controller(core, event_tx, cmd_rx));

        let CoreEvent::Resolutions(list) =
            next_matching(&mut event_rx, |e| matches!(e, CoreEvent::Resolutions(_))).await
        else {
            unreachable!()
        };
        let drop_id = list.iter().find(|a| a.name == "drop").unwrap().id;

        cmd_tx.send(UiCommand::Dismiss { id: drop_id }).unwrap();
        next_matching(&mut event_rx, |e| matches!(e, CoreEvent::Resolutions(r) if r.len() == 1)).await;

        cmd_tx.send(UiCommand::Dismiss { id: drop_id }).unwrap();
        next_matching(&mut event_rx, |e| matches!(e, CoreEvent::Error(_))).await;

        cmd_tx.send(UiCommand::Reload).unwrap();
        let CoreEvent::Resolutions(reloaded) =
            next_matching(&mut event_rx, |e| matches!(e, CoreEvent::Resolutions(_))).await
        else {
            unreachable!()
        };
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded[0].name, "keep");

        cmd_tx.send(UiCommand::StartCycle { first_run: false }).unwrap();
        next_matching(&mut event_rx, |e| matches!(e, CoreEvent::State(CycleState::Failed(_)))).await;
        cmd_tx.send(UiCommand::Acknowledge).unwrap();
        next_matching(&mut event_rx, |e| matches!(e, CoreEvent::State(CycleState::Idle))).await;

        drop(cmd_tx);
        controller.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn quit_right_after_start_cancels_the_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let core = core_with_engine(dir.path(), "exec sleep 30");
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let controller = tokio::spawn(run_controller(core, event_tx, cmd_rx));

        cmd_tx.send(UiCommand::StartCycle { first_run: false }).unwrap();
        cmd_tx.send(UiCommand::Quit).unwrap();

        let finished = next_matching(&mut event_rx, |e| matches!(e, CoreEvent::CycleFinished(_))).await;
        assert!(matches!(finished, CoreEvent::CycleFinished(CycleResult::Cancelled)));
        tokio::time::timeout(Duration::from_secs(5), controller)
            .await
            .expect("controller should stop once the cycle is cancelled")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn quit_cancels_in_flight_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let core = core_with_engine(dir.path(), "exec sleep 30");
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let controller = tokio::spawn(run_controller(core, event_tx, cmd_rx));

        cmd_tx.send(UiCommand::StartCycle { first_run: true }).unwrap();
        next_matching(&mut event_rx, |e| matches!(e, CoreEvent::State(CycleState::Running))).await;
        cmd_tx.send(UiCommand::StartCycle { first_run: true }).unwrap();
        next_matching(&mut event_rx, |e| {
            matches!(e, CoreEvent::Notice(m) if m.contains("already running"))
        })
        .await;

        cmd_tx.send(UiCommand::Quit).unwrap();
        let finished = next_matching(&mut event_rx, |e| matches!(e, CoreEvent::CycleFinished(_))).await;
        assert!(matches!(finished, CoreEvent::CycleFinished(CycleResult::Cancelled)));
        tokio::time::timeout(Duration::from_secs(5), controller)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
