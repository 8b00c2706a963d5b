//! Post-cycle processing.
//!
//! Reloads the store after a successful cycle and prepares the completion notification.

use super::cycle::CycleResult;
use crate::model::ProposalAction;
use crate::store::ResolutionStore;

/// Result of post-cycle processing, ready for presentation layers.
pub(crate) struct ProcessedCycle {
    /// Fresh pending list when the cycle may have produced new documents.
    pub refreshed: Option<Vec<ProposalAction>>,
    pub notice: Option<String>,
    pub error: Option<String>,
}

pub(crate) fn process_cycle_completion(
    result: &CycleResult,
    store: &ResolutionStore,
) -> ProcessedCycle {
    match result {
        CycleResult::Succeeded { .. } => {
            let pending = store.load();
            let notice = match pending.len() {
                0 => "Dream cycle complete. No resolutions pending.".to_string(),
                1 => "Dream cycle complete. 1 resolution pending.".to_string(),
                n => format!("Dream cycle complete. {n} resolutions pending."),
            };
            ProcessedCycle {
                refreshed: Some(pending),
                notice: Some(notice),
                error: None,
            }
        }
        CycleResult::NoNewWork => ProcessedCycle {
            refreshed: None,
            notice: Some("No new conversations to analyze.".to_string()),
            error: None,
        },
        CycleResult::Failed(failure) => ProcessedCycle {
            refreshed: None,
            notice: None,
            error: Some(failure.to_string()),
        },
        CycleResult::AlreadyRunning => ProcessedCycle {
            refreshed: None,
            notice: Some("A dream cycle is already running.".to_string()),
            error: None,
        },
        CycleResult::Cancelled => ProcessedCycle {
            refreshed: None,
            notice: Some("Dream cycle cancelled.".to_string()),
            error: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CycleFailure;
    use crate::store::tests::write_doc;
    use serde_json::json;

    #[test]
    fn success_reloads_store() {
        let dir = tempfile::tempdir().unwrap();
        write_doc(
            dir.path(),
            "doc.json",
            &json!({"resolutions": [{"actions": [
                {"name": "a", "type": "skill"},
                {"name": "b", "type": "skill"}
            ]}]}),
        );
        let store = ResolutionStore::new(dir.path());

        let processed = process_cycle_completion(
            &CycleResult::Succeeded {
                output: String::new(),
            },
            &store,
        );

        assert_eq!(processed.refreshed.map(|p| p.len()), Some(2));
        assert_eq!(
            processed.notice.as_deref(),
            Some("Dream cycle complete. 2 resolutions pending.")
        );
        assert!(processed.error.is_none());
    }

    #[test]
    fn failure_surfaces_full_diagnostic_without_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResolutionStore::new(dir.path());
        let failure = CycleFailure::NonZeroExit {
            invocation: "good-night dream --quiet".into(),
            exit_code: Some(1),
            output: "line one\nline two\n".into(),
        };

        let processed = process_cycle_completion(&CycleResult::Failed(failure), &store);

        assert!(processed.refreshed.is_none());
        let error = processed.error.unwrap();
        assert!(error.contains("good-night dream --quiet"));
        assert!(error.contains("line one\nline two"));
    }
}
