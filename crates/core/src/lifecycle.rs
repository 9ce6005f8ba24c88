//! Lifecycle state machines and the append-only transition log.
//!
//! Every state type declares a fixed adjacency table. A [`Transition`] can only
//! be created for a move present in that table, and once appended to a
//! [`TransitionLog`] it is never mutated or removed.

use crate::error::{EngineError, EngineResult};
use crate::types::JobStatus;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A state type with a fixed adjacency table
pub trait Lifecycle:
    Copy + Eq + Hash + Debug + Display + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// States reachable from `self` in one move
    fn successors(&self) -> &'static [Self];

    fn can_transition_to(&self, to: Self) -> bool {
        self.successors().contains(&to)
    }

    fn is_final(&self) -> bool {
        self.successors().is_empty()
    }
}

impl Lifecycle for JobStatus {
    fn successors(&self) -> &'static [Self] {
        match self {
            JobStatus::Queued => &[JobStatus::Processing, JobStatus::Cancelled],
            JobStatus::Processing => &[
                JobStatus::Completed,
                JobStatus::Queued,
                JobStatus::Failed,
                JobStatus::Cancelled,
            ],
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => &[],
        }
    }
}

/// States of a document moving through the drafting pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentState {
    Ingested,
    Classified,
    AnalysisPending,
    AnalysisComplete,
    ModeSelected,
    DraftPending,
    DraftReady,
    AttorneyReviewPending,
    RevisionRequested,
    Approved,
    Filed,
    Rejected,
}

/// Coarse grouping of document states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateCategory {
    Intake,
    Analysis,
    Drafting,
    Review,
    Final,
}

impl DocumentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentState::Ingested => "ingested",
            DocumentState::Classified => "classified",
            DocumentState::AnalysisPending => "analysis_pending",
            DocumentState::AnalysisComplete => "analysis_complete",
            DocumentState::ModeSelected => "mode_selected",
            DocumentState::DraftPending => "draft_pending",
            DocumentState::DraftReady => "draft_ready",
            DocumentState::AttorneyReviewPending => "attorney_review_pending",
            DocumentState::RevisionRequested => "revision_requested",
            DocumentState::Approved => "approved",
            DocumentState::Filed => "filed",
            DocumentState::Rejected => "rejected",
        }
    }

    pub fn category(&self) -> StateCategory {
        match self {
            DocumentState::Ingested | DocumentState::Classified => StateCategory::Intake,
            DocumentState::AnalysisPending | DocumentState::AnalysisComplete => {
                StateCategory::Analysis
            }
            DocumentState::ModeSelected
            | DocumentState::DraftPending
            | DocumentState::DraftReady
            | DocumentState::RevisionRequested => StateCategory::Drafting,
            DocumentState::AttorneyReviewPending | DocumentState::Approved => {
                StateCategory::Review
            }
            DocumentState::Filed | DocumentState::Rejected => StateCategory::Final,
        }
    }
}

impl Display for DocumentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Lifecycle for DocumentState {
    fn successors(&self) -> &'static [Self] {
        use DocumentState::*;
        match self {
            Ingested => &[Classified, Rejected],
            Classified => &[AnalysisPending],
            AnalysisPending => &[AnalysisComplete],
            AnalysisComplete => &[ModeSelected],
            ModeSelected => &[DraftPending],
            DraftPending => &[DraftReady],
            DraftReady => &[AttorneyReviewPending],
            AttorneyReviewPending => &[Approved, RevisionRequested, Rejected],
            RevisionRequested => &[DraftPending],
            Approved => &[Filed],
            Filed | Rejected => &[],
        }
    }
}

/// One recorded lifecycle move
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition<S> {
    pub entity_id: String,
    pub from: S,
    pub to: S,
    pub actor: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Create a transition, rejecting moves missing from the adjacency table
pub fn create_transition<S: Lifecycle>(
    entity_id: impl Into<String>,
    from: S,
    to: S,
    actor: impl Into<String>,
    reason: impl Into<String>,
) -> EngineResult<Transition<S>> {
    if !from.can_transition_to(to) {
        return Err(EngineError::invalid_transition(from, to));
    }

    Ok(Transition {
        entity_id: entity_id.into(),
        from,
        to,
        actor: actor.into(),
        reason: reason.into(),
        timestamp: Utc::now(),
    })
}

/// Append-only storage for transitions
#[async_trait::async_trait]
pub trait TransitionLog<S: Lifecycle>: Send + Sync {
    /// Append a transition to its entity's history
    async fn append(&self, transition: Transition<S>) -> anyhow::Result<()>;

    /// All transitions of an entity, oldest first
    async fn history(&self, entity_id: &str) -> anyhow::Result<Vec<Transition<S>>>;
}

/// Transition log kept in process memory
pub struct InMemoryTransitionLog<S> {
    entries: RwLock<HashMap<String, Vec<Transition<S>>>>,
}

impl<S: Lifecycle> InMemoryTransitionLog<S> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<S: Lifecycle> Default for InMemoryTransitionLog<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl<S: Lifecycle> TransitionLog<S> for InMemoryTransitionLog<S> {
    async fn append(&self, transition: Transition<S>) -> anyhow::Result<()> {
        self.entries
            .write()
            .await
            .entry(transition.entity_id.clone())
            .or_default()
            .push(transition);
        Ok(())
    }

    async fn history(&self, entity_id: &str) -> anyhow::Result<Vec<Transition<S>>> {
        Ok(self
            .entries
            .read()
            .await
            .get(entity_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Tracks the current state of each entity and records every move it makes
pub struct LifecycleTracker<S: Lifecycle> {
    log: Arc<dyn TransitionLog<S>>,
    initial: S,
    current: RwLock<HashMap<String, S>>,
}

impl<S: Lifecycle> LifecycleTracker<S> {
    /// Entities without history start in `initial`
    pub fn new(log: Arc<dyn TransitionLog<S>>, initial: S) -> Self {
        Self {
            log,
            initial,
            current: RwLock::new(HashMap::new()),
        }
    }

    pub async fn current_state(&self, entity_id: &str) -> EngineResult<S> {
        if let Some(state) = self.current.read().await.get(entity_id) {
            return Ok(*state);
        }
        self.replayed_state(entity_id).await
    }

    /// Move an entity to `to`. Rejected moves are returned as errors and not logged.
    pub async fn advance(
        &self,
        entity_id: &str,
        to: S,
        actor: &str,
        reason: &str,
    ) -> EngineResult<Transition<S>> {
        let mut current = self.current.write().await;
        let from = match current.get(entity_id) {
            Some(state) => *state,
            None => self.replayed_state(entity_id).await?,
        };

        let transition = match create_transition(entity_id, from, to, actor, reason) {
            Ok(transition) => transition,
            Err(e) => {
                tracing::warn!(
                    "Rejected transition for {}: {} -> {} by {}",
                    entity_id,
                    from,
                    to,
                    actor
                );
                return Err(e);
            }
        };

        self.log.append(transition.clone()).await?;
        current.insert(entity_id.to_string(), to);

        tracing::info!("{}: {} -> {} ({})", entity_id, from, to, reason);
        Ok(transition)
    }

    pub async fn history(&self, entity_id: &str) -> EngineResult<Vec<Transition<S>>> {
        Ok(self.log.history(entity_id).await?)
    }

    async fn replayed_state(&self, entity_id: &str) -> EngineResult<S> {
        let history = self.log.history(entity_id).await?;
        Ok(history.last().map(|t| t.to).unwrap_or(self.initial))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_document_transition() {
        let transition = create_transition(
            "doc-1",
            DocumentState::Ingested,
            DocumentState::Classified,
            "attorney@example.com",
            "Auto-classification",
        )
        .unwrap();

        assert_eq!(transition.from, DocumentState::Ingested);
        assert_eq!(transition.to, DocumentState::Classified);
        assert_eq!(transition.reason, "Auto-classification");
    }

    #[test]
    fn test_invalid_document_transition_rejected() {
        let result = create_transition(
            "doc-1",
            DocumentState::Ingested,
            DocumentState::DraftReady,
            "system",
            "skip ahead",
        );

        assert!(matches!(
            result,
            Err(EngineError::InvalidTransition { ref from, ref to })
                if from == "ingested" && to == "draft_ready"
        ));
    }

    #[test]
    fn test_job_status_graph() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Processing));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Queued));
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Cancelled));
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Completed));
        for terminal in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            assert!(terminal.is_final());
        }
    }

    #[test]
    fn test_document_categories() {
        assert_eq!(DocumentState::Ingested.category(), StateCategory::Intake);
        assert_eq!(DocumentState::DraftPending.category(), StateCategory::Drafting);
        assert_eq!(
            DocumentState::AttorneyReviewPending.category(),
            StateCategory::Review
        );
        assert_eq!(DocumentState::Filed.category(), StateCategory::Final);
    }

    #[tokio::test]
    async fn test_tracker_records_ordered_history() {
        let log: Arc<dyn TransitionLog<DocumentState>> = Arc::new(InMemoryTransitionLog::new());
        let tracker = LifecycleTracker::new(log, DocumentState::Ingested);

        for (to, reason) in [
            (DocumentState::Classified, "Auto-classification"),
            (DocumentState::AnalysisPending, "Starting analysis"),
            (DocumentState::AnalysisComplete, "Analysis completed"),
        ] {
            tracker.advance("doc-7", to, "user-1", reason).await.unwrap();
        }

        let history = tracker.history("doc-7").await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].from, DocumentState::Ingested);
        assert_eq!(history[2].to, DocumentState::AnalysisComplete);
        assert!(history.windows(2).all(|w| w[0].to == w[1].from));
        assert_eq!(
            tracker.current_state("doc-7").await.unwrap(),
            DocumentState::AnalysisComplete
        );
    }

    #[tokio::test]
    async fn test_tracker_rejection_is_not_logged() {
        let log: Arc<dyn TransitionLog<DocumentState>> = Arc::new(InMemoryTransitionLog::new());
        let tracker = LifecycleTracker::new(log, DocumentState::Ingested);

        tracker
            .advance("doc-9", DocumentState::Classified, "user-1", "classified")
            .await
            .unwrap();
        let err = tracker
            .advance("doc-9", DocumentState::Filed, "user-1", "file it")
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::InvalidTransition { .. }));
        assert_eq!(tracker.history("doc-9").await.unwrap().len(), 1);
        assert_eq!(
            tracker.current_state("doc-9").await.unwrap(),
            DocumentState::Classified
        );
    }

    #[tokio::test]
    async fn test_tracker_resumes_from_existing_log() {
        let log: Arc<dyn TransitionLog<DocumentState>> = Arc::new(InMemoryTransitionLog::new());
        log.append(
            create_transition(
                "doc-3",
                DocumentState::Ingested,
                DocumentState::Classified,
                "system",
                "earlier run",
            )
            .unwrap(),
        )
        .await
        .unwrap();

        let tracker = LifecycleTracker::new(log, DocumentState::Ingested);
        assert_eq!(
            tracker.current_state("doc-3").await.unwrap(),
            DocumentState::Classified
        );
        tracker
            .advance("doc-3", DocumentState::AnalysisPending, "system", "resume")
            .await
            .unwrap();
    }
}
