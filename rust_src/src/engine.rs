//! The adaptive testing engine: session lifecycle over a shared item pool.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info, instrument};

use crate::bank::ItemSource;
use crate::clock::{Clock, SystemClock, seconds_between};
use crate::error::{CatError, Result};
use crate::exposure::{AcceptanceMap, AcceptanceSource, ExposureTableHandle};
use crate::irt::Irt3pl;
use crate::item::{Item, ItemId};
use crate::policy::{AcceptanceMode, InitialItemRule, SessionPolicy};
use crate::scoring::{BatchScorer, Criterion, ScalarScorer};
use crate::selector::{SelectionOutcome, SelectionRequest, Selector};
use crate::session::{
    AnswerOutcome, AnswerRequest, AnswerResponse, SessionState, SessionStatus, SessionSummary,
    StartResponse, TerminationReason,
};
use crate::store::{InMemorySessionStore, SessionStore, new_session_id};

/// `Send + Sync`; one engine serves every session.
pub struct CatEngine {
    model: Irt3pl,
    scorer: Arc<dyn BatchScorer>,
    selector: Selector,
    items: Arc<dyn ItemSource>,
    acceptance: Arc<dyn AcceptanceSource>,
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    /// Pool-wide administrations per item.
    exposure: DashMap<ItemId, u64>,
    default_policy: SessionPolicy,
}

impl CatEngine {
    /// In-memory store, system clock, scalar scoring, D = 1 and an empty
    /// exposure table.
    pub fn new(items: Arc<dyn ItemSource>) -> Self {
        let model = Irt3pl::default();
        let scorer: Arc<dyn BatchScorer> = Arc::new(ScalarScorer);
        Self {
            model,
            selector: Selector::new(model, scorer.clone()),
            scorer,
            items,
            acceptance: Arc::new(ExposureTableHandle::new()),
            store: Arc::new(InMemorySessionStore::new()),
            clock: Arc::new(SystemClock),
            exposure: DashMap::new(),
            default_policy: SessionPolicy::default(),
        }
    }

    pub fn with_model(mut self, model: Irt3pl) -> Self {
        self.model = model;
        self.selector = Selector::new(model, self.scorer.clone());
        self
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn BatchScorer>) -> Self {
        self.selector = Selector::new(self.model, scorer.clone());
        self.scorer = scorer;
        self
    }

    pub fn with_acceptance(mut self, acceptance: Arc<dyn AcceptanceSource>) -> Self {
        self.acceptance = acceptance;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_default_policy(mut self, policy: SessionPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    pub fn model(&self) -> &Irt3pl {
        &self.model
    }

    pub fn default_policy(&self) -> &SessionPolicy {
        &self.default_policy
    }

    pub fn session_count(&self) -> usize {
        self.store.len()
    }

    /// Pool-wide administrations of `item_id`, bank count included.
    pub fn exposure_count(&self, item_id: &str) -> Option<u64> {
        self.exposure.get(item_id).map(|c| *c)
    }

    fn load_pool(&self) -> Result<Arc<Vec<Item>>> {
        self.items.load_items()
    }

    fn acceptance_for(&self, policy: &SessionPolicy) -> Result<Arc<AcceptanceMap>> {
        match policy.selection.acceptance {
            AcceptanceMode::Off => Ok(Arc::new(AcceptanceMap::new())),
            AcceptanceMode::Exposure => self.acceptance.load(),
        }
    }

    fn exposure_snapshot(&self, pool: &[Item]) -> HashMap<ItemId, u64> {
        pool.iter()
            .filter_map(|item| {
                self.exposure
                    .get(&item.id)
                    .map(|count| (item.id.clone(), *count))
            })
            .collect()
    }

    fn select_for(
        &self,
        state: &SessionState,
        pool: &[Item],
        acceptance: &AcceptanceMap,
    ) -> SelectionOutcome {
        let policy = &state.policy;
        let exposure = self.exposure_snapshot(pool);
        let last_topics = state.last_topics();

        let criterion = if state.items_answered() == 0
            && policy.selection.initial_item == InitialItemRule::ClosestDifficulty
        {
            Criterion::DifficultyProximity
        } else {
            policy.selection.criterion
        };

        let request = SelectionRequest {
            theta: state.theta,
            pool,
            used: &state.used,
            policy: &policy.selection,
            exposure_counts: &exposure,
            content_counts: &state.content_counts,
            last_topics: &last_topics,
            acceptance,
            criterion,
        };
        let mut rng = Selector::rng_for(&policy.selection, state.items_answered());
        self.selector.select_next(&request, &mut rng)
    }

    fn terminate(state: &mut SessionState, reason: TerminationReason) -> AnswerOutcome {
        state.status = SessionStatus::Terminated { reason };
        state.pending_item = None;
        info!(
            session_id = %state.id,
            %reason,
            items = state.items_answered(),
            theta = state.theta,
            se = state.se,
            "session terminated"
        );
        AnswerOutcome::Terminated { reason }
    }

    /// Stop rules, then selection.
    fn advance(
        &self,
        state: &mut SessionState,
        pool: &[Item],
        acceptance: &AcceptanceMap,
        finish_now: bool,
        now: DateTime<Utc>,
    ) -> AnswerOutcome {
        if let Some(reason) = state.evaluate_stop(finish_now, now) {
            return Self::terminate(state, reason);
        }
        match self.select_for(state, pool, acceptance) {
            SelectionOutcome::Exhausted => Self::terminate(state, TerminationReason::PoolExhausted),
            SelectionOutcome::Selected(selection) => {
                state.status = SessionStatus::Active;
                state.pending_item = Some(selection.item.id.clone());
                AnswerOutcome::Continue {
                    next: selection.item.view(),
                }
            }
        }
    }

    /// Open a session with an explicit policy snapshot.
    #[instrument(skip(self, policy))]
    pub fn start(&self, policy: SessionPolicy, theta0: f64) -> Result<StartResponse> {
        policy.validate()?;
        let pool = self.load_pool()?;
        let now = self.clock.now();
        let acceptance = self.acceptance_for(&policy)?;
        let mut state = SessionState::new(new_session_id(), policy, theta0, now);

        let next_item = match self.select_for(&state, &pool, &acceptance) {
            SelectionOutcome::Selected(selection) => {
                state.pending_item = Some(selection.item.id.clone());
                Some(selection.item.view())
            }
            SelectionOutcome::Exhausted => {
                Self::terminate(&mut state, TerminationReason::PoolExhausted);
                None
            }
        };

        info!(session_id = %state.id, theta0 = state.theta, "session started");
        let response = StartResponse {
            session_id: state.id.clone(),
            theta: state.theta,
            se: state.se,
            next_item,
            policy: state.policy.clone(),
            terminated: state.termination().is_some(),
            reason: state.termination(),
        };
        self.store.put(state);
        Ok(response)
    }

    /// Open a session with the engine's default policy.
    pub fn start_default(&self, theta0: f64) -> Result<StartResponse> {
        self.start(self.default_policy.clone(), theta0)
    }

    /// Score one answer and decide what comes next.
    ///
    /// The session stays locked for the whole step, so a double submit of
    /// the same item is rejected as a duplicate. Anything that can fail is
    /// resolved before the answer is recorded; once recorded, the step
    /// always yields a response.
    #[instrument(skip(self, request), fields(session_id = %request.session_id, item_id = %request.item_id))]
    pub fn answer(&self, request: AnswerRequest) -> Result<AnswerResponse> {
        let handle = self
            .store
            .get(&request.session_id)
            .ok_or_else(|| CatError::UnknownSession(request.session_id.clone()))?;
        let mut state = handle.lock();
        let now = self.clock.now();

        if let Some(reason) = state.termination() {
            debug!(%reason, "answer to terminated session");
            return Ok(AnswerResponse::new(&state, AnswerOutcome::Terminated { reason }, now));
        }

        let pool = self.load_pool()?;
        let item = pool
            .iter()
            .find(|item| item.id == request.item_id)
            .ok_or_else(|| CatError::UnknownItem(request.item_id.clone()))?;
        if state.used.contains(&item.id) {
            return Err(CatError::DuplicateResponse {
                session_id: state.id.clone(),
                item_id: item.id.clone(),
            });
        }

        let cooldown = state.cooldown_until(now);
        let acceptance = match cooldown {
            Some(_) => None,
            None => Some(self.acceptance_for(&state.policy)?),
        };

        state.record_answer(&self.model, item, request.correct, now);
        *self
            .exposure
            .entry(item.id.clone())
            .or_insert(item.exposure_count) += 1;
        debug!(
            correct = request.correct,
            theta = state.theta,
            se = state.se,
            items = state.items_answered(),
            "answer scored"
        );

        let outcome = match (cooldown, acceptance) {
            (Some(until), _) => {
                state.status = SessionStatus::Cooldown { until };
                let remaining = seconds_between(now, until).max(0.0);
                debug!(remaining, "cooldown");
                AnswerOutcome::Cooldown { remaining }
            }
            (None, acceptance) => {
                let acceptance = acceptance.unwrap_or_default();
                self.advance(&mut state, &pool, &acceptance, request.finish_now, now)
            }
        };
        Ok(AnswerResponse::new(&state, outcome, now))
    }

    /// Serve the next item without an answer, e.g. once a cooldown ends.
    /// Returns the pending item again if one is outstanding.
    #[instrument(skip(self))]
    pub fn next_item(&self, session_id: &str) -> Result<AnswerResponse> {
        let handle = self
            .store
            .get(session_id)
            .ok_or_else(|| CatError::UnknownSession(session_id.to_string()))?;
        let mut state = handle.lock();
        let now = self.clock.now();

        let status = state.status;
        let outcome = match status {
            SessionStatus::Terminated { reason } => AnswerOutcome::Terminated { reason },
            SessionStatus::Cooldown { until } if now < until => AnswerOutcome::Cooldown {
                remaining: seconds_between(now, until).max(0.0),
            },
            _ => {
                let pool = self.load_pool()?;
                let pending = state
                    .pending_item
                    .as_ref()
                    .and_then(|id| pool.iter().find(|item| &item.id == id));
                match pending {
                    Some(item) => AnswerOutcome::Continue { next: item.view() },
                    None => {
                        let acceptance = self.acceptance_for(&state.policy)?;
                        self.advance(&mut state, &pool, &acceptance, false, now)
                    }
                }
            }
        };
        Ok(AnswerResponse::new(&state, outcome, now))
    }

    /// Terminate with `manual_finish` unless already terminated.
    #[instrument(skip(self))]
    pub fn finish(&self, session_id: &str) -> Result<AnswerResponse> {
        let handle = self
            .store
            .get(session_id)
            .ok_or_else(|| CatError::UnknownSession(session_id.to_string()))?;
        let mut state = handle.lock();
        let now = self.clock.now();
        let outcome = match state.termination() {
            Some(reason) => AnswerOutcome::Terminated { reason },
            None => Self::terminate(&mut state, TerminationReason::ManualFinish),
        };
        Ok(AnswerResponse::new(&state, outcome, now))
    }

    pub fn summary(&self, session_id: &str) -> Result<SessionSummary> {
        let handle = self
            .store
            .get(session_id)
            .ok_or_else(|| CatError::UnknownSession(session_id.to_string()))?;
        let state = handle.lock();
        Ok(SessionSummary::new(&state, &self.model, self.clock.now()))
    }

    /// Remove the session from the store, returning its final summary.
    #[instrument(skip(self))]
    pub fn close(&self, session_id: &str) -> Result<SessionSummary> {
        let handle = self
            .store
            .delete(session_id)
            .ok_or_else(|| CatError::UnknownSession(session_id.to_string()))?;
        let state = handle.lock();
        info!(items = state.items_answered(), "session closed");
        Ok(SessionSummary::new(&state, &self.model, self.clock.now()))
    }
}
