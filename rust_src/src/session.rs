//! Per-session state, stop rules and the responses handed back to callers.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::seconds_between;
use crate::irt::{AbilityEstimate, Irt3pl, ScoredResponse, prior_precision};
use crate::item::{Item, ItemId, ItemParams, ItemView};
use crate::policy::{CatMode, SessionPolicy};
use crate::utils::clamp_theta;

pub type SessionId = String;

/// Reason string reported while a session is cooling down.
pub const COOLDOWN_REASON: &str = "cooldown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    ManualFinish,
    MaxItems,
    TimeLimit,
    SemThreshold,
    PoolExhausted,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::ManualFinish => "manual_finish",
            TerminationReason::MaxItems => "max_items",
            TerminationReason::TimeLimit => "time_limit",
            TerminationReason::SemThreshold => "sem_threshold",
            TerminationReason::PoolExhausted => "pool_exhausted",
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Cooldown { until: DateTime<Utc> },
    Terminated { reason: TerminationReason },
}

/// One administered item and what it did to the estimate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionResponse {
    pub item_id: ItemId,
    pub topic: String,
    pub params: ItemParams,
    pub correct: bool,
    pub answered_at: DateTime<Utc>,
    pub theta_after: f64,
    pub se_after: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub id: SessionId,
    pub policy: SessionPolicy,
    pub theta: f64,
    pub se: f64,
    /// Test information at the current θ.
    pub information: f64,
    /// In administration order, no duplicates.
    pub administered: Vec<ItemId>,
    pub used: HashSet<ItemId>,
    pub responses: Vec<SessionResponse>,
    pub exposure_counts: HashMap<ItemId, u32>,
    pub content_counts: HashMap<String, usize>,
    /// Most recent topic at the back.
    pub topic_history: VecDeque<String>,
    pub started_at: DateTime<Utc>,
    pub last_answer_at: Option<DateTime<Utc>>,
    pub pending_item: Option<ItemId>,
    pub status: SessionStatus,
}

impl SessionState {
    pub fn new(id: SessionId, policy: SessionPolicy, theta0: f64, started_at: DateTime<Utc>) -> Self {
        let theta = clamp_theta(theta0);
        let se = 1.0 / prior_precision(policy.stop.prior_sd).sqrt();
        Self {
            id,
            policy,
            theta,
            se,
            information: 0.0,
            administered: Vec::new(),
            used: HashSet::new(),
            responses: Vec::new(),
            exposure_counts: HashMap::new(),
            content_counts: HashMap::new(),
            topic_history: VecDeque::new(),
            started_at,
            last_answer_at: None,
            pending_item: None,
            status: SessionStatus::Active,
        }
    }

    pub fn items_answered(&self) -> usize {
        self.administered.len()
    }

    pub fn termination(&self) -> Option<TerminationReason> {
        match self.status {
            SessionStatus::Terminated { reason } => Some(reason),
            _ => None,
        }
    }

    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> f64 {
        seconds_between(self.started_at, now).max(0.0)
    }

    fn history_len(&self) -> usize {
        self.policy.selection.avoid_repeat_window.max(1)
    }

    pub fn last_topics(&self) -> Vec<String> {
        self.topic_history.iter().cloned().collect()
    }

    pub fn history(&self) -> Vec<ScoredResponse> {
        self.responses
            .iter()
            .map(|r| ScoredResponse::new(r.params, r.correct))
            .collect()
    }

    /// When an answer at `now` falls inside the cooldown, the instant the
    /// cooldown ends. Measured from the previous answer.
    pub fn cooldown_until(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let cooldown = self.policy.stop.item_cooldown_seconds?;
        let last = self.last_answer_at?;
        if seconds_between(last, now) < cooldown {
            Some(last + TimeDelta::milliseconds((cooldown * 1000.0).round() as i64))
        } else {
            None
        }
    }

    /// Score one answer: sequential MAP step with the current estimate as
    /// the prior, then information and SE over every administered item.
    pub fn record_answer(&mut self, model: &Irt3pl, item: &Item, correct: bool, now: DateTime<Utc>) {
        let stop = &self.policy.stop;
        self.theta = model.one_step_map_update(
            self.theta,
            &item.params,
            correct,
            self.theta,
            self.se,
            stop.step_cap,
        );

        self.administered.push(item.id.clone());
        self.used.insert(item.id.clone());
        self.responses.push(SessionResponse {
            item_id: item.id.clone(),
            topic: item.topic.clone(),
            params: item.params,
            correct,
            answered_at: now,
            theta_after: self.theta,
            se_after: f64::NAN,
        });

        let params: Vec<&ItemParams> = self.responses.iter().map(|r| &r.params).collect();
        self.information = model.test_information(self.theta, params.iter().copied());
        self.se = model.standard_error(
            self.theta,
            params.iter().copied(),
            prior_precision(self.policy.stop.prior_sd),
        );
        if let Some(last) = self.responses.last_mut() {
            last.se_after = self.se;
        }

        *self.exposure_counts.entry(item.id.clone()).or_insert(0) += 1;
        *self.content_counts.entry(item.topic.clone()).or_insert(0) += 1;
        self.topic_history.push_back(item.topic.clone());
        while self.topic_history.len() > self.history_len() {
            self.topic_history.pop_front();
        }

        self.pending_item = None;
        self.last_answer_at = Some(now);
    }

    /// Stop rules in priority order, excluding pool exhaustion which needs
    /// the selector.
    pub fn evaluate_stop(&self, finish_now: bool, now: DateTime<Utc>) -> Option<TerminationReason> {
        let stop = &self.policy.stop;
        let answered = self.items_answered();
        let elapsed = self.elapsed_seconds(now);

        if finish_now {
            return Some(TerminationReason::ManualFinish);
        }
        if answered >= stop.max_items {
            return Some(TerminationReason::MaxItems);
        }
        if stop.max_test_seconds.is_some_and(|limit| elapsed >= limit) {
            return Some(TerminationReason::TimeLimit);
        }
        if stop.mode == CatMode::Variable
            && answered >= stop.min_items
            && self.se <= stop.sem_threshold
            && elapsed >= stop.min_test_seconds.unwrap_or(0.0)
        {
            return Some(TerminationReason::SemThreshold);
        }
        None
    }
}

/// What the caller should do next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnswerOutcome {
    Continue { next: ItemView },
    Cooldown { remaining: f64 },
    Terminated { reason: TerminationReason },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerRequest {
    pub session_id: SessionId,
    pub item_id: ItemId,
    pub correct: bool,
    #[serde(default)]
    pub finish_now: bool,
}

impl AnswerRequest {
    pub fn new(session_id: impl Into<SessionId>, item_id: impl Into<ItemId>, correct: bool) -> Self {
        Self {
            session_id: session_id.into(),
            item_id: item_id.into(),
            correct,
            finish_now: false,
        }
    }

    pub fn finishing(mut self) -> Self {
        self.finish_now = true;
        self
    }
}

/// Flat answer response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerResponse {
    pub session_id: SessionId,
    pub theta: f64,
    pub se: f64,
    pub next_item: Option<ItemView>,
    pub terminated: bool,
    /// Termination reason, or `"cooldown"`.
    pub reason: Option<String>,
    pub items_answered: usize,
    pub elapsed_seconds: f64,
    pub cooldown_remaining: Option<f64>,
    pub outcome: AnswerOutcome,
}

impl AnswerResponse {
    pub fn new(state: &SessionState, outcome: AnswerOutcome, now: DateTime<Utc>) -> Self {
        let (next_item, terminated, reason, cooldown_remaining) = match &outcome {
            AnswerOutcome::Continue { next } => (Some(next.clone()), false, None, None),
            AnswerOutcome::Cooldown { remaining } => {
                (None, false, Some(COOLDOWN_REASON.to_string()), Some(*remaining))
            }
            AnswerOutcome::Terminated { reason } => {
                (None, true, Some(reason.as_str().to_string()), None)
            }
        };
        Self {
            session_id: state.id.clone(),
            theta: state.theta,
            se: state.se,
            next_item,
            terminated,
            reason,
            items_answered: state.items_answered(),
            elapsed_seconds: state.elapsed_seconds(now),
            cooldown_remaining,
            outcome,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartResponse {
    pub session_id: SessionId,
    pub theta: f64,
    pub se: f64,
    pub next_item: Option<ItemView>,
    pub policy: SessionPolicy,
    pub terminated: bool,
    pub reason: Option<TerminationReason>,
}

/// Estimates over the full history of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub items_answered: usize,
    pub administered: Vec<ItemId>,
    /// Sequential MAP estimate the session ran on.
    pub map: AbilityEstimate,
    pub eap: AbilityEstimate,
    /// `None` before the first answer.
    pub mle: Option<AbilityEstimate>,
    pub elapsed_seconds: f64,
}

impl SessionSummary {
    pub fn new(state: &SessionState, model: &Irt3pl, now: DateTime<Utc>) -> Self {
        let history = state.history();
        let stop = &state.policy.stop;
        let map = AbilityEstimate {
            theta: state.theta,
            se: state.se,
            iterations: history.len(),
            converged: true,
        };
        let eap = model.eap_estimate(&history, stop.prior_mean, stop.prior_sd);
        let mle = (!history.is_empty()).then(|| model.mle_estimate(&history, state.theta, 50, 1e-6));
        Self {
            session_id: state.id.clone(),
            status: state.status,
            items_answered: state.items_answered(),
            administered: state.administered.clone(),
            map,
            eap,
            mle,
            elapsed_seconds: state.elapsed_seconds(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(policy: SessionPolicy) -> SessionState {
        SessionState::new("s1".into(), policy, 0.0, DateTime::<Utc>::UNIX_EPOCH)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + TimeDelta::seconds(secs)
    }

    fn item(id: &str, b: f64, topic: &str) -> Item {
        Item::new(id, 1.2, b, 0.2, topic).unwrap()
    }

    #[test]
    fn new_session_starts_at_prior() {
        let s = state(SessionPolicy::default());
        assert_eq!(s.theta, 0.0);
        assert!((s.se - 1.0).abs() < 1e-12);
        assert_eq!(s.status, SessionStatus::Active);
        assert_eq!(s.items_answered(), 0);
    }

    #[test]
    fn answers_move_theta_and_shrink_se() {
        let model = Irt3pl::default();
        let mut s = state(SessionPolicy::default());
        s.record_answer(&model, &item("q1", 0.0, "a"), true, at(1));
        assert!(s.theta > 0.0);
        let se1 = s.se;
        assert!(se1 < 1.0);

        let theta1 = s.theta;
        s.record_answer(&model, &item("q2", 0.5, "b"), false, at(2));
        assert!(s.theta < theta1);
        assert!(s.se < se1);
        assert_eq!(s.administered, vec!["q1".to_string(), "q2".to_string()]);
        assert_eq!(s.responses[1].se_after, s.se);
        assert_eq!(s.last_answer_at, Some(at(2)));
    }

    #[test]
    fn topic_history_is_bounded() {
        let model = Irt3pl::default();
        let mut policy = SessionPolicy::default();
        policy.selection.avoid_repeat_window = 2;
        let mut s = state(policy);
        for (i, topic) in ["a", "b", "c"].iter().enumerate() {
            s.record_answer(&model, &item(&format!("q{i}"), 0.0, topic), true, at(i as i64));
        }
        assert_eq!(s.last_topics(), vec!["b".to_string(), "c".to_string()]);
        assert_eq!(s.content_counts["a"], 1);
    }

    #[test]
    fn cooldown_measured_from_last_answer() {
        let model = Irt3pl::default();
        let mut policy = SessionPolicy::default();
        policy.stop.item_cooldown_seconds = Some(5.0);
        let mut s = state(policy);
        assert_eq!(s.cooldown_until(at(0)), None);

        s.record_answer(&model, &item("q1", 0.0, "a"), true, at(10));
        assert_eq!(s.cooldown_until(at(12)), Some(at(15)));
        assert_eq!(s.cooldown_until(at(15)), None);
    }

    #[test]
    fn stop_rule_priority() {
        let model = Irt3pl::default();
        let mut policy = SessionPolicy::fixed_length(1);
        policy.stop.max_test_seconds = Some(10.0);
        let mut s = state(policy);
        assert_eq!(s.evaluate_stop(false, at(0)), None);
        assert_eq!(s.evaluate_stop(true, at(0)), Some(TerminationReason::ManualFinish));
        assert_eq!(s.evaluate_stop(false, at(11)), Some(TerminationReason::TimeLimit));

        s.record_answer(&model, &item("q1", 0.0, "a"), true, at(1));
        assert_eq!(s.evaluate_stop(false, at(11)), Some(TerminationReason::MaxItems));
        assert_eq!(s.evaluate_stop(true, at(1)), Some(TerminationReason::ManualFinish));
    }

    #[test]
    fn sem_rule_needs_min_items_and_time() {
        let mut policy = SessionPolicy::default();
        policy.stop.min_items = 2;
        policy.stop.sem_threshold = 0.5;
        policy.stop.min_test_seconds = Some(60.0);
        let mut s = state(policy);
        s.se = 0.4;
        assert_eq!(s.evaluate_stop(false, at(100)), None);

        s.administered = vec!["q1".into(), "q2".into()];
        assert_eq!(s.evaluate_stop(false, at(30)), None);
        assert_eq!(s.evaluate_stop(false, at(60)), Some(TerminationReason::SemThreshold));

        s.policy.stop.mode = CatMode::Fixed;
        assert_eq!(s.evaluate_stop(false, at(60)), None);
    }

    #[test]
    fn flat_response_carries_reason_strings() {
        let s = state(SessionPolicy::default());
        let r = AnswerResponse::new(&s, AnswerOutcome::Cooldown { remaining: 4.0 }, at(1));
        assert!(!r.terminated);
        assert_eq!(r.reason.as_deref(), Some("cooldown"));
        assert_eq!(r.next_item, None);
        assert_eq!(r.cooldown_remaining, Some(4.0));

        let r = AnswerResponse::new(
            &s,
            AnswerOutcome::Terminated {
                reason: TerminationReason::MaxItems,
            },
            at(1),
        );
        assert!(r.terminated);
        assert_eq!(r.reason.as_deref(), Some("max_items"));

        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["outcome"]["kind"], "terminated");
        assert_eq!(json["outcome"]["reason"], "max_items");
    }

    #[test]
    fn summary_reports_all_estimators() {
        let model = Irt3pl::default();
        let mut s = state(SessionPolicy::default());
        assert!(SessionSummary::new(&s, &model, at(0)).mle.is_none());

        s.record_answer(&model, &item("q1", 0.0, "a"), true, at(1));
        s.record_answer(&model, &item("q2", 1.0, "a"), false, at(2));
        let summary = SessionSummary::new(&s, &model, at(3));
        assert_eq!(summary.items_answered, 2);
        assert!(summary.mle.is_some());
        assert!(summary.eap.se > 0.0 && summary.eap.se < 1.0);
        assert_eq!(summary.map.theta, s.theta);
    }
}
