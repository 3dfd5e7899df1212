//! Mutable bookkeeping for one generation run.
//!
//! [`GenerationState`] is owned by the run loop and is its only writer.
//! Validation futures return verdicts; the loop integrates them here one at a
//! time, so quota and fingerprint updates are never interleaved.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::generator::resolver::ExhaustionReason;
use crate::generator::BindingAssignment;
use crate::pattern::Pattern;
use crate::validation::{StageKind, Verdict};

/// Lifecycle of a pattern within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternStatus {
    Active,
    /// No further assignment can be drawn, or the attempt budget is spent.
    Exhausted,
    /// The pattern contributed its maximum share.
    QuotaReached,
    /// The pattern failed to render and was removed from the run.
    Malformed,
}

impl PatternStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PatternStatus::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PatternStatus::Active => "active",
            PatternStatus::Exhausted => "exhausted",
            PatternStatus::QuotaReached => "quota_reached",
            PatternStatus::Malformed => "malformed",
        }
    }
}

impl fmt::Display for PatternStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-pattern counters.
#[derive(Debug)]
pub struct PatternProgress {
    pub pattern: Pattern,
    pub status: PatternStatus,
    /// Every assignment handed out for this pattern.
    pub drawn: HashSet<BindingAssignment>,
    /// Candidates that received a verdict (duplicates excluded).
    pub attempts: usize,
    pub accepted: usize,
    pub rejected: usize,
    /// Candidates skipped because their source was already accepted.
    pub duplicates: usize,
    pub in_flight: usize,
    pub rejected_by_stage: BTreeMap<StageKind, usize>,
    pub exhaustion: Option<ExhaustionReason>,
}

impl PatternProgress {
    fn new(pattern: Pattern) -> Self {
        Self {
            pattern,
            status: PatternStatus::Active,
            drawn: HashSet::new(),
            attempts: 0,
            accepted: 0,
            rejected: 0,
            duplicates: 0,
            in_flight: 0,
            rejected_by_stage: BTreeMap::new(),
            exhaustion: None,
        }
    }
}

/// What integrating a verdict did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Integration {
    /// New sample; forward it to the sink.
    Accepted,
    Rejected(StageKind),
    /// Passed validation, but an identical source was accepted first.
    Duplicate,
}

/// Run-scoped state: per-pattern progress and the accepted fingerprints.
#[derive(Debug)]
pub struct GenerationState {
    patterns: Vec<PatternProgress>,
    cursor: usize,
    fingerprints: HashSet<String>,
    accepted_total: usize,
    in_flight_total: usize,
    target: usize,
    quota_limit: usize,
    max_attempts: Option<usize>,
}

impl GenerationState {
    pub fn new(
        patterns: Vec<Pattern>,
        target: usize,
        quota_limit: usize,
        max_attempts: Option<usize>,
    ) -> Self {
        Self {
            patterns: patterns.into_iter().map(PatternProgress::new).collect(),
            cursor: 0,
            fingerprints: HashSet::new(),
            accepted_total: 0,
            in_flight_total: 0,
            target,
            quota_limit,
            max_attempts,
        }
    }

    /// Adds fingerprints of previously written samples.
    ///
    /// Seeded fingerprints block duplicates but do not count towards the
    /// target.
    pub fn seed_fingerprints<I>(&mut self, fingerprints: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.fingerprints.extend(fingerprints);
    }

    pub fn patterns(&self) -> &[PatternProgress] {
        &self.patterns
    }

    pub fn progress(&self, idx: usize) -> &PatternProgress {
        &self.patterns[idx]
    }

    pub fn progress_mut(&mut self, idx: usize) -> &mut PatternProgress {
        &mut self.patterns[idx]
    }

    pub fn accepted_total(&self) -> usize {
        self.accepted_total
    }

    pub fn in_flight_total(&self) -> usize {
        self.in_flight_total
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn is_complete(&self) -> bool {
        self.accepted_total >= self.target
    }

    /// True when every pattern has reached a terminal status.
    pub fn all_terminal(&self) -> bool {
        self.patterns.iter().all(|p| p.status.is_terminal())
    }

    /// True when dispatching one more candidate cannot overshoot the target.
    pub fn has_capacity(&self) -> bool {
        self.accepted_total + self.in_flight_total < self.target
    }

    pub fn is_known_fingerprint(&self, fingerprint: &str) -> bool {
        self.fingerprints.contains(fingerprint)
    }

    fn can_dispatch(&self, progress: &PatternProgress) -> bool {
        if progress.status != PatternStatus::Active {
            return false;
        }
        if progress.accepted + progress.in_flight >= self.quota_limit {
            return false;
        }
        match self.max_attempts {
            Some(max) => progress.attempts + progress.in_flight < max,
            None => true,
        }
    }

    /// Next pattern in round-robin order that may receive a candidate.
    pub fn next_dispatchable(&mut self) -> Option<usize> {
        let n = self.patterns.len();
        for offset in 0..n {
            let idx = (self.cursor + offset) % n;
            if self.can_dispatch(&self.patterns[idx]) {
                self.cursor = (idx + 1) % n;
                return Some(idx);
            }
        }
        None
    }

    /// Records an assignment as drawn.
    pub fn record_draw(&mut self, idx: usize, assignment: BindingAssignment) {
        self.patterns[idx].drawn.insert(assignment);
    }

    /// Marks a candidate as dispatched for validation.
    pub fn begin(&mut self, idx: usize) {
        self.patterns[idx].in_flight += 1;
        self.in_flight_total += 1;
    }

    /// Records a candidate skipped before validation as a duplicate.
    pub fn record_duplicate(&mut self, idx: usize) {
        self.patterns[idx].duplicates += 1;
    }

    /// Moves an active pattern to a terminal status.
    ///
    /// Returns false if the pattern was already terminal.
    pub fn transition(&mut self, idx: usize, status: PatternStatus) -> bool {
        let progress = &mut self.patterns[idx];
        if progress.status.is_terminal() {
            return false;
        }
        progress.status = status;
        true
    }

    pub fn mark_exhausted(&mut self, idx: usize, reason: ExhaustionReason) -> bool {
        self.patterns[idx].exhaustion = Some(reason);
        self.transition(idx, PatternStatus::Exhausted)
    }

    /// Integrates a verdict for a dispatched candidate of pattern `idx`.
    ///
    /// Also returns the status the pattern entered, if the verdict made it
    /// terminal.
    pub fn integrate(
        &mut self,
        idx: usize,
        verdict: &Verdict,
    ) -> (Integration, Option<PatternStatus>) {
        self.in_flight_total = self.in_flight_total.saturating_sub(1);
        let quota_limit = self.quota_limit;
        let max_attempts = self.max_attempts;

        let integration = {
            let progress = &mut self.patterns[idx];
            progress.in_flight = progress.in_flight.saturating_sub(1);

            if verdict.accepted {
                if self.fingerprints.insert(verdict.fingerprint.clone()) {
                    progress.attempts += 1;
                    progress.accepted += 1;
                    self.accepted_total += 1;
                    Integration::Accepted
                } else {
                    progress.duplicates += 1;
                    Integration::Duplicate
                }
            } else {
                let stage = verdict.failing_stage.unwrap_or(StageKind::Execution);
                progress.attempts += 1;
                progress.rejected += 1;
                *progress.rejected_by_stage.entry(stage).or_default() += 1;
                Integration::Rejected(stage)
            }
        };

        let progress = &self.patterns[idx];
        let next = if progress.accepted >= quota_limit {
            Some(PatternStatus::QuotaReached)
        } else if max_attempts.is_some_and(|max| progress.attempts >= max) {
            Some(PatternStatus::Exhausted)
        } else {
            None
        };

        let entered = match next {
            Some(status) if self.transition(idx, status) => Some(status),
            _ => None,
        };
        (integration, entered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(id: &str) -> Pattern {
        Pattern::new(id, "demo", "x = {{ v }}", "Set x to {{ v }}.")
            .with_binding("v", ["1", "2", "3"])
            .with_check("assert x")
    }

    fn verdict(accepted: bool, fingerprint: &str) -> Verdict {
        Verdict {
            pattern_id: "p".to_string(),
            assignment: BindingAssignment::new(),
            fingerprint: fingerprint.to_string(),
            accepted,
            failing_stage: (!accepted).then_some(StageKind::Style),
            rejection: None,
            advisories: Vec::new(),
            stages_run: Vec::new(),
        }
    }

    #[test]
    fn test_round_robin_selection() {
        let mut state = GenerationState::new(vec![pattern("a"), pattern("b"), pattern("c")], 10, 10, None);
        let order: Vec<usize> = (0..6).filter_map(|_| state.next_dispatchable()).collect();
        assert_eq!(order, vec![0, 1, 2, 0, 1, 2]);

        state.transition(1, PatternStatus::Exhausted);
        let order: Vec<usize> = (0..4).filter_map(|_| state.next_dispatchable()).collect();
        assert_eq!(order, vec![0, 2, 0, 2]);
    }

    #[test]
    fn test_quota_counts_in_flight() {
        let mut state = GenerationState::new(vec![pattern("a")], 10, 2, None);
        state.begin(0);
        state.begin(0);
        assert_eq!(state.next_dispatchable(), None);

        let (integration, entered) = state.integrate(0, &verdict(true, "f1"));
        assert_eq!(integration, Integration::Accepted);
        assert_eq!(entered, None);
        assert_eq!(state.next_dispatchable(), None);

        let (_, entered) = state.integrate(0, &verdict(true, "f2"));
        assert_eq!(entered, Some(PatternStatus::QuotaReached));
        assert_eq!(state.progress(0).accepted, 2);
        assert!(state.all_terminal());
    }

    #[test]
    fn test_duplicate_is_not_an_attempt() {
        let mut state = GenerationState::new(vec![pattern("a"), pattern("b")], 10, 10, None);
        state.begin(0);
        state.begin(1);
        assert_eq!(state.integrate(0, &verdict(true, "same")).0, Integration::Accepted);
        assert_eq!(state.integrate(1, &verdict(true, "same")).0, Integration::Duplicate);
        assert_eq!(state.progress(1).attempts, 0);
        assert_eq!(state.progress(1).duplicates, 1);
        assert_eq!(state.accepted_total(), 1);
        assert_eq!(state.in_flight_total(), 0);
    }

    #[test]
    fn test_seeded_fingerprints_block_but_do_not_count() {
        let mut state = GenerationState::new(vec![pattern("a")], 10, 10, None);
        state.seed_fingerprints(vec!["old".to_string()]);
        assert!(state.is_known_fingerprint("old"));
        state.begin(0);
        assert_eq!(state.integrate(0, &verdict(true, "old")).0, Integration::Duplicate);
        assert_eq!(state.accepted_total(), 0);
    }

    #[test]
    fn test_rejections_tallied_by_stage_and_attempt_budget() {
        let mut state = GenerationState::new(vec![pattern("a")], 10, 10, Some(2));
        state.begin(0);
        let (integration, entered) = state.integrate(0, &verdict(false, "x"));
        assert_eq!(integration, Integration::Rejected(StageKind::Style));
        assert_eq!(entered, None);
        state.begin(0);
        assert_eq!(state.next_dispatchable(), None);
        let (_, entered) = state.integrate(0, &verdict(false, "y"));
        assert_eq!(entered, Some(PatternStatus::Exhausted));
        assert_eq!(state.progress(0).rejected_by_stage[&StageKind::Style], 2);
    }

    #[test]
    fn test_capacity_tracks_target() {
        let mut state = GenerationState::new(vec![pattern("a")], 1, 10, None);
        assert!(state.has_capacity());
        state.begin(0);
        assert!(!state.has_capacity());
        state.integrate(0, &verdict(true, "f"));
        assert!(state.is_complete());
    }
}
