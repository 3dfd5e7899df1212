//! Binding resolution.
//!
//! Picks one value per placeholder such that every constraint holds and the
//! assignment has not been drawn before in the run. Small spaces are walked
//! systematically from a random offset, so every legal assignment is found
//! before the pattern reports exhaustion. Large spaces are sampled with
//! ChaCha8 draws under a fixed failure budget.

use std::collections::HashSet;

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use tracing::trace;

use crate::generator::BindingAssignment;
use crate::pattern::Pattern;

/// Default number of failed random draws before giving up on a pattern.
pub const DEFAULT_MAX_DRAWS: u32 = 256;

/// Default largest space size that is enumerated rather than sampled.
pub const DEFAULT_ENUMERATION_THRESHOLD: u64 = 4096;

/// Why a pattern can yield no further assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustionReason {
    /// Every legal assignment has been drawn.
    SpaceExhausted,
    /// Random draws kept colliding or violating constraints.
    DrawBudgetSpent { draws: u32 },
}

/// Outcome of a resolution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Assigned(BindingAssignment),
    Exhausted(ExhaustionReason),
}

/// Stateless binding resolver.
///
/// The set of previously drawn assignments is owned by the caller and passed
/// in on each call.
#[derive(Debug, Clone, Copy)]
pub struct BindingResolver {
    max_draws: u32,
    enumeration_threshold: u64,
}

impl Default for BindingResolver {
    fn default() -> Self {
        Self {
            max_draws: DEFAULT_MAX_DRAWS,
            enumeration_threshold: DEFAULT_ENUMERATION_THRESHOLD,
        }
    }
}

impl BindingResolver {
    /// Creates a resolver with the given draw budget and enumeration threshold.
    pub fn new(max_draws: u32, enumeration_threshold: u64) -> Self {
        Self {
            max_draws: max_draws.max(1),
            enumeration_threshold,
        }
    }

    /// Size of the unconstrained binding space.
    ///
    /// Returns `None` when the product overflows, meaning the space is
    /// effectively unbounded.
    pub fn space_size(pattern: &Pattern) -> Option<u64> {
        pattern
            .bindings
            .values()
            .try_fold(1u64, |acc, pool| acc.checked_mul(pool.len() as u64))
    }

    /// Chooses a fresh assignment for the pattern.
    ///
    /// # Arguments
    ///
    /// * `pattern` - A structurally valid pattern
    /// * `exclude` - Assignments already drawn for this pattern in the run
    /// * `rng` - Seeded generator; the same seed and inputs give the same result
    pub fn resolve(
        &self,
        pattern: &Pattern,
        exclude: &HashSet<BindingAssignment>,
        rng: &mut ChaCha8Rng,
    ) -> Resolution {
        match Self::space_size(pattern) {
            Some(0) => Resolution::Exhausted(ExhaustionReason::SpaceExhausted),
            Some(size) if size <= self.enumeration_threshold => {
                if exclude.len() as u64 >= size {
                    return Resolution::Exhausted(ExhaustionReason::SpaceExhausted);
                }
                self.enumerate(pattern, size, exclude, rng)
            }
            _ => self.sample(pattern, exclude, rng),
        }
    }

    /// Walks the mixed-radix index space from a random offset.
    fn enumerate(
        &self,
        pattern: &Pattern,
        size: u64,
        exclude: &HashSet<BindingAssignment>,
        rng: &mut ChaCha8Rng,
    ) -> Resolution {
        let start = rng.random_range(0..size);
        for step in 0..size {
            let index = (start + step) % size;
            let candidate = Self::assignment_at(pattern, index);
            if !exclude.contains(&candidate) && Self::satisfies(pattern, &candidate) {
                return Resolution::Assigned(candidate);
            }
        }
        trace!(pattern_id = %pattern.id, size, "Binding space exhausted");
        Resolution::Exhausted(ExhaustionReason::SpaceExhausted)
    }

    /// Draws uniformly at random, re-drawing on collision or constraint failure.
    fn sample(
        &self,
        pattern: &Pattern,
        exclude: &HashSet<BindingAssignment>,
        rng: &mut ChaCha8Rng,
    ) -> Resolution {
        for _ in 0..self.max_draws {
            let candidate: BindingAssignment = pattern
                .bindings
                .iter()
                .map(|(ph, pool)| {
                    let pick = &pool[rng.random_range(0..pool.len())];
                    (ph.clone(), pick.value.clone())
                })
                .collect();
            if !exclude.contains(&candidate) && Self::satisfies(pattern, &candidate) {
                return Resolution::Assigned(candidate);
            }
        }
        trace!(pattern_id = %pattern.id, draws = self.max_draws, "Draw budget spent");
        Resolution::Exhausted(ExhaustionReason::DrawBudgetSpent {
            draws: self.max_draws,
        })
    }

    /// Decodes a flat index into an assignment. Pools are visited in
    /// placeholder order, the last varying fastest.
    fn assignment_at(pattern: &Pattern, mut index: u64) -> BindingAssignment {
        let mut pairs: Vec<(String, String)> = Vec::with_capacity(pattern.bindings.len());
        for (ph, pool) in pattern.bindings.iter().rev() {
            let radix = pool.len() as u64;
            let digit = (index % radix) as usize;
            index /= radix;
            pairs.push((ph.clone(), pool[digit].value.clone()));
        }
        pairs.into_iter().collect()
    }

    fn satisfies(pattern: &Pattern, assignment: &BindingAssignment) -> bool {
        pattern
            .constraints
            .iter()
            .all(|c| c.is_satisfied(assignment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::Constraint;

    fn pattern() -> Pattern {
        Pattern::new(
            "pair",
            "basics",
            "x = {{ left }} + {{ right }}",
            "Add {{ left }} and {{ right }}.",
        )
        .with_binding("left", ["1", "2", "3"])
        .with_binding("right", ["1", "2", "3"])
        .with_check("assert x > 0")
    }

    fn drain(resolver: &BindingResolver, pattern: &Pattern, seed: u64) -> Vec<BindingAssignment> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut drawn = HashSet::new();
        let mut order = Vec::new();
        while let Resolution::Assigned(a) = resolver.resolve(pattern, &drawn, &mut rng) {
            assert!(drawn.insert(a.clone()), "assignment repeated: {}", a);
            order.push(a);
        }
        order
    }

    #[test]
    fn test_space_size() {
        assert_eq!(BindingResolver::space_size(&pattern()), Some(9));
        let mut huge = pattern();
        let pool: Vec<String> = (0..100_000).map(|i| i.to_string()).collect();
        for i in 0..5 {
            huge.bindings.insert(
                format!("p{}", i),
                pool.iter().map(|v| v.as_str().into()).collect(),
            );
        }
        assert_eq!(BindingResolver::space_size(&huge), None);
    }

    #[test]
    fn test_enumeration_covers_space_without_repeats() {
        let resolver = BindingResolver::default();
        let drawn = drain(&resolver, &pattern(), 7);
        assert_eq!(drawn.len(), 9);
        for a in &drawn {
            assert_eq!(a.len(), 2);
            assert!(a.get("left").is_some());
            assert!(a.get("right").is_some());
        }
    }

    #[test]
    fn test_enumeration_respects_constraints() {
        let p = pattern().with_constraint(Constraint::Distinct(vec![
            "left".to_string(),
            "right".to_string(),
        ]));
        let drawn = drain(&BindingResolver::default(), &p, 3);
        assert_eq!(drawn.len(), 6);
        assert!(drawn.iter().all(|a| a.get("left") != a.get("right")));
    }

    #[test]
    fn test_exhausted_reason() {
        let resolver = BindingResolver::default();
        let p = pattern();
        let all: HashSet<_> = drain(&resolver, &p, 1).into_iter().collect();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert_eq!(
            resolver.resolve(&p, &all, &mut rng),
            Resolution::Exhausted(ExhaustionReason::SpaceExhausted)
        );
    }

    #[test]
    fn test_sampling_mode_respects_budget() {
        let resolver = BindingResolver::new(16, 0);
        let p = pattern();
        let drawn = drain(&resolver, &p, 11);
        assert!(!drawn.is_empty());
        assert!(drawn.len() <= 9);

        let all: HashSet<_> = drain(&BindingResolver::default(), &p, 1).into_iter().collect();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        assert_eq!(
            resolver.resolve(&p, &all, &mut rng),
            Resolution::Exhausted(ExhaustionReason::DrawBudgetSpent { draws: 16 })
        );
    }

    #[test]
    fn test_same_seed_same_order() {
        let resolver = BindingResolver::default();
        assert_eq!(drain(&resolver, &pattern(), 42), drain(&resolver, &pattern(), 42));
    }
}
