//! Per-turn nudge texts appended after execution output.

use crate::core::features::FeatureFlags;

/// Sent after a reply that contained no code unit.
pub const WRITE_CODE_NUDGE: &str = "Please write a ```repl``` code block to proceed.";

/// Sent once the iteration budget is spent, before the forced final turn.
pub const FORCE_FINAL_NUDGE: &str =
    "Maximum iterations reached. Call FINAL(answer) with your best answer now.";

/// Remaining iterations at or below which the nudge asks for aggregation.
pub const NEAR_BUDGET_REMAINING: usize = 2;

/// Build the nudge for a zero-based `iteration` out of `max_iterations`.
///
/// Exactly one text is produced. Precedence: synthesis ritual near the budget
/// end, plain aggregation near the budget end, scratchpad check, then the
/// generic continue message.
pub fn compose_nudge(iteration: usize, max_iterations: usize, flags: &FeatureFlags) -> String {
    let remaining = max_iterations.saturating_sub(iteration);
    let progress = format!("Iteration {}/{max_iterations}.", iteration + 1);
    let near_end = remaining <= NEAR_BUDGET_REMAINING;

    if near_end && flags.synthesis_cot {
        return format!(
            "{progress} You are almost out of steps. \
             Before calling FINAL(answer), list all evidence collected, note whether \
             each piece supports or contradicts the answer, write 2-3 sentences of \
             reasoning, then call FINAL(answer)."
        );
    }

    if near_end {
        return format!(
            "{progress} You are almost out of steps. \
             Aggregate what you have and call FINAL(answer) now."
        );
    }

    if flags.explicit_convergence {
        return format!(
            "{progress} \
             Update your `scratchpad` variable with what you've learned and what's \
             still missing. If no information gap remains, call FINAL(answer). \
             Otherwise, continue with targeted worker calls."
        );
    }

    format!("{progress} Continue your analysis.")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::features::Flag;

    #[test]
    fn generic_nudge_reports_one_based_progress() {
        let nudge = compose_nudge(0, 15, &FeatureFlags::default());
        assert_eq!(nudge, "Iteration 1/15. Continue your analysis.");
    }

    #[test]
    fn near_budget_asks_for_aggregation_regardless_of_convergence() {
        let flags = FeatureFlags::only(Flag::ExplicitConvergence);
        let nudge = compose_nudge(13, 15, &flags);
        assert_eq!(
            nudge,
            "Iteration 14/15. You are almost out of steps. \
             Aggregate what you have and call FINAL(answer) now."
        );
    }

    #[test]
    fn synthesis_replaces_aggregation_near_budget() {
        let flags = FeatureFlags::only(Flag::SynthesisCot);
        let nudge = compose_nudge(14, 15, &flags);
        assert!(nudge.starts_with("Iteration 15/15. You are almost out of steps."));
        assert!(nudge.contains("list all evidence collected"));
    }

    #[test]
    fn synthesis_alone_does_not_change_mid_run_nudge() {
        let flags = FeatureFlags::only(Flag::SynthesisCot);
        assert_eq!(
            compose_nudge(3, 15, &flags),
            "Iteration 4/15. Continue your analysis."
        );
    }

    #[test]
    fn convergence_mid_run_asks_for_scratchpad() {
        let flags = FeatureFlags::only(Flag::ExplicitConvergence);
        let nudge = compose_nudge(2, 15, &flags);
        assert!(nudge.starts_with("Iteration 3/15. Update your `scratchpad` variable"));
    }

    #[test]
    fn boundary_is_two_remaining() {
        let flags = FeatureFlags::default();
        assert!(compose_nudge(12, 15, &flags).contains("Continue your analysis"));
        assert!(compose_nudge(13, 15, &flags).contains("almost out of steps"));
    }
}
