//! Human-in-the-loop gates.
//!
//! Each HITL mode activates a fixed set of approval gates; the pipeline
//! consults [`should_gate`] at step boundaries and parks the task by
//! setting `pending_gate` until a human clears it.

use foreman_store::models::HitlMode;

/// Gate raised when a worker reports human-blocking issues.
pub const HUMAN_INTERVENTION_GATE: &str = "human_intervention";

/// Map a step to the gate that guards it, if any.
pub fn gate_for_step(step: &str) -> Option<&'static str> {
    match step {
        "plan" | "plan_impl" => Some("before_plan"),
        "implement" => Some("before_implement"),
        "review" => Some("after_implement"),
        "commit" => Some("before_commit"),
        _ => None,
    }
}

/// Whether the given approval gate is active for a mode.
pub fn should_gate(mode: HitlMode, gate_name: &str) -> bool {
    let (before_plan, before_implement, before_commit, after_implement) = match mode {
        HitlMode::Autopilot => (false, false, false, false),
        HitlMode::Supervised => (true, true, true, false),
        HitlMode::Collaborative => (false, false, true, true),
        HitlMode::ReviewOnly => (false, false, true, true),
    };
    match gate_name {
        "before_plan" => before_plan,
        "before_implement" => before_implement,
        "before_commit" => before_commit,
        "after_implement" => after_implement,
        _ => false,
    }
}

/// Whether a mode lets the coordinator run with nobody watching.
pub fn allows_unattended(mode: HitlMode) -> bool {
    matches!(mode, HitlMode::Autopilot | HitlMode::ReviewOnly)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn autopilot_has_no_gates() {
        for gate in ["before_plan", "before_implement", "before_commit", "after_implement"] {
            assert!(!should_gate(HitlMode::Autopilot, gate));
        }
    }

    #[test]
    fn supervised_gates_every_proposal() {
        assert!(should_gate(HitlMode::Supervised, "before_plan"));
        assert!(should_gate(HitlMode::Supervised, "before_implement"));
        assert!(should_gate(HitlMode::Supervised, "before_commit"));
        assert!(!should_gate(HitlMode::Supervised, "after_implement"));
    }

    #[test]
    fn review_modes_gate_after_implement_and_commit() {
        for mode in [HitlMode::Collaborative, HitlMode::ReviewOnly] {
            assert!(should_gate(mode, "after_implement"));
            assert!(should_gate(mode, "before_commit"));
            assert!(!should_gate(mode, "before_plan"));
        }
    }

    #[test]
    fn unknown_gate_is_inactive() {
        assert!(!should_gate(HitlMode::Supervised, "before_lunch"));
    }

    #[test]
    fn step_gate_mapping() {
        assert_eq!(gate_for_step("plan"), Some("before_plan"));
        assert_eq!(gate_for_step("plan_impl"), Some("before_plan"));
        assert_eq!(gate_for_step("implement"), Some("before_implement"));
        assert_eq!(gate_for_step("review"), Some("after_implement"));
        assert_eq!(gate_for_step("commit"), Some("before_commit"));
        assert_eq!(gate_for_step("verify"), None);
    }

    #[test]
    fn unattended_modes() {
        assert!(allows_unattended(HitlMode::Autopilot));
        assert!(allows_unattended(HitlMode::ReviewOnly));
        assert!(!allows_unattended(HitlMode::Supervised));
        assert!(!allows_unattended(HitlMode::Collaborative));
    }
}
