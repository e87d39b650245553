use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use matforge_types::Plan;

/// Which resource names a plan may not use, and what to use instead.
///
/// Ordered collections keep validation output deterministic for a
/// given policy regardless of construction order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourcePolicy {
    #[serde(default)]
    pub block_list: BTreeSet<String>,
    #[serde(default)]
    pub redirect_map: BTreeMap<String, String>,
}

impl ResourcePolicy {
    pub fn redirect_for(&self, blocked: &str) -> Option<&str> {
        self.redirect_map
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(blocked))
            .map(|(_, v)| v.as_str())
    }
}

/// Outcome of one validation pass over a plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Steps whose intent text was rewritten.
    pub redirected_steps: Vec<u32>,
    /// Blocked names still present after rewriting, outside any
    /// mapping context. Logged, never fatal here; refusal is the
    /// caller's call.
    pub residual: Vec<ResidualViolation>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.redirected_steps.is_empty() && self.residual.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResidualViolation {
    pub step_id: u32,
    pub blocked_name: String,
}

/// Text-transform firewall over plan step intents. Rewrites genuine
/// uses of blocked resource names to their sanctioned replacements
/// while leaving descriptive/mapping mentions untouched. Purely local
/// and deterministic; the only side effect is mutating the given plan.
pub struct SafetyValidator {
    policy: ResourcePolicy,
    matchers: Vec<(String, Regex)>,
    context_patterns: Vec<Regex>,
}

impl SafetyValidator {
    pub fn new(policy: ResourcePolicy) -> Self {
        let matchers = policy
            .block_list
            .iter()
            .filter_map(|name| {
                word_bounded(name).ok().map(|re| (name.clone(), re))
            })
            .collect();
        let context_patterns = policy
            .block_list
            .iter()
            .flat_map(|name| mapping_context_patterns(name))
            .collect();
        Self {
            policy,
            matchers,
            context_patterns,
        }
    }

    pub fn policy(&self) -> &ResourcePolicy {
        &self.policy
    }

    /// Rewrite blocked names in every step intent, then re-scan for
    /// anything the rewrite could not fix.
    pub fn validate(&self, plan: &mut Plan) -> ValidationReport {
        let mut report = ValidationReport::default();

        for step in &mut plan.steps {
            let context_ranges = self.collect_context_ranges(&step.intent);
            let mut rewritten = false;

            for (blocked, matcher) in &self.matchers {
                let Some(replacement) = self.policy.redirect_for(blocked) else {
                    continue;
                };
                let next = rewrite_outside_ranges(
                    &step.intent,
                    matcher,
                    replacement,
                    &context_ranges,
                );
                if let Some(next) = next {
                    tracing::info!(
                        step_id = step.step_id,
                        blocked = %blocked,
                        replacement = %replacement,
                        "redirected restricted resource in step intent"
                    );
                    step.intent = next;
                    rewritten = true;
                }
            }

            if rewritten {
                report.redirected_steps.push(step.step_id);
            }

            // Residual scan: blocked names with no redirect target, or
            // anything the rewrite somehow left behind.
            let context_ranges = self.collect_context_ranges(&step.intent);
            for (blocked, matcher) in &self.matchers {
                let leftover = matcher
                    .find_iter(&step.intent)
                    .any(|m| !covered(&context_ranges, m.range()));
                if leftover {
                    tracing::warn!(
                        step_id = step.step_id,
                        blocked = %blocked,
                        "restricted resource still referenced after validation"
                    );
                    report.residual.push(ResidualViolation {
                        step_id: step.step_id,
                        blocked_name: blocked.clone(),
                    });
                }
            }
        }

        report
    }

    fn collect_context_ranges(&self, intent: &str) -> Vec<Range<usize>> {
        let mut ranges: Vec<Range<usize>> = self
            .context_patterns
            .iter()
            .flat_map(|re| re.find_iter(intent).map(|m| m.range()))
            .collect();
        ranges.sort_by_key(|r| (r.start, r.end));
        ranges
    }
}

fn word_bounded(name: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(&format!(r"\b{}\b", regex::escape(name)))
        .case_insensitive(true)
        .build()
}

/// Patterns under which a mention of `name` is descriptive rather than
/// a genuine use: arrow mappings ("X -> Y"), mapping verbs
/// ("convert X", "replace X with"), and provenance phrasing
/// ("originally X", "instead of X").
fn mapping_context_patterns(name: &str) -> Vec<Regex> {
    let escaped = regex::escape(name);
    let sources = [
        format!(r"\b{}\b\s*(?:->|→|=>)\s*\S+", escaped),
        format!(r"\S+\s*(?:->|→|=>)\s*\b{}\b", escaped),
        format!(
            r"\b(?:map|mapping|convert|converting|replace|replacing|substitute|substituting|swap|swapping)\b[^.;]{{0,40}}?\b{}\b",
            escaped
        ),
        format!(
            r"\b(?:originally|instead of|rather than|formerly|previously)\b[^.;]{{0,40}}?\b{}\b",
            escaped
        ),
    ];
    sources
        .iter()
        .filter_map(|src| {
            RegexBuilder::new(src).case_insensitive(true).build().ok()
        })
        .collect()
}

fn covered(ranges: &[Range<usize>], hit: Range<usize>) -> bool {
    ranges.iter().any(|r| r.start <= hit.start && hit.end <= r.end)
}

/// Replace matches that fall outside protected ranges. Returns the
/// rewritten string, or None when nothing needed rewriting.
fn rewrite_outside_ranges(
    text: &str,
    matcher: &Regex,
    replacement: &str,
    protected: &[Range<usize>],
) -> Option<String> {
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    let mut changed = false;
    for m in matcher.find_iter(text) {
        out.push_str(&text[cursor..m.start()]);
        if covered(protected, m.range()) {
            out.push_str(m.as_str());
        } else {
            out.push_str(replacement);
            changed = true;
        }
        cursor = m.end();
    }
    if !changed {
        return None;
    }
    out.push_str(&text[cursor..]);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use matforge_types::Step;

    fn policy() -> ResourcePolicy {
        let mut block_list = BTreeSet::new();
        block_list.insert("VASP".to_string());
        let mut redirect_map = BTreeMap::new();
        redirect_map.insert("VASP".to_string(), "ABACUS".to_string());
        ResourcePolicy {
            block_list,
            redirect_map,
        }
    }

    fn plan_with(intents: &[&str]) -> Plan {
        let steps = intents
            .iter()
            .enumerate()
            .map(|(i, intent)| Step::new(i as u32 + 1, *intent))
            .collect();
        Plan::new(steps)
    }

    #[test]
    fn genuine_use_is_rewritten() {
        let validator = SafetyValidator::new(policy());
        let mut plan = plan_with(&["Run a VASP relaxation on the Si supercell"]);
        let report = validator.validate(&mut plan);
        assert_eq!(
            plan.steps[0].intent,
            "Run a ABACUS relaxation on the Si supercell"
        );
        assert_eq!(report.redirected_steps, vec![1]);
        assert!(report.residual.is_empty());
    }

    #[test]
    fn mapping_mentions_are_left_untouched() {
        let validator = SafetyValidator::new(policy());
        let mut plan = plan_with(&[
            "Convert VASP input files to the new format",
            "Use the mapping VASP -> ABACUS for all pseudopotentials",
            "Run the workflow that was originally VASP based",
        ]);
        let report = validator.validate(&mut plan);
        assert!(plan.steps[0].intent.contains("VASP"));
        assert!(plan.steps[1].intent.contains("VASP -> ABACUS"));
        assert!(plan.steps[2].intent.contains("originally VASP"));
        assert!(report.redirected_steps.is_empty());
        assert!(report.residual.is_empty());
    }

    #[test]
    fn validation_is_idempotent() {
        let validator = SafetyValidator::new(policy());
        let mut plan = plan_with(&["Submit a vasp band structure job"]);
        validator.validate(&mut plan);
        let first = plan.steps[0].intent.clone();

        let report = validator.validate(&mut plan);
        assert_eq!(plan.steps[0].intent, first);
        assert!(report.redirected_steps.is_empty());
        assert!(report.residual.is_empty());
    }

    #[test]
    fn matching_is_case_insensitive_and_word_bounded() {
        let validator = SafetyValidator::new(policy());
        let mut plan = plan_with(&["Launch vAsP now", "Inspect the vaspwave directory"]);
        validator.validate(&mut plan);
        assert_eq!(plan.steps[0].intent, "Launch ABACUS now");
        // Substrings of longer identifiers are not uses of the tool.
        assert_eq!(plan.steps[1].intent, "Inspect the vaspwave directory");
    }

    #[test]
    fn blocked_name_without_redirect_is_reported_not_rewritten() {
        let mut p = policy();
        p.block_list.insert("GAUSSIAN".to_string());
        let validator = SafetyValidator::new(p);
        let mut plan = plan_with(&["Run a GAUSSIAN geometry optimization"]);
        let report = validator.validate(&mut plan);
        assert!(plan.steps[0].intent.contains("GAUSSIAN"));
        assert_eq!(report.residual.len(), 1);
        assert_eq!(report.residual[0].blocked_name, "GAUSSIAN");
        assert_eq!(report.residual[0].step_id, 1);
    }

    #[test]
    fn repeated_runs_are_deterministic() {
        let validator = SafetyValidator::new(policy());
        let intents = ["Run VASP then archive VASP outputs"];
        let mut a = plan_with(&intents);
        let mut b = plan_with(&intents);
        let ra = validator.validate(&mut a);
        let rb = validator.validate(&mut b);
        assert_eq!(a.steps[0].intent, b.steps[0].intent);
        assert_eq!(ra.redirected_steps, rb.redirected_steps);
    }
}
