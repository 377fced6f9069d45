//! Tag predicate used to select ways.
//!
//! A predicate is an ordered list of include rules. Each rule names a key and
//! either an exact value or a wildcard. A tag set matches when any rule finds
//! its pair; otherwise the configured default decides. `invert` flips the
//! final answer.

mod rules;

pub use rules::parse_rule;

use crate::entity::Tags;

/// Highway subclasses accepted when no rules are configured.
pub const DEFAULT_HIGHWAYS: [&str; 8] = [
    "path",
    "footway",
    "track",
    "unclassified",
    "residential",
    "tertiary",
    "primary",
    "secondary",
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RuleValue {
    /// Any value, the key only has to be present
    Any,
    Exact(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchRule {
    pub key: String,
    pub value: RuleValue,
}

impl MatchRule {
    pub fn exact(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: RuleValue::Exact(value.into()),
        }
    }

    pub fn any(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: RuleValue::Any,
        }
    }

    pub fn matches(&self, tags: &Tags) -> bool {
        match (tags.get(&self.key), &self.value) {
            (None, _) => false,
            (Some(_), RuleValue::Any) => true,
            (Some(actual), RuleValue::Exact(expected)) => actual == expected,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TagPredicate {
    rules: Vec<MatchRule>,
    default_deny: bool,
    invert: bool,
}

impl TagPredicate {
    pub fn new(default_deny: bool) -> Self {
        Self {
            rules: Vec::new(),
            default_deny,
            invert: false,
        }
    }

    /// The stock highway selection: `highway` in [`DEFAULT_HIGHWAYS`], default deny.
    pub fn highways() -> Self {
        let mut predicate = Self::new(true);
        for value in DEFAULT_HIGHWAYS {
            predicate.add_rule(MatchRule::exact("highway", value));
        }
        predicate
    }

    pub fn add_rule(&mut self, rule: MatchRule) {
        self.rules.push(rule);
    }

    pub fn with_rules<I: IntoIterator<Item = MatchRule>>(mut self, rules: I) -> Self {
        self.rules.extend(rules);
        self
    }

    pub fn with_invert(mut self, invert: bool) -> Self {
        self.invert = invert;
        self
    }

    pub fn rules(&self) -> &[MatchRule] {
        &self.rules
    }

    pub fn default_deny(&self) -> bool {
        self.default_deny
    }

    pub fn inverted(&self) -> bool {
        self.invert
    }

    pub fn matches(&self, tags: &Tags) -> bool {
        let matched = match self.rules.iter().position(|rule| rule.matches(tags)) {
            Some(index) => {
                tracing::trace!("Filter: rule {} ({}) matched", index, self.rules[index].key);
                true
            }
            None => !self.default_deny,
        };
        matched != self.invert
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn matches_any_accepted_pair() {
        let predicate = TagPredicate::highways();
        assert!(predicate.matches(&tags(&[("highway", "primary")])));
        assert!(predicate.matches(&tags(&[("name", "Elm"), ("highway", "footway")])));
        assert!(!predicate.matches(&tags(&[("highway", "service")])));
        assert!(!predicate.matches(&tags(&[("railway", "primary")])));
    }

    #[test]
    fn empty_tags_never_match_under_default_deny() {
        let predicate = TagPredicate::highways();
        assert!(!predicate.matches(&Tags::new()));

        let wildcard = TagPredicate::new(true).with_rules([MatchRule::any("highway")]);
        assert!(!wildcard.matches(&Tags::new()));
    }

    #[test]
    fn values_are_case_sensitive() {
        let predicate = TagPredicate::highways();
        assert!(!predicate.matches(&tags(&[("highway", "Primary")])));
        assert!(!predicate.matches(&tags(&[("Highway", "primary")])));
    }

    #[test]
    fn wildcard_matches_any_value_for_key() {
        let predicate = TagPredicate::new(true).with_rules([MatchRule::any("building")]);
        assert!(predicate.matches(&tags(&[("building", "yes")])));
        assert!(predicate.matches(&tags(&[("building", "")])));
        assert!(!predicate.matches(&tags(&[("highway", "yes")])));
    }

    #[test]
    fn default_accept_passes_unmatched_tags() {
        let predicate = TagPredicate::new(false).with_rules([MatchRule::exact("highway", "path")]);
        assert!(predicate.matches(&tags(&[("natural", "tree")])));
        assert!(predicate.matches(&Tags::new()));
    }

    #[test]
    fn invert_flips_result() {
        let predicate = TagPredicate::highways().with_invert(true);
        assert!(!predicate.matches(&tags(&[("highway", "primary")])));
        assert!(predicate.matches(&tags(&[("highway", "service")])));
        assert!(predicate.matches(&Tags::new()));
    }

    #[test]
    fn rule_order_does_not_change_result() {
        let forward = TagPredicate::new(true).with_rules([
            MatchRule::exact("highway", "primary"),
            MatchRule::exact("highway", "footway"),
        ]);
        let backward = TagPredicate::new(true).with_rules([
            MatchRule::exact("highway", "footway"),
            MatchRule::exact("highway", "primary"),
        ]);
        for value in ["primary", "footway", "service"] {
            let t = tags(&[("highway", value)]);
            assert_eq!(forward.matches(&t), backward.matches(&t));
        }
    }
}
