//! Parser for command-line rule specs.
//!
//! Grammar:
//!
//! rule       = key ("=" value_list)?
//! value_list = value ("|" value)*
//! value      = "*" | any text without "|"

use winnow::combinator::{opt, preceded, separated};
use winnow::prelude::*;
use winnow::token::{take_till, take_while};

use super::{MatchRule, RuleValue};

// Local alias; winnow renamed its own between releases
type PResult<T> = Result<T, winnow::error::ErrMode<winnow::error::ContextError>>;

/// Keys: alphanumeric plus the separators OSM keys use (`addr:street`, `ref:usfs`).
fn lex_key<'s>(input: &mut &'s str) -> PResult<&'s str> {
    take_while(1.., |c: char| {
        c.is_alphanumeric() || c == '_' || c == ':' || c == '-' || c == '.'
    })
    .parse_next(input)
}

fn lex_values<'s>(input: &mut &'s str) -> PResult<Vec<&'s str>> {
    separated(1.., take_till(1.., |c: char| c == '|'), '|').parse_next(input)
}

fn lex_rule<'s>(input: &mut &'s str) -> PResult<(&'s str, Option<Vec<&'s str>>)> {
    let key = lex_key.parse_next(input)?;
    let values = opt(preceded('=', lex_values)).parse_next(input)?;
    Ok((key, values))
}

/// Parse one rule spec (`highway`, `highway=*`, `highway=path|track`) into match rules.
pub fn parse_rule(spec: &str) -> Result<Vec<MatchRule>, String> {
    let mut remaining = spec.trim();
    let (key, values) = lex_rule(&mut remaining)
        .map_err(|e| format!("Rule error in '{}': {:?}", spec, e))?;
    if !remaining.is_empty() {
        return Err(format!(
            "Rule error in '{}': unexpected trailing input '{}'",
            spec, remaining
        ));
    }

    let Some(values) = values else {
        return Ok(vec![MatchRule::any(key)]);
    };

    let mut rules = Vec::with_capacity(values.len());
    for value in values {
        let value = value.trim();
        if value.is_empty() {
            return Err(format!("Rule error in '{}': empty value", spec));
        }
        rules.push(MatchRule {
            key: key.to_string(),
            value: if value == "*" {
                RuleValue::Any
            } else {
                RuleValue::Exact(value.to_string())
            },
        });
    }
    Ok(rules)
}
