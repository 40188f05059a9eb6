//! Condition node evaluation.

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex, PoisonError};

use regex::Regex;
use tracing::warn;

use crate::fields::FieldMapper;
use crate::flow::model::{ConditionOperator, ConditionProps, ConditionSubject};
use crate::session::model::{LAST_REPLY, Session};

/// Compiled `regex` operands, keyed by pattern. Cleared when full.
static PATTERNS: LazyLock<Mutex<HashMap<String, Regex>>> = LazyLock::new(Default::default);
const PATTERN_CACHE_CAP: usize = 256;

/// Resolve the value a condition node tests.
///
/// Variables are looked up by name; a generated form field name falls back to
/// the variable stored under its label. Missing values resolve to "".
pub fn resolve_subject(
    subject: &ConditionSubject,
    session: &Session,
    mapper: FieldMapper<'_>,
) -> String {
    let name = match subject {
        ConditionSubject::LastReply => LAST_REPLY,
        ConditionSubject::Variable(name) => name.as_str(),
    };
    if let Some(value) = session.variable(name) {
        return value.to_string();
    }
    mapper
        .label_for(name)
        .and_then(|label| session.variable(label))
        .unwrap_or_default()
        .to_string()
}

/// Evaluate `value <operator> compare`. String operators are case-sensitive;
/// numeric operators are false unless both sides parse as numbers.
pub fn evaluate(operator: ConditionOperator, value: &str, compare: &str) -> bool {
    match operator {
        ConditionOperator::Equals => value == compare,
        ConditionOperator::NotEquals => value != compare,
        ConditionOperator::Contains => value.contains(compare),
        ConditionOperator::StartsWith => value.starts_with(compare),
        ConditionOperator::Regex => matches_pattern(compare, value),
        ConditionOperator::GreaterThan => numeric(value, compare).is_some_and(|(a, b)| a > b),
        ConditionOperator::LessThan => numeric(value, compare).is_some_and(|(a, b)| a < b),
        ConditionOperator::IsEmpty => value.trim().is_empty(),
        ConditionOperator::IsNotEmpty => !value.trim().is_empty(),
    }
}

fn matches_pattern(pattern: &str, value: &str) -> bool {
    let mut cache = PATTERNS.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(re) = cache.get(pattern) {
        return re.is_match(value);
    }
    match Regex::new(pattern) {
        Ok(re) => {
            let hit = re.is_match(value);
            if cache.len() >= PATTERN_CACHE_CAP {
                cache.clear();
            }
            cache.insert(pattern.to_string(), re);
            hit
        }
        Err(e) => {
            warn!(pattern, error = %e, "Invalid condition regex");
            false
        }
    }
}

fn numeric(a: &str, b: &str) -> Option<(f64, f64)> {
    let a = a.trim().parse::<f64>().ok().filter(|v| v.is_finite())?;
    let b = b.trim().parse::<f64>().ok().filter(|v| v.is_finite())?;
    Some((a, b))
}

/// Evaluate a condition node against a session.
pub fn check(props: &ConditionProps, session: &Session, mapper: FieldMapper<'_>) -> bool {
    let value = resolve_subject(&props.subject, session, mapper);
    evaluate(props.operator, &value, &props.compare_value)
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::fields::FieldMapping;

    #[test]
    fn equals_is_case_sensitive() {
        assert!(evaluate(ConditionOperator::Equals, "yes", "yes"));
        assert!(!evaluate(ConditionOperator::Equals, "Yes", "yes"));
        assert!(!evaluate(ConditionOperator::Equals, "yes ", "yes"));
        assert!(evaluate(ConditionOperator::NotEquals, "no", "yes"));
    }

    #[test]
    fn string_operators() {
        assert!(evaluate(ConditionOperator::Contains, "order 123", "123"));
        assert!(evaluate(ConditionOperator::StartsWith, "order 123", "order"));
        assert!(!evaluate(ConditionOperator::StartsWith, "Order 123", "order"));
        assert!(evaluate(ConditionOperator::Regex, "a@b.io", r"^[^@]+@[^@]+$"));
        assert!(!evaluate(ConditionOperator::Regex, "anything", "("));
        assert!(evaluate(ConditionOperator::IsEmpty, "  ", ""));
        assert!(evaluate(ConditionOperator::IsNotEmpty, "x", ""));
    }

    #[test]
    fn regex_operands_are_compiled_once() {
        let pattern = r"^order-\d{3}$";
        assert!(evaluate(ConditionOperator::Regex, "order-123", pattern));
        assert!(PATTERNS.lock().unwrap().contains_key(pattern));
        assert!(!evaluate(ConditionOperator::Regex, "order-12", pattern));

        assert!(!evaluate(ConditionOperator::Regex, "x", "(unclosed"));
        assert!(!PATTERNS.lock().unwrap().contains_key("(unclosed"));
    }

    #[test]
    fn numeric_operators_need_numbers_on_both_sides() {
        assert!(evaluate(ConditionOperator::GreaterThan, "10", "9.5"));
        assert!(evaluate(ConditionOperator::LessThan, " 3 ", "4"));
        assert!(!evaluate(ConditionOperator::GreaterThan, "ten", "9"));
        assert!(!evaluate(ConditionOperator::LessThan, "3", "four"));
        assert!(!evaluate(ConditionOperator::GreaterThan, "NaN", "1"));
    }

    #[test]
    fn subject_resolution_falls_back_to_form_label() {
        let mut session = Session::new("c", Uuid::new_v4(), 1);
        session.set_variable(LAST_REPLY, "yes");
        session.set_variable("Full Name", "John Doe");

        let mappings = vec![FieldMapping {
            flow_id: session.flow_id,
            version: 1,
            node_id: "form".into(),
            component_id: "c1".into(),
            label: "Full Name".into(),
            field_name: "full_name_abc123".into(),
        }];
        let mapper = FieldMapper::new(&mappings);

        assert_eq!(resolve_subject(&ConditionSubject::LastReply, &session, mapper), "yes");
        let generated = ConditionSubject::Variable("full_name_abc123".into());
        assert_eq!(resolve_subject(&generated, &session, mapper), "John Doe");
        assert_eq!(
            resolve_subject(&ConditionSubject::Variable("missing".into()), &session, mapper),
            ""
        );
    }
}
