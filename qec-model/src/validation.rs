//! Criteria DSL and validation-test translation.
//!
//! Criteria are written one per line in a small DSL:
//!
//! ```text
//! require consent.given
//! forbid share_without_consent
//! user.age >= 18
//! region in ["eu", "uk"]
//! ```
//!
//! Anything that does not match becomes a free-text criterion. Typed criteria
//! are then translated into validation tests: a positive case that must be
//! allowed and a negative case that must be denied, each with a concrete JSON
//! input and a rule-language assertion.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::error::{ModelError, Result};
use crate::types::{ComparisonOperator, CriterionKind, Principle, ValidationCriterion};

/// Parser for the criteria DSL.
pub struct CriterionDsl;

impl CriterionDsl {
    /// Parse one line of criteria text.
    pub fn parse(text: &str) -> Result<ValidationCriterion> {
        let line = text.trim();
        if line.is_empty() {
            return Err(ModelError::InvalidCriterion(
                "criterion text is empty".to_string(),
            ));
        }

        let kind = Self::parse_kind(line);
        debug!(criterion = %line, structured = !matches!(kind, CriterionKind::FreeText), "Parsed criterion");
        Ok(ValidationCriterion::new(line, kind))
    }

    /// Parse a block of criteria, one per non-blank line.
    pub fn parse_block(text: &str) -> Result<Vec<ValidationCriterion>> {
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(Self::parse)
            .collect()
    }

    fn parse_kind(line: &str) -> CriterionKind {
        let (head, rest) = match line.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => return CriterionKind::FreeText,
        };

        match head.to_ascii_lowercase().as_str() {
            "require" | "requires" if is_identifier(rest) => {
                return CriterionKind::Requires {
                    field: rest.to_string(),
                }
            }
            "forbid" | "forbids" | "prohibit" | "prohibits" if is_identifier(rest) => {
                return CriterionKind::Prohibits {
                    action: rest.to_string(),
                }
            }
            _ => {}
        }

        if !is_identifier(head) {
            return CriterionKind::FreeText;
        }
        let (op_token, literal) = match rest.split_once(char::is_whitespace) {
            Some((op, literal)) => (op, literal.trim()),
            None => return CriterionKind::FreeText,
        };
        let operator = match ComparisonOperator::parse(op_token) {
            Some(op) => op,
            None => return CriterionKind::FreeText,
        };
        if literal.is_empty() {
            return CriterionKind::FreeText;
        }

        let value = parse_literal(literal);
        let valid = match operator {
            ComparisonOperator::In => value.as_array().map_or(false, |a| !a.is_empty()),
            ComparisonOperator::Gt
            | ComparisonOperator::Gte
            | ComparisonOperator::Lt
            | ComparisonOperator::Lte => value.is_number(),
            ComparisonOperator::Eq | ComparisonOperator::NotEq => true,
        };
        if !valid {
            return CriterionKind::FreeText;
        }

        CriterionKind::Predicate {
            field: head.to_string(),
            operator,
            value,
        }
    }
}

/// Dotted identifier such as `user.role` or `share_data`.
fn is_identifier(token: &str) -> bool {
    !token.is_empty()
        && token.split('.').all(|part| {
            !part.is_empty()
                && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                && !part.starts_with(|c: char| c.is_ascii_digit())
        })
}

/// JSON literal, or a bare word treated as a string.
fn parse_literal(literal: &str) -> Value {
    serde_json::from_str(literal).unwrap_or_else(|_| Value::String(literal.to_string()))
}

/// Decision a validation test expects from the rule under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expectation {
    Allow,
    Deny,
}

/// A validation test derived from a principle's criteria.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationTest {
    /// Unique test ID
    pub id: String,
    /// Principle the test belongs to
    pub principle_id: String,
    /// Criterion the test was derived from
    pub criterion_id: String,
    /// Short test name
    pub name: String,
    /// Rule-language assertion the patch must encode
    pub assertion: String,
    /// Request input for the scenario
    pub input: Value,
    /// Expected decision
    pub expect: Expectation,
    /// Whether a machine can run this test
    pub machine_checkable: bool,
}

/// Translate a principle's criteria into validation tests.
pub fn translate_criteria(principle: &Principle) -> Vec<ValidationTest> {
    principle
        .criteria
        .iter()
        .flat_map(|criterion| translate_criterion(&principle.id, criterion))
        .collect()
}

/// Translate a single criterion into its validation tests.
pub fn translate_criterion(principle_id: &str, criterion: &ValidationCriterion) -> Vec<ValidationTest> {
    let test = |suffix: &str, assertion: &str, input: Value, expect: Expectation, checkable: bool| {
        ValidationTest {
            id: format!("{}:{}:{}", principle_id, criterion.id, suffix),
            principle_id: principle_id.to_string(),
            criterion_id: criterion.id.clone(),
            name: format!("{} ({})", criterion.description, suffix),
            assertion: assertion.to_string(),
            input,
            expect,
            machine_checkable: checkable,
        }
    };

    match &criterion.kind {
        CriterionKind::Predicate {
            field,
            operator,
            value,
        } => {
            let assertion = format!("input.{} {} {}", field, operator.symbol(), value);
            let (satisfying, violating) = predicate_samples(*operator, value);
            vec![
                test("allow", &assertion, nested_input(field, satisfying), Expectation::Allow, true),
                test("deny", &assertion, nested_input(field, violating), Expectation::Deny, true),
            ]
        }
        CriterionKind::Requires { field } => {
            let assertion = format!("input.{} != null", field);
            vec![
                test("allow", &assertion, nested_input(field, json!(true)), Expectation::Allow, true),
                test("deny", &assertion, json!({}), Expectation::Deny, true),
            ]
        }
        CriterionKind::Prohibits { action } => {
            let assertion = format!("not input.action == \"{}\"", action);
            vec![
                test("allow", &assertion, json!({ "action": "noop" }), Expectation::Allow, true),
                test("deny", &assertion, json!({ "action": action }), Expectation::Deny, true),
            ]
        }
        CriterionKind::FreeText => {
            let assertion = format!("# manual: {}", criterion.description);
            vec![test("manual", &assertion, json!({}), Expectation::Allow, false)]
        }
    }
}

/// Build `{"a": {"b": value}}` from the dotted path `a.b`.
fn nested_input(path: &str, value: Value) -> Value {
    path.rsplit('.').fold(value, |inner, key| {
        let mut map = Map::new();
        map.insert(key.to_string(), inner);
        Value::Object(map)
    })
}

/// A value satisfying the predicate and one violating it.
fn predicate_samples(operator: ComparisonOperator, value: &Value) -> (Value, Value) {
    let shifted = |delta: f64| -> Value {
        let n = value.as_f64().unwrap_or(0.0) + delta;
        if value.is_i64() || value.is_u64() {
            json!(n as i64)
        } else {
            json!(n)
        }
    };
    let other = || -> Value {
        match value {
            Value::Bool(b) => json!(!b),
            Value::Number(_) => shifted(1.0),
            Value::String(s) => json!(format!("not_{}", s)),
            _ => Value::Null,
        }
    };

    match operator {
        ComparisonOperator::Eq => (value.clone(), other()),
        ComparisonOperator::NotEq => (other(), value.clone()),
        ComparisonOperator::Gt => (shifted(1.0), value.clone()),
        ComparisonOperator::Gte => (value.clone(), shifted(-1.0)),
        ComparisonOperator::Lt => (shifted(-1.0), value.clone()),
        ComparisonOperator::Lte => (value.clone(), shifted(1.0)),
        ComparisonOperator::In => {
            let first = value
                .as_array()
                .and_then(|a| a.first())
                .cloned()
                .unwrap_or(Value::Null);
            (first, json!("__outside__"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PrincipleCategory;

    #[test]
    fn test_parse_require_and_forbid() {
        let require = CriterionDsl::parse("require consent.given").unwrap();
        assert_eq!(
            require.kind,
            CriterionKind::Requires {
                field: "consent.given".to_string()
            }
        );

        let forbid = CriterionDsl::parse("Prohibit share_without_consent").unwrap();
        assert_eq!(
            forbid.kind,
            CriterionKind::Prohibits {
                action: "share_without_consent".to_string()
            }
        );
    }

    #[test]
    fn test_parse_predicates() {
        let age = CriterionDsl::parse("user.age >= 18").unwrap();
        match age.kind {
            CriterionKind::Predicate { field, operator, value } => {
                assert_eq!(field, "user.age");
                assert_eq!(operator, ComparisonOperator::Gte);
                assert_eq!(value, json!(18));
            }
            other => panic!("unexpected kind {:?}", other),
        }

        let role = CriterionDsl::parse("user.role == admin").unwrap();
        assert!(matches!(role.kind, CriterionKind::Predicate { ref value, .. } if value == &json!("admin")));

        let region = CriterionDsl::parse(r#"region in ["eu", "uk"]"#).unwrap();
        assert!(region.is_structured());
    }

    #[test]
    fn test_parse_free_text() {
        let vague = CriterionDsl::parse("Decisions should generally be fair").unwrap();
        assert_eq!(vague.kind, CriterionKind::FreeText);

        // Ordering operators need numbers
        let bad = CriterionDsl::parse("user.name > bob").unwrap();
        assert_eq!(bad.kind, CriterionKind::FreeText);

        assert!(CriterionDsl::parse("   ").is_err());
    }

    #[test]
    fn test_parse_block_skips_blank_lines() {
        let criteria = CriterionDsl::parse_block("require consent\n\nforbid sell_data\n").unwrap();
        assert_eq!(criteria.len(), 2);
    }

    #[test]
    fn test_translate_criteria() {
        let principle = Principle::new("p-1", "Adults only", PrincipleCategory::Safety)
            .with_criterion(CriterionDsl::parse("user.age >= 18").unwrap())
            .with_criterion(CriterionDsl::parse("Treat users with dignity").unwrap());

        let tests = translate_criteria(&principle);
        assert_eq!(tests.len(), 3);

        let allow = &tests[0];
        assert_eq!(allow.expect, Expectation::Allow);
        assert_eq!(allow.input, json!({"user": {"age": 18}}));
        assert_eq!(allow.assertion, "input.user.age >= 18");

        let deny = &tests[1];
        assert_eq!(deny.expect, Expectation::Deny);
        assert_eq!(deny.input, json!({"user": {"age": 17}}));

        let manual = &tests[2];
        assert!(!manual.machine_checkable);
        assert!(manual.assertion.starts_with("# manual"));
    }

    #[test]
    fn test_prohibit_translation() {
        let criterion = CriterionDsl::parse("forbid sell_data").unwrap();
        let tests = translate_criterion("p-1", &criterion);
        assert_eq!(tests[1].input, json!({"action": "sell_data"}));
        assert_eq!(tests[1].expect, Expectation::Deny);
    }
}
