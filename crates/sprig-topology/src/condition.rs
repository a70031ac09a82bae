//! The connection condition language.
//!
//! Grammar (deliberately minimal; a condition is one comparison):
//!
//! ```text
//! condition := side '.' ident op literal
//! side      := 'source' | 'target'
//! op        := '==' | '!=' | '<' | '<=' | '>' | '>='
//! literal   := 'true' | 'false' | number | '"' chars '"' | "'" chars "'"
//! ```
//!
//! An empty or absent condition is always true. Numbers compare with f64
//! widening; strings compare exactly and only under `==`/`!=`; booleans
//! likewise. Anything else is a type mismatch and the condition evaluates
//! to false at the call site.

use serde_json::Value;

use crate::error::TopologyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Source,
    Target,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn of_ordering(self, ord: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            CmpOp::Eq => ord == Equal,
            CmpOp::Ne => ord != Equal,
            CmpOp::Lt => ord == Less,
            CmpOp::Le => ord != Greater,
            CmpOp::Gt => ord == Greater,
            CmpOp::Ge => ord != Less,
        }
    }

    fn is_equality(self) -> bool {
        matches!(self, CmpOp::Eq | CmpOp::Ne)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Bool(bool),
    Number(f64),
    Str(String),
}

/// One parsed `side.Property OP literal` comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub side: Side,
    pub property: String,
    pub op: CmpOp,
    pub literal: Literal,
}

impl Condition {
    pub fn parse(input: &str) -> Result<Self, TopologyError> {
        let invalid = |reason: &str| TopologyError::InvalidCondition {
            condition: input.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(invalid("empty condition"));
        }

        // Two-character operators first so '<=' does not parse as '<'.
        let (op_pos, op_text, op) = ["==", "!=", "<=", ">=", "<", ">"]
            .iter()
            .filter_map(|text| trimmed.find(text).map(|pos| (pos, *text)))
            .min_by_key(|(pos, text)| (*pos, 2 - text.len()))
            .map(|(pos, text)| {
                let op = match text {
                    "==" => CmpOp::Eq,
                    "!=" => CmpOp::Ne,
                    "<=" => CmpOp::Le,
                    ">=" => CmpOp::Ge,
                    "<" => CmpOp::Lt,
                    _ => CmpOp::Gt,
                };
                (pos, text, op)
            })
            .ok_or_else(|| invalid("no comparison operator"))?;

        let lhs = trimmed[..op_pos].trim();
        let rhs = trimmed[op_pos + op_text.len()..].trim();

        let (side_text, property) = lhs
            .split_once('.')
            .ok_or_else(|| invalid("left side must be 'source.Property' or 'target.Property'"))?;
        let side = match side_text.trim() {
            "source" => Side::Source,
            "target" => Side::Target,
            other => return Err(invalid(&format!("unknown side '{}'", other))),
        };
        let property = property.trim();
        if property.is_empty() {
            return Err(invalid("missing property name"));
        }

        let literal = Self::parse_literal(rhs).ok_or_else(|| invalid("unparseable literal"))?;

        Ok(Condition {
            side,
            property: property.to_string(),
            op,
            literal,
        })
    }

    fn parse_literal(text: &str) -> Option<Literal> {
        if text.is_empty() {
            return None;
        }
        if text == "true" {
            return Some(Literal::Bool(true));
        }
        if text == "false" {
            return Some(Literal::Bool(false));
        }
        for quote in ['"', '\''] {
            if text.len() >= 2 && text.starts_with(quote) && text.ends_with(quote) {
                return Some(Literal::Str(text[1..text.len() - 1].to_string()));
            }
        }
        text.parse::<f64>().ok().map(Literal::Number)
    }

    /// Compare a fetched property value against the literal.
    ///
    /// `None` means type mismatch (including ordered operators on strings
    /// or booleans); the caller treats that as a failed condition.
    pub fn evaluate(&self, value: &Value) -> Option<bool> {
        match (&self.literal, value) {
            (Literal::Bool(expected), Value::Bool(actual)) if self.op.is_equality() => {
                Some(self.op.of_ordering(actual.cmp(expected)))
            }
            (Literal::Number(expected), Value::Number(actual)) => {
                let actual = actual.as_f64()?;
                actual
                    .partial_cmp(expected)
                    .map(|ord| self.op.of_ordering(ord))
            }
            (Literal::Str(expected), Value::String(actual)) if self.op.is_equality() => {
                Some(self.op.of_ordering(actual.as_str().cmp(expected.as_str())))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_number_comparison() {
        let c = Condition::parse("source.FlowRate > 50").unwrap();
        assert_eq!(c.side, Side::Source);
        assert_eq!(c.property, "FlowRate");
        assert_eq!(c.op, CmpOp::Gt);
        assert_eq!(c.literal, Literal::Number(50.0));
    }

    #[test]
    fn parses_two_char_operators() {
        assert_eq!(Condition::parse("target.Level <= 10").unwrap().op, CmpOp::Le);
        assert_eq!(Condition::parse("target.Level >= 10").unwrap().op, CmpOp::Ge);
        assert_eq!(Condition::parse("target.Level != 10").unwrap().op, CmpOp::Ne);
    }

    #[test]
    fn parses_string_and_bool_literals() {
        let c = Condition::parse("source.State == \"running\"").unwrap();
        assert_eq!(c.literal, Literal::Str("running".into()));
        let c = Condition::parse("source.State == 'running'").unwrap();
        assert_eq!(c.literal, Literal::Str("running".into()));
        let c = Condition::parse("target.Enabled == true").unwrap();
        assert_eq!(c.literal, Literal::Bool(true));
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(Condition::parse("").is_err());
        assert!(Condition::parse("FlowRate > 50").is_err());
        assert!(Condition::parse("upstream.FlowRate > 50").is_err());
        assert!(Condition::parse("source.FlowRate 50").is_err());
        assert!(Condition::parse("source.FlowRate > fifty").is_err());
        assert!(Condition::parse("source. > 50").is_err());
    }

    #[test]
    fn numeric_evaluation_widens() {
        let c = Condition::parse("source.FlowRate > 50").unwrap();
        assert_eq!(c.evaluate(&json!(75)), Some(true));
        assert_eq!(c.evaluate(&json!(75.5)), Some(true));
        assert_eq!(c.evaluate(&json!(25)), Some(false));
        assert_eq!(c.evaluate(&json!(50)), Some(false));
    }

    #[test]
    fn string_equality_is_exact() {
        let c = Condition::parse("source.State == \"running\"").unwrap();
        assert_eq!(c.evaluate(&json!("running")), Some(true));
        assert_eq!(c.evaluate(&json!("Running")), Some(false));
    }

    #[test]
    fn type_mismatch_is_none() {
        let c = Condition::parse("source.FlowRate > 50").unwrap();
        assert_eq!(c.evaluate(&json!("75")), None);

        // Ordered comparison on strings is a mismatch, not a coercion.
        let c = Condition::parse("source.State < \"zzz\"").unwrap();
        assert_eq!(c.evaluate(&json!("abc")), None);

        // Ordered comparison on booleans likewise.
        let c = Condition::parse("source.Enabled < true").unwrap();
        assert_eq!(c.evaluate(&json!(false)), None);
    }

    #[test]
    fn bool_equality() {
        let c = Condition::parse("source.Enabled != false").unwrap();
        assert_eq!(c.evaluate(&json!(true)), Some(true));
        assert_eq!(c.evaluate(&json!(false)), Some(false));
    }
}
