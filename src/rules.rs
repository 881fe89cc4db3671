//! Rule evaluator - no-code strategy rules over indicator snapshots.
//!
//! Rule text is JSON, parsed once into a validated AST at registration and
//! never executed as code. Evaluation is a pure function of (rule, snapshot,
//! previous snapshot); missing market data fails closed to Hold, never open
//! into a trade.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::types::{MarketSnapshot, Side};
use crate::core::{Error, Result};

/// Evaluator verdict for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

impl From<Side> for SignalAction {
    fn from(side: Side) -> Self {
        match side {
            Side::Buy => SignalAction::Buy,
            Side::Sell => SignalAction::Sell,
        }
    }
}

/// Comparison operators supported by the flat grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    CrossAbove,
    CrossBelow,
}

impl CompareOp {
    fn parse(op: &str) -> Result<Self> {
        match op.trim().to_uppercase().as_str() {
            "==" => Ok(CompareOp::Eq),
            "!=" => Ok(CompareOp::Ne),
            "<" => Ok(CompareOp::Lt),
            "<=" => Ok(CompareOp::Le),
            ">" => Ok(CompareOp::Gt),
            ">=" => Ok(CompareOp::Ge),
            "CROSS_ABOVE" => Ok(CompareOp::CrossAbove),
            "CROSS_BELOW" => Ok(CompareOp::CrossBelow),
            other => Err(Error::RuleParse(format!("unknown operator: {}", other))),
        }
    }

    fn is_cross(&self) -> bool {
        matches!(self, CompareOp::CrossAbove | CompareOp::CrossBelow)
    }
}

/// A condition operand: numeric literal or named indicator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    Literal(f64),
    Indicator(String),
}

impl Operand {
    /// Parse a JSON operand. Numbers and numeric strings are literals;
    /// other strings are indicator names, with `EMA(9)` normalizing to the
    /// snapshot key `EMA_9`.
    fn parse(value: &Value) -> Result<Self> {
        match value {
            Value::Number(n) => n
                .as_f64()
                .map(Operand::Literal)
                .ok_or_else(|| Error::RuleParse(format!("non-finite literal: {}", n))),
            Value::String(s) => {
                let s = s.trim();
                if s.is_empty() {
                    return Err(Error::RuleParse("empty operand".to_string()));
                }
                if let Ok(v) = s.parse::<f64>() {
                    return Ok(Operand::Literal(v));
                }
                Ok(Operand::Indicator(normalize_indicator(s)))
            }
            other => Err(Error::RuleParse(format!(
                "operand must be a number or string, got: {}",
                other
            ))),
        }
    }

    /// Resolve against a snapshot. Missing indicators are an error here;
    /// the caller decides how to degrade.
    fn resolve(&self, snapshot: &MarketSnapshot) -> Result<f64> {
        match self {
            Operand::Literal(v) => Ok(*v),
            Operand::Indicator(name) => snapshot
                .get(name)
                .ok_or_else(|| Error::UnknownIndicator(name.clone())),
        }
    }

    /// Resolve against an optional previous snapshot. No observation is not
    /// an error for crossings: a cross needs both sides of the boundary.
    fn resolve_previous(&self, previous: Option<&MarketSnapshot>) -> Option<f64> {
        match self {
            Operand::Literal(v) => Some(*v),
            Operand::Indicator(name) => previous.and_then(|s| s.get(name)),
        }
    }
}

/// Canonical indicator key: `EMA(9)` -> `EMA_9`.
fn normalize_indicator(name: &str) -> String {
    name.replace('(', "_").replace(')', "").to_uppercase()
}

/// Single condition: `left op right`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub left: Operand,
    pub op: CompareOp,
    pub right: Operand,
}

impl Condition {
    /// Evaluate against the current and previous snapshots.
    fn evaluate(&self, snapshot: &MarketSnapshot, previous: Option<&MarketSnapshot>) -> Result<bool> {
        let left = self.left.resolve(snapshot)?;
        let right = self.right.resolve(snapshot)?;

        if self.op.is_cross() {
            let (prev_left, prev_right) =
                match (self.left.resolve_previous(previous), self.right.resolve_previous(previous)) {
                    (Some(l), Some(r)) => (l, r),
                    // Strict crossing needs both observations.
                    _ => return Ok(false),
                };
            return Ok(match self.op {
                CompareOp::CrossAbove => prev_left <= prev_right && left > right,
                CompareOp::CrossBelow => prev_left >= prev_right && left < right,
                _ => unreachable!(),
            });
        }

        Ok(match self.op {
            CompareOp::Eq => left == right,
            CompareOp::Ne => left != right,
            CompareOp::Lt => left < right,
            CompareOp::Le => left <= right,
            CompareOp::Gt => left > right,
            CompareOp::Ge => left >= right,
            CompareOp::CrossAbove | CompareOp::CrossBelow => unreachable!(),
        })
    }
}

/// Boolean combinator over the whole condition set. Flat by design; nested
/// subtrees are not part of the grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Combinator {
    And,
    Or,
}

impl Combinator {
    fn parse(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "AND" => Ok(Combinator::And),
            "OR" => Ok(Combinator::Or),
            other => Err(Error::RuleParse(format!("unknown combinator: {}", other))),
        }
    }
}

#[derive(Deserialize)]
struct RawCondition {
    left: Value,
    op: String,
    right: Value,
}

#[derive(Deserialize)]
struct RawRule {
    name: String,
    conditions: Vec<RawCondition>,
    #[serde(default)]
    operator: Option<String>,
    action: String,
}

/// Validated, immutable rule. Parsed once at registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub name: String,
    pub conditions: Vec<Condition>,
    pub combinator: Combinator,
    pub action: Side,
}

impl RuleDefinition {
    /// Parse and validate rule text. This is the only way rule text enters
    /// the system; the raw string is never interpreted any other way.
    pub fn parse(text: &str) -> Result<Self> {
        let raw: RawRule = serde_json::from_str(text)
            .map_err(|e| Error::RuleParse(format!("malformed rule document: {}", e)))?;

        if raw.conditions.is_empty() {
            return Err(Error::RuleParse(format!(
                "rule '{}' has no conditions",
                raw.name
            )));
        }

        let conditions = raw
            .conditions
            .iter()
            .map(|c| {
                Ok(Condition {
                    left: Operand::parse(&c.left)?,
                    op: CompareOp::parse(&c.op)?,
                    right: Operand::parse(&c.right)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let combinator = match raw.operator.as_deref() {
            Some(s) => Combinator::parse(s)?,
            None => Combinator::And,
        };

        let action = match raw.action.trim().to_uppercase().as_str() {
            "BUY" => Side::Buy,
            "SELL" => Side::Sell,
            other => {
                return Err(Error::RuleParse(format!(
                    "action must be BUY or SELL, got: {}",
                    other
                )));
            }
        };

        Ok(Self {
            name: raw.name,
            conditions,
            combinator,
            action,
        })
    }
}

/// Evaluate a rule against the current tick. Pure: identical inputs always
/// yield identical outputs. An unresolvable indicator surfaces as
/// `Error::UnknownIndicator`; callers degrade that tick to Hold.
pub fn evaluate(
    rule: &RuleDefinition,
    snapshot: &MarketSnapshot,
    previous: Option<&MarketSnapshot>,
) -> Result<SignalAction> {
    let mut any = false;
    let mut all = true;

    for condition in &rule.conditions {
        let met = condition.evaluate(snapshot, previous)?;
        any |= met;
        all &= met;
    }

    let triggered = match rule.combinator {
        Combinator::And => all,
        Combinator::Or => any,
    };

    if triggered {
        Ok(rule.action.into())
    } else {
        Ok(SignalAction::Hold)
    }
}

/// Registration-time tie-break validation: reject strategies whose BUY and
/// SELL rules can fire on the same tick. Two rules conflict when their
/// condition sets are identical, or when they share a condition while either
/// combinator is OR.
pub fn check_conflicts(rules: &[RuleDefinition]) -> Result<()> {
    let buys = rules.iter().filter(|r| r.action == Side::Buy);
    for buy in buys {
        for sell in rules.iter().filter(|r| r.action == Side::Sell) {
            let same_set = buy.conditions.len() == sell.conditions.len()
                && buy.conditions.iter().all(|c| sell.conditions.contains(c));
            let shared = buy.conditions.iter().any(|c| sell.conditions.contains(c));
            let either_or =
                buy.combinator == Combinator::Or || sell.combinator == Combinator::Or;

            if same_set || (shared && either_or) {
                return Err(Error::RuleParse(format!(
                    "rules '{}' and '{}' have overlapping BUY/SELL triggers",
                    buy.name, sell.name
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(pairs: &[(&str, f64)]) -> MarketSnapshot {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn ema_crossover_rule() -> RuleDefinition {
        RuleDefinition::parse(
            r#"{
                "name": "EMA trend",
                "conditions": [
                    {"left": "EMA_9", "op": ">", "right": "EMA_21"},
                    {"left": "RSI_14", "op": "<", "right": 70}
                ],
                "operator": "AND",
                "action": "BUY"
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn and_rule_triggers_buy() {
        let rule = ema_crossover_rule();
        let snap = snapshot(&[("EMA_9", 100.0), ("EMA_21", 99.0), ("RSI_14", 65.0)]);
        assert_eq!(evaluate(&rule, &snap, None).unwrap(), SignalAction::Buy);
    }

    #[test]
    fn and_rule_holds_when_one_condition_fails() {
        let rule = ema_crossover_rule();
        let snap = snapshot(&[("EMA_9", 100.0), ("EMA_21", 99.0), ("RSI_14", 75.0)]);
        assert_eq!(evaluate(&rule, &snap, None).unwrap(), SignalAction::Hold);
    }

    #[test]
    fn or_rule_triggers_on_any_condition() {
        let rule = RuleDefinition::parse(
            r#"{
                "name": "either",
                "conditions": [
                    {"left": "RSI_14", "op": ">", "right": 80},
                    {"left": "EMA_9", "op": ">", "right": 50}
                ],
                "operator": "OR",
                "action": "SELL"
            }"#,
        )
        .unwrap();
        let snap = snapshot(&[("RSI_14", 40.0), ("EMA_9", 60.0)]);
        assert_eq!(evaluate(&rule, &snap, None).unwrap(), SignalAction::Sell);
    }

    #[test]
    fn cross_above_requires_strict_crossing() {
        let rule = RuleDefinition::parse(
            r#"{
                "name": "golden cross",
                "conditions": [
                    {"left": "EMA_9", "op": "CROSS_ABOVE", "right": "EMA_21"}
                ],
                "operator": "AND",
                "action": "BUY"
            }"#,
        )
        .unwrap();

        let prev = snapshot(&[("EMA_9", 98.0), ("EMA_21", 99.0)]);
        let curr = snapshot(&[("EMA_9", 100.0), ("EMA_21", 99.0)]);

        // Crossed: below before, above now
        assert_eq!(
            evaluate(&rule, &curr, Some(&prev)).unwrap(),
            SignalAction::Buy
        );

        // No previous snapshot: merely being above is not a cross
        assert_eq!(evaluate(&rule, &curr, None).unwrap(), SignalAction::Hold);

        // Already above before: no cross
        let prev_above = snapshot(&[("EMA_9", 99.5), ("EMA_21", 99.0)]);
        assert_eq!(
            evaluate(&rule, &curr, Some(&prev_above)).unwrap(),
            SignalAction::Hold
        );
    }

    #[test]
    fn cross_below_mirrors_cross_above() {
        let rule = RuleDefinition::parse(
            r#"{
                "name": "death cross",
                "conditions": [
                    {"left": "EMA_9", "op": "CROSS_BELOW", "right": "EMA_21"}
                ],
                "action": "SELL"
            }"#,
        )
        .unwrap();

        let prev = snapshot(&[("EMA_9", 99.5), ("EMA_21", 99.0)]);
        let curr = snapshot(&[("EMA_9", 98.0), ("EMA_21", 99.0)]);
        assert_eq!(
            evaluate(&rule, &curr, Some(&prev)).unwrap(),
            SignalAction::Sell
        );
    }

    #[test]
    fn evaluation_is_deterministic() {
        let rule = ema_crossover_rule();
        let snap = snapshot(&[("EMA_9", 100.0), ("EMA_21", 99.0), ("RSI_14", 65.0)]);
        let first = evaluate(&rule, &snap, None).unwrap();
        for _ in 0..100 {
            assert_eq!(evaluate(&rule, &snap, None).unwrap(), first);
        }
    }

    #[test]
    fn unknown_indicator_fails_closed() {
        let rule = ema_crossover_rule();
        let snap = snapshot(&[("EMA_9", 100.0), ("EMA_21", 99.0)]);
        let err = evaluate(&rule, &snap, None).unwrap_err();
        assert!(matches!(err, Error::UnknownIndicator(ref n) if n == "RSI_14"));
    }

    #[test]
    fn parenthesized_indicator_names_normalize() {
        let rule = RuleDefinition::parse(
            r#"{
                "name": "normalized",
                "conditions": [
                    {"left": "EMA(9)", "op": ">", "right": "EMA(21)"}
                ],
                "action": "BUY"
            }"#,
        )
        .unwrap();
        let snap = snapshot(&[("EMA_9", 100.0), ("EMA_21", 99.0)]);
        assert_eq!(evaluate(&rule, &snap, None).unwrap(), SignalAction::Buy);
    }

    #[test]
    fn numeric_string_operand_is_a_literal() {
        let rule = RuleDefinition::parse(
            r#"{
                "name": "string literal",
                "conditions": [
                    {"left": "RSI_14", "op": "<", "right": "70"}
                ],
                "action": "BUY"
            }"#,
        )
        .unwrap();
        assert_eq!(
            rule.conditions[0].right,
            Operand::Literal(70.0),
        );
    }

    #[test]
    fn parse_rejects_unknown_operator() {
        let err = RuleDefinition::parse(
            r#"{
                "name": "bad",
                "conditions": [{"left": "A", "op": "~=", "right": 1}],
                "action": "BUY"
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::RuleParse(_)));
    }

    #[test]
    fn parse_rejects_malformed_json_and_missing_operand() {
        assert!(matches!(
            RuleDefinition::parse("not json").unwrap_err(),
            Error::RuleParse(_)
        ));
        assert!(matches!(
            RuleDefinition::parse(
                r#"{"name": "x", "conditions": [{"op": ">", "right": 1}], "action": "BUY"}"#
            )
            .unwrap_err(),
            Error::RuleParse(_)
        ));
    }

    #[test]
    fn parse_rejects_bad_action_and_empty_conditions() {
        assert!(matches!(
            RuleDefinition::parse(
                r#"{"name": "x", "conditions": [{"left": "A", "op": ">", "right": 1}], "action": "SHORT"}"#
            )
            .unwrap_err(),
            Error::RuleParse(_)
        ));
        assert!(matches!(
            RuleDefinition::parse(r#"{"name": "x", "conditions": [], "action": "BUY"}"#)
                .unwrap_err(),
            Error::RuleParse(_)
        ));
    }

    #[test]
    fn conflicting_buy_sell_rules_are_rejected() {
        let buy = RuleDefinition::parse(
            r#"{"name": "b", "conditions": [{"left": "A", "op": ">", "right": 1}], "action": "BUY"}"#,
        )
        .unwrap();
        let sell = RuleDefinition::parse(
            r#"{"name": "s", "conditions": [{"left": "A", "op": ">", "right": 1}], "action": "SELL"}"#,
        )
        .unwrap();
        assert!(check_conflicts(&[buy, sell]).is_err());
    }

    #[test]
    fn disjoint_buy_sell_rules_are_accepted() {
        let buy = RuleDefinition::parse(
            r#"{"name": "b", "conditions": [{"left": "A", "op": ">", "right": 1}], "action": "BUY"}"#,
        )
        .unwrap();
        let sell = RuleDefinition::parse(
            r#"{"name": "s", "conditions": [{"left": "A", "op": "<", "right": 0}], "action": "SELL"}"#,
        )
        .unwrap();
        assert!(check_conflicts(&[buy, sell]).is_ok());
    }
}
