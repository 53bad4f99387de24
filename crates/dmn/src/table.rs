//! Decision tables: model, compilation and evaluation

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use conveyor_engine::expression::{Expression, ExpressionError};

use crate::error::DecisionError;
use crate::unary::{parse_literal, UnaryTests};

/// What to return when several rules match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitPolicy {
    /// At most one rule may match
    #[default]
    Unique,
    /// First matching rule in table order
    First,
    /// Several rules may match if they produce the same output
    Any,
    /// Every match, in table order
    RuleOrder,
    /// Every match, optionally aggregated
    Collect,
}

impl HitPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unique => "UNIQUE",
            Self::First => "FIRST",
            Self::Any => "ANY",
            Self::RuleOrder => "RULE ORDER",
            Self::Collect => "COLLECT",
        }
    }
}

/// Aggregation of a `collect` table with a single output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Sum,
    Min,
    Max,
    Count,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputClause {
    #[serde(default)]
    pub label: Option<String>,
    /// Variable path or `${...}` expression
    pub expression: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputClause {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default)]
    pub description: Option<String>,
    pub input_entries: Vec<Value>,
    pub output_entries: Vec<Value>,
}

/// A decision table as deployed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTable {
    pub key: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub hit_policy: HitPolicy,
    #[serde(default)]
    pub aggregation: Option<Aggregation>,
    pub inputs: Vec<InputClause>,
    pub outputs: Vec<OutputClause>,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl DecisionTable {
    /// Parse a resource, choosing YAML or JSON by extension
    pub fn parse(resource_name: &str, source: &str) -> Result<Self, DecisionError> {
        let lower = resource_name.to_ascii_lowercase();
        if lower.ends_with(".yaml") || lower.ends_with(".yml") {
            serde_yaml::from_str(source).map_err(|e| DecisionError::Syntax(e.to_string()))
        } else if lower.ends_with(".json") {
            serde_json::from_str(source).map_err(|e| DecisionError::Syntax(e.to_string()))
        } else {
            Err(DecisionError::UnsupportedResource(resource_name.to_string()))
        }
    }

    fn invalid(&self, message: impl Into<String>) -> DecisionError {
        DecisionError::InvalidTable {
            key: self.key.clone(),
            message: message.into(),
        }
    }

    /// Validate the table and parse every entry
    pub fn compile(self) -> Result<CompiledDecision, DecisionError> {
        if self.key.trim().is_empty() {
            return Err(self.invalid("key must not be empty"));
        }
        if self.outputs.is_empty() {
            return Err(self.invalid("at least one output is required"));
        }
        if let Some(aggregation) = self.aggregation {
            if self.hit_policy != HitPolicy::Collect {
                return Err(self.invalid(format!(
                    "aggregation {aggregation:?} needs hit policy collect"
                )));
            }
            if self.outputs.len() != 1 {
                return Err(self.invalid("aggregation needs exactly one output"));
            }
        }

        let inputs = self
            .inputs
            .iter()
            .map(|input| {
                Expression::parse(&input.expression).map_err(|e| DecisionError::Input {
                    key: self.key.clone(),
                    input: input.expression.clone(),
                    source: e,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut rules = Vec::with_capacity(self.rules.len());
        for (index, rule) in self.rules.iter().enumerate() {
            let number = index + 1;
            if rule.input_entries.len() != self.inputs.len() {
                return Err(self.invalid(format!(
                    "rule {number} has {} input entries, table has {} inputs",
                    rule.input_entries.len(),
                    self.inputs.len()
                )));
            }
            if rule.output_entries.len() != self.outputs.len() {
                return Err(self.invalid(format!(
                    "rule {number} has {} output entries, table has {} outputs",
                    rule.output_entries.len(),
                    self.outputs.len()
                )));
            }
            let tests = rule
                .input_entries
                .iter()
                .enumerate()
                .map(|(column, entry)| {
                    UnaryTests::from_value(entry).map_err(|message| DecisionError::InvalidEntry {
                        rule: number,
                        column: column + 1,
                        entry: entry_text(entry),
                        message,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            let outputs = rule
                .output_entries
                .iter()
                .enumerate()
                .map(|(column, entry)| {
                    output_value(entry).map_err(|message| DecisionError::InvalidEntry {
                        rule: number,
                        column: column + 1,
                        entry: entry_text(entry),
                        message,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            rules.push(CompiledRule { tests, outputs });
        }

        Ok(CompiledDecision {
            table: self,
            inputs,
            rules,
        })
    }
}

fn entry_text(entry: &Value) -> String {
    match entry {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Output literal; `-`, empty and null produce null
fn output_value(entry: &Value) -> Result<Value, String> {
    match entry {
        Value::String(text) if text.trim().is_empty() || text.trim() == "-" => Ok(Value::Null),
        Value::String(text) => parse_literal(text),
        Value::Array(_) | Value::Object(_) => Err("output entries must be scalars".into()),
        scalar => Ok(scalar.clone()),
    }
}

#[derive(Debug, Clone)]
struct CompiledRule {
    tests: Vec<UnaryTests>,
    outputs: Vec<Value>,
}

/// A validated table, ready to evaluate
#[derive(Debug, Clone)]
pub struct CompiledDecision {
    table: DecisionTable,
    inputs: Vec<Expression>,
    rules: Vec<CompiledRule>,
}

impl CompiledDecision {
    pub fn table(&self) -> &DecisionTable {
        &self.table
    }

    pub fn key(&self) -> &str {
        &self.table.key
    }

    fn violation(&self, message: impl Into<String>) -> DecisionError {
        DecisionError::HitPolicyViolation {
            key: self.table.key.clone(),
            policy: self.table.hit_policy.as_str(),
            message: message.into(),
        }
    }

    fn row(&self, rule: &CompiledRule) -> Map<String, Value> {
        self.table
            .outputs
            .iter()
            .zip(&rule.outputs)
            .map(|(clause, value)| (clause.name.clone(), value.clone()))
            .collect()
    }

    /// Evaluate against the variables; missing variables read as null
    pub fn evaluate(&self, variables: &Map<String, Value>) -> Result<Vec<Map<String, Value>>, DecisionError> {
        let values = self
            .inputs
            .iter()
            .map(|expression| match expression.evaluate(variables) {
                Ok(value) => Ok(value),
                Err(ExpressionError::UnknownVariable(_)) => Ok(Value::Null),
                Err(e) => Err(DecisionError::Input {
                    key: self.table.key.clone(),
                    input: expression.source().to_string(),
                    source: e,
                }),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let matched: Vec<(usize, &CompiledRule)> = self
            .rules
            .iter()
            .enumerate()
            .filter(|(_, rule)| rule.tests.iter().zip(&values).all(|(test, value)| test.matches(value)))
            .collect();
        debug!(
            decision_key = %self.table.key,
            matched = ?matched.iter().map(|(i, _)| i + 1).collect::<Vec<_>>(),
            "decision evaluated"
        );

        match self.table.hit_policy {
            HitPolicy::Unique => match matched.as_slice() {
                [] => Ok(Vec::new()),
                [(_, rule)] => Ok(vec![self.row(rule)]),
                many => Err(self.violation(format!(
                    "rules {} all matched",
                    many.iter().map(|(i, _)| (i + 1).to_string()).collect::<Vec<_>>().join(", ")
                ))),
            },
            HitPolicy::First => Ok(matched.first().map(|(_, rule)| self.row(rule)).into_iter().collect()),
            HitPolicy::Any => {
                let mut rows = matched.iter().map(|(_, rule)| self.row(rule));
                let Some(first) = rows.next() else {
                    return Ok(Vec::new());
                };
                if rows.any(|row| row != first) {
                    return Err(self.violation("matching rules produce different outputs"));
                }
                Ok(vec![first])
            }
            HitPolicy::RuleOrder => Ok(matched.iter().map(|(_, rule)| self.row(rule)).collect()),
            HitPolicy::Collect => match self.table.aggregation {
                None => Ok(matched.iter().map(|(_, rule)| self.row(rule)).collect()),
                Some(aggregation) => {
                    let values: Vec<&Value> = matched.iter().map(|(_, rule)| &rule.outputs[0]).collect();
                    let result = self.aggregate(aggregation, &values)?;
                    let mut row = Map::new();
                    row.insert(self.table.outputs[0].name.clone(), result);
                    Ok(vec![row])
                }
            },
        }
    }

    fn aggregate(&self, aggregation: Aggregation, values: &[&Value]) -> Result<Value, DecisionError> {
        if aggregation == Aggregation::Count {
            return Ok(Value::from(values.len()));
        }
        let numbers = values
            .iter()
            .map(|v| {
                v.as_f64()
                    .ok_or_else(|| self.violation(format!("cannot aggregate non-numeric output {v}")))
            })
            .collect::<Result<Vec<f64>, _>>()?;
        if numbers.is_empty() {
            return Ok(Value::Null);
        }
        let result = match aggregation {
            Aggregation::Sum => numbers.iter().sum(),
            Aggregation::Min => numbers.iter().copied().fold(f64::INFINITY, f64::min),
            Aggregation::Max => numbers.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Aggregation::Count => numbers.len() as f64,
        };
        Ok(number_value(result))
    }
}

/// Integral results stay integers
fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const WAGON_CLASS: &str = r#"
key: wagon_class
name: Wagon class
hit_policy: unique
inputs:
  - { label: Axles, expression: wagon.axles }
  - { label: Load, expression: load_tonnes }
outputs:
  - { name: class }
  - { name: surcharge }
rules:
  - input_entries: ["<= 2", "< 40"]
    output_entries: [light, 0]
  - input_entries: ["<= 2", ">= 40"]
    output_entries: [medium, 25.5]
  - input_entries: ["> 2", "-"]
    output_entries: ['"heavy"', "100"]
"#;

    fn compile(source: &str) -> CompiledDecision {
        DecisionTable::parse("table.yaml", source).unwrap().compile().unwrap()
    }

    fn vars(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_unique_table() {
        let table = compile(WAGON_CLASS);
        let rows = table
            .evaluate(&vars(json!({"wagon": {"axles": 2}, "load_tonnes": 52})))
            .unwrap();
        assert_eq!(rows, vec![vars(json!({"class": "medium", "surcharge": 25.5}))]);

        let rows = table.evaluate(&vars(json!({"wagon": {"axles": 4}}))).unwrap();
        assert_eq!(rows, vec![vars(json!({"class": "heavy", "surcharge": 100}))]);

        // missing variable reads as null, no rule matches
        assert!(table.evaluate(&Map::new()).unwrap().is_empty());
    }

    #[test]
    fn test_unique_violation() {
        let source = WAGON_CLASS.replace("\"> 2\"", "\">= 2\"");
        let table = compile(&source);
        let err = table
            .evaluate(&vars(json!({"wagon": {"axles": 2}, "load_tonnes": 10})))
            .unwrap_err();
        assert!(matches!(err, DecisionError::HitPolicyViolation { policy: "UNIQUE", .. }));
    }

    const PORT_FEES: &str = r#"
{
  "key": "port_fees",
  "hit_policy": "rule_order",
  "inputs": [{ "expression": "port" }],
  "outputs": [{ "name": "fee" }],
  "rules": [
    { "input_entries": ["\"DEHAM\", \"NLRTM\""], "output_entries": [120] },
    { "input_entries": ["-"], "output_entries": [15] },
    { "input_entries": ["not(\"DEHAM\")"], "output_entries": [7] }
  ]
}
"#;

    #[test]
    fn test_policies_over_same_rules() {
        let mut table = DecisionTable::parse("fees.json", PORT_FEES).unwrap();
        let hamburg = vars(json!({"port": "DEHAM"}));
        let rotterdam = vars(json!({"port": "NLRTM"}));

        let rows = table.clone().compile().unwrap().evaluate(&rotterdam).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["fee"], json!(120));

        table.hit_policy = HitPolicy::First;
        let rows = table.clone().compile().unwrap().evaluate(&hamburg).unwrap();
        assert_eq!(rows, vec![vars(json!({"fee": 120}))]);

        table.hit_policy = HitPolicy::Any;
        assert!(table.clone().compile().unwrap().evaluate(&hamburg).is_err());

        table.hit_policy = HitPolicy::Collect;
        table.aggregation = Some(Aggregation::Sum);
        let rows = table.clone().compile().unwrap().evaluate(&rotterdam).unwrap();
        assert_eq!(rows, vec![vars(json!({"fee": 142}))]);

        table.aggregation = Some(Aggregation::Max);
        let rows = table.clone().compile().unwrap().evaluate(&hamburg).unwrap();
        assert_eq!(rows, vec![vars(json!({"fee": 120}))]);

        table.aggregation = Some(Aggregation::Count);
        let rows = table.clone().compile().unwrap().evaluate(&hamburg).unwrap();
        assert_eq!(rows, vec![vars(json!({"fee": 2}))]);
    }

    #[test]
    fn test_any_with_identical_outputs() {
        let source = r#"
key: customs
hit_policy: any
inputs: [{ expression: "${value > 1000}" }, { expression: origin }]
outputs: [{ name: inspect }]
rules:
  - { input_entries: [true, "-"], output_entries: [true] }
  - { input_entries: ["-", "CN"], output_entries: [true] }
  - { input_entries: [false, "not(\"CN\")"], output_entries: [false] }
"#;
        let table = compile(source);
        let rows = table
            .evaluate(&vars(json!({"value": 5000, "origin": "CN"})))
            .unwrap();
        assert_eq!(rows, vec![vars(json!({"inspect": true}))]);
        let rows = table
            .evaluate(&vars(json!({"value": 10, "origin": "DE"})))
            .unwrap();
        assert_eq!(rows, vec![vars(json!({"inspect": false}))]);
    }

    #[test]
    fn test_invalid_tables() {
        let wrong_arity = WAGON_CLASS.replace("[\"> 2\", \"-\"]", "[\"> 2\"]");
        assert!(matches!(
            DecisionTable::parse("t.yaml", &wrong_arity).unwrap().compile(),
            Err(DecisionError::InvalidTable { .. })
        ));

        let bad_entry = WAGON_CLASS.replace("\"< 40\"", "\"<\"");
        assert!(matches!(
            DecisionTable::parse("t.yaml", &bad_entry).unwrap().compile(),
            Err(DecisionError::InvalidEntry { rule: 1, column: 2, .. })
        ));

        let mut aggregated = DecisionTable::parse("t.yaml", WAGON_CLASS).unwrap();
        aggregated.aggregation = Some(Aggregation::Sum);
        assert!(aggregated.compile().is_err());

        assert!(matches!(
            DecisionTable::parse("t.xml", WAGON_CLASS),
            Err(DecisionError::UnsupportedResource(_))
        ));
        assert!(matches!(
            DecisionTable::parse("t.yaml", "key: [unclosed"),
            Err(DecisionError::Syntax(_))
        ));
    }
}
