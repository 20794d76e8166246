//! Per-execution template context (§4.3 "Execution context").

use std::collections::HashMap;

use serde_json::Value;

/// Accumulates `input` and every completed step's `output`/`error` so later
/// steps can reference them by dotted path (`steps.fetch_user.output.id`).
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    input: Value,
    steps: HashMap<String, StepOutcome>,
}

#[derive(Debug, Clone, Default)]
struct StepOutcome {
    output: Option<Value>,
    error: Option<Value>,
}

impl ExecutionContext {
    pub fn new(input: Value) -> Self {
        Self { input, steps: HashMap::new() }
    }

    pub fn record_output(&mut self, step_name: &str, output: Value) {
        self.steps.entry(step_name.to_string()).or_default().output = Some(output);
    }

    pub fn record_error(&mut self, step_name: &str, error: &str) {
        self.steps.entry(step_name.to_string()).or_default().error = Some(Value::String(error.to_string()));
    }

    /// Render the context as one JSON object (`{"input": ..., "steps": {...}}`)
    /// for template lookup and condition evaluation.
    pub fn as_value(&self) -> Value {
        let mut steps = serde_json::Map::new();
        for (name, outcome) in &self.steps {
            let mut entry = serde_json::Map::new();
            if let Some(output) = &outcome.output {
                entry.insert("output".to_string(), output.clone());
            }
            if let Some(error) = &outcome.error {
                entry.insert("error".to_string(), error.clone());
            }
            steps.insert(name.clone(), Value::Object(entry));
        }

        let mut root = serde_json::Map::new();
        root.insert("input".to_string(), self.input.clone());
        root.insert("steps".to_string(), Value::Object(steps));
        Value::Object(root)
    }

    /// Dotted-path lookup (`a.b.c`) into the rendered context; array indices
    /// are not supported, matching §4.3/§9's "dotted path only" scope.
    pub fn lookup(&self, path: &str) -> Option<Value> {
        let root = self.as_value();
        path.split('.').try_fold(root, |current, segment| match current {
            Value::Object(mut map) => map.remove(segment),
            _ => None,
        })
    }

    /// Evaluate a guard/branch expression: either a dotted-path truthiness
    /// check (`steps.check.output.ok`) or an equality/inequality comparison
    /// against a literal (`input.tier == "gold"`), with a leading `!` for
    /// negation. Anything more elaborate is out of scope (§9 Non-goals).
    pub fn evaluate_condition(&self, expression: &str) -> bool {
        let expression = expression.trim();
        if let Some(rest) = expression.strip_prefix('!') {
            return !self.evaluate_condition(rest);
        }
        if let Some((left, right)) = expression.split_once("!=") {
            return !self.compare(left.trim(), right.trim());
        }
        if let Some((left, right)) = expression.split_once("==") {
            return self.compare(left.trim(), right.trim());
        }
        self.lookup(expression).is_some_and(|v| is_truthy(&v))
    }

    fn compare(&self, path: &str, literal: &str) -> bool {
        let left = self.lookup(path).unwrap_or(Value::Null);
        let right = parse_literal(literal);
        left == right
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Parse an equality literal: quoted strings, `true`/`false`, numbers, or
/// an unquoted bareword treated as a string.
fn parse_literal(literal: &str) -> Value {
    if let Some(unquoted) = literal.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        return Value::String(unquoted.to_string());
    }
    match literal {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "null" => Value::Null,
        other => other.parse::<f64>().map(|n| serde_json::json!(n)).unwrap_or_else(|_| Value::String(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn looks_up_input_and_step_output() {
        let mut ctx = ExecutionContext::new(serde_json::json!({"user_id": 7}));
        ctx.record_output("fetch_user", serde_json::json!({"name": "ada"}));

        assert_eq!(ctx.lookup("input.user_id"), Some(serde_json::json!(7)));
        assert_eq!(ctx.lookup("steps.fetch_user.output.name"), Some(serde_json::json!("ada")));
        assert_eq!(ctx.lookup("steps.missing.output"), None);
    }

    #[test]
    fn records_step_error_separately_from_output() {
        let mut ctx = ExecutionContext::new(serde_json::json!({}));
        ctx.record_error("call_api", "timeout");
        assert_eq!(ctx.lookup("steps.call_api.error"), Some(serde_json::json!("timeout")));
        assert_eq!(ctx.lookup("steps.call_api.output"), None);
    }

    #[test]
    fn evaluates_truthy_path_and_negation() {
        let ctx = ExecutionContext::new(serde_json::json!({"enabled": true, "count": 0}));
        assert!(ctx.evaluate_condition("input.enabled"));
        assert!(!ctx.evaluate_condition("!input.enabled"));
        assert!(!ctx.evaluate_condition("input.count"));
        assert!(!ctx.evaluate_condition("input.missing"));
    }

    #[test]
    fn evaluates_equality_and_inequality_against_literals() {
        let ctx = ExecutionContext::new(serde_json::json!({"tier": "gold"}));
        assert!(ctx.evaluate_condition("input.tier == \"gold\""));
        assert!(!ctx.evaluate_condition("input.tier == \"silver\""));
        assert!(ctx.evaluate_condition("input.tier != \"silver\""));
    }
}
