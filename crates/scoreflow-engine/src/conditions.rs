// Conditional step expressions
//
// A step's `if` expression is evaluated against the execution scope
// (previous step outputs plus app metadata). The grammar is deliberately
// small: equality, inequality, negation, and bare truthy lookups over
// dotted paths. Anything unresolvable evaluates falsy rather than failing
// the step.

use serde_json::{Map, Value};

/// Evaluate an expression against the execution scope
pub fn evaluate(expression: &str, scope: &Map<String, Value>) -> bool {
    let expression = expression.trim();
    if expression.is_empty() {
        return true;
    }

    if let Some(rest) = expression.strip_prefix('!') {
        return !evaluate(rest, scope);
    }

    if let Some((lhs, rhs)) = split_operator(expression, "==") {
        return operand(lhs, scope) == operand(rhs, scope);
    }
    if let Some((lhs, rhs)) = split_operator(expression, "!=") {
        return operand(lhs, scope) != operand(rhs, scope);
    }

    truthy(lookup(expression, scope))
}

fn split_operator<'a>(expression: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    expression
        .split_once(op)
        .map(|(lhs, rhs)| (lhs.trim(), rhs.trim()))
}

/// Resolve one side of a comparison: a quoted literal, a scope path, or a
/// bare literal when the path does not resolve
fn operand(token: &str, scope: &Map<String, Value>) -> String {
    if let Some(literal) = unquote(token) {
        return literal.to_string();
    }
    match lookup(token, scope) {
        Some(value) => value_to_string(value),
        None => token.to_string(),
    }
}

fn unquote(token: &str) -> Option<&str> {
    let token = token.trim();
    for quote in ['\'', '"'] {
        if token.len() >= 2 && token.starts_with(quote) && token.ends_with(quote) {
            return Some(&token[1..token.len() - 1]);
        }
    }
    None
}

/// Walk a dotted path into the scope
fn lookup<'a>(path: &str, scope: &'a Map<String, Value>) -> Option<&'a Value> {
    let mut parts = path.trim().split('.');
    let mut current = scope.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => !s.is_empty() && s != "false",
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(_)) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> Map<String, Value> {
        let value = json!({
            "steps": {
                "build": {
                    "outputs": {
                        "enabled": "true",
                        "replicas": 3,
                        "empty": "",
                    }
                }
            },
            "app": { "name": "demo" }
        });
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_equality() {
        let scope = scope();
        assert!(evaluate("steps.build.outputs.enabled == 'true'", &scope));
        assert!(evaluate("app.name == \"demo\"", &scope));
        assert!(!evaluate("app.name == 'other'", &scope));
        assert!(evaluate("steps.build.outputs.replicas == 3", &scope));
    }

    #[test]
    fn test_inequality_and_negation() {
        let scope = scope();
        assert!(evaluate("app.name != 'other'", &scope));
        assert!(evaluate("!steps.build.outputs.empty", &scope));
        assert!(!evaluate("!app.name", &scope));
    }

    #[test]
    fn test_truthy_lookup() {
        let scope = scope();
        assert!(evaluate("app.name", &scope));
        assert!(evaluate("steps.build.outputs.replicas", &scope));
        assert!(!evaluate("steps.build.outputs.empty", &scope));
        assert!(!evaluate("steps.missing.outputs.x", &scope));
    }

    #[test]
    fn test_empty_expression_is_true() {
        assert!(evaluate("", &scope()));
        assert!(evaluate("   ", &scope()));
    }
}
