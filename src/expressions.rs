use indexmap::IndexMap;
use jaq_core::load::{Arena, File, Loader};
use jaq_core::{compile::Compiler, Ctx, RcIter};
use jaq_json::Val;
use serde_json::Value;
use snafu::prelude::*;
use tracing::debug;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("JQ load errors in {expr:?}: {errors}"))]
    JqLoad { expr: String, errors: String },

    #[snafu(display("JQ compile errors in {expr:?}: {errors}"))]
    JqCompile { expr: String, errors: String },

    #[snafu(display("JQ evaluation error in {expr:?} on {input}: {message}"))]
    JqEvaluation {
        expr: String,
        input: Value,
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// The bundle of values visible to expression evaluation at a point, exposed
/// to jq as `$context`, `$input`, `$output`, `$secrets`, `$authorization`,
/// `$task`, `$workflow` and `$runtime`.
///
/// `secrets` is always present; it is never included in trace output.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    pub context: Value,
    pub input: Value,
    pub output: Value,
    pub secrets: Value,
    pub authorization: Option<Value>,
    pub task: Option<Value>,
    pub workflow: Value,
    pub runtime: Value,
    /// Point-scoped bindings such as `$error` in catch handlers or the loop
    /// variable of a `for` task.
    pub locals: IndexMap<String, Value>,
}

impl Scope {
    #[must_use]
    pub fn with_local(mut self, name: impl Into<String>, value: Value) -> Self {
        self.locals.insert(name.into(), value);
        self
    }

    fn bindings(&self) -> Vec<(String, Value)> {
        let mut vars = vec![
            ("$context".to_string(), self.context.clone()),
            ("$input".to_string(), self.input.clone()),
            ("$output".to_string(), self.output.clone()),
            ("$secrets".to_string(), self.secrets.clone()),
            (
                "$authorization".to_string(),
                self.authorization.clone().unwrap_or(Value::Null),
            ),
            (
                "$task".to_string(),
                self.task.clone().unwrap_or(Value::Null),
            ),
            ("$workflow".to_string(), self.workflow.clone()),
            ("$runtime".to_string(), self.runtime.clone()),
        ];
        for (name, value) in &self.locals {
            vars.push((format!("${name}"), value.clone()));
        }
        vars
    }
}

/// True when a string leaf is a runtime expression (`${ … }`).
#[must_use]
pub fn is_expression(candidate: &str) -> bool {
    let trimmed = candidate.trim();
    trimmed.starts_with("${") && trimmed.ends_with('}')
}

fn strip_wrapper(expression: &str) -> &str {
    let trimmed = expression.trim();
    if trimmed.starts_with("${") && trimmed.ends_with('}') {
        trimmed[2..trimmed.len() - 1].trim()
    } else {
        trimmed
    }
}

/// Evaluate an expression against `input` with the given scope.
///
/// Accepts both wrapped (`${ .x + 1 }`) and bare (`.x + 1`) forms; transform
/// hooks in the DSL use either.
pub fn evaluate(expression: &str, input: &Value, scope: &Scope) -> Result<Value> {
    let code = strip_wrapper(expression);
    debug!(expr = code, "evaluating jq expression");
    run_jq(code, input, scope)
}

/// Evaluate the JSON template form: string leaves that are `${…}` expressions
/// (all string leaves when `force`) are evaluated against `input`; objects and
/// arrays are rebuilt structurally; a `null` template returns `input`
/// unchanged.
pub fn evaluate_template(
    template: &Value,
    input: &Value,
    scope: &Scope,
    force: bool,
) -> Result<Value> {
    match template {
        Value::Null => Ok(input.clone()),
        Value::String(leaf) => {
            if force || is_expression(leaf) {
                evaluate(leaf, input, scope)
            } else {
                Ok(Value::String(leaf.clone()))
            }
        }
        Value::Object(map) => {
            let mut rebuilt = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                rebuilt.insert(key.clone(), evaluate_template(value, input, scope, force)?);
            }
            Ok(Value::Object(rebuilt))
        }
        Value::Array(items) => {
            let mut rebuilt = Vec::with_capacity(items.len());
            for item in items {
                rebuilt.push(evaluate_template(item, input, scope, force)?);
            }
            Ok(Value::Array(rebuilt))
        }
        other => Ok(other.clone()),
    }
}

/// Truthiness for `switch.when` and `catch.when` conditions: `false` and
/// `null` are falsy, everything else is truthy.
#[must_use]
pub fn is_truthy(value: &Value) -> bool {
    !matches!(value, Value::Bool(false) | Value::Null)
}

fn run_jq(code: &str, input: &Value, scope: &Scope) -> Result<Value> {
    let bindings = scope.bindings();
    let var_names: Vec<&str> = bindings.iter().map(|(name, _)| name.as_str()).collect();

    let arena = Arena::default();
    let loader = Loader::new(jaq_std::defs().chain(jaq_json::defs()));
    let file: File<_, ()> = File { path: (), code };

    let modules = loader.load(&arena, file).map_err(|errs| Error::JqLoad {
        expr: code.to_string(),
        errors: format!("{errs:?}"),
    })?;

    let compiler = Compiler::default()
        .with_funs(jaq_std::funs().chain(jaq_json::funs()))
        .with_global_vars(var_names.iter().copied());
    let filter = compiler.compile(modules).map_err(|errs| Error::JqCompile {
        expr: code.to_string(),
        errors: format!("{errs:?}"),
    })?;

    let var_values: Vec<Val> = bindings
        .into_iter()
        .map(|(_, value)| value.into())
        .collect();
    let inputs = RcIter::new(core::iter::empty());
    let mut results = filter.run((Ctx::new(var_values, &inputs), input.clone().into()));

    match results.next() {
        None => Ok(Value::Null),
        Some(Ok(val)) => Ok(val.into()),
        Some(Err(e)) => Err(Error::JqEvaluation {
            expr: code.to_string(),
            input: input.clone(),
            message: format!("{e}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn evaluates_wrapped_expression() {
        let result = evaluate("${ .x + 1 }", &json!({"x": 1}), &Scope::default()).unwrap();
        assert_eq!(result, json!(2));
    }

    #[test]
    fn evaluates_bare_expression() {
        let result = evaluate(".x * 2", &json!({"x": 3}), &Scope::default()).unwrap();
        assert_eq!(result, json!(6));
    }

    #[test]
    fn scope_variables_are_bound() {
        let scope = Scope {
            context: json!({"region": "eu"}),
            secrets: json!({"token": "hunter2"}),
            ..Scope::default()
        };
        let result = evaluate("${ $context.region }", &Value::Null, &scope).unwrap();
        assert_eq!(result, json!("eu"));
        let secret = evaluate("${ $secrets.token }", &Value::Null, &scope).unwrap();
        assert_eq!(secret, json!("hunter2"));
    }

    #[test]
    fn locals_are_bound_with_dollar_prefix() {
        let scope = Scope::default().with_local("error", json!({"type": "runtime"}));
        let result = evaluate("${ $error.type }", &Value::Null, &scope).unwrap();
        assert_eq!(result, json!("runtime"));
    }

    #[test]
    fn template_rebuilds_structure() {
        let template = json!({
            "doubled": "${ .n * 2 }",
            "literal": "plain string",
            "nested": ["${ .n }", 7]
        });
        let result =
            evaluate_template(&template, &json!({"n": 4}), &Scope::default(), false).unwrap();
        assert_eq!(
            result,
            json!({"doubled": 8, "literal": "plain string", "nested": [4, 7]})
        );
    }

    #[test]
    fn null_template_passes_input_through() {
        let input = json!({"keep": true});
        let result = evaluate_template(&Value::Null, &input, &Scope::default(), false).unwrap();
        assert_eq!(result, input);
    }

    #[test]
    fn force_evaluates_all_string_leaves() {
        let template = json!({"v": ".n"});
        let result =
            evaluate_template(&template, &json!({"n": 9}), &Scope::default(), true).unwrap();
        assert_eq!(result, json!({"v": 9}));
    }

    #[test]
    fn parse_failure_reports_the_expression() {
        let err = evaluate("${ ..= }", &Value::Null, &Scope::default()).unwrap_err();
        assert!(err.to_string().contains("..="));
    }

    #[test]
    fn truthiness_matches_switch_semantics() {
        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!(0)));
        assert!(is_truthy(&json!("")));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&Value::Null));
    }
}
