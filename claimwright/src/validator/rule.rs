//! Built-in validation rule language.
//!
//! Rules are JSON: a shorthand string (`"string"`, `"boolean|optional"`,
//! `"string|min:3|max:64"`), an object (`{"type": "enum", "values": ["a", "b"]}`), or an array
//! of alternatives of which at least one has to pass.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::ValidationFailure;

static EMAIL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email pattern compiles"));

static URL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^https?://[^\s/$.?#][^\s]*$").expect("url pattern compiles"));

/// Minimum and maximum digit count of a phone number (E.164 allows at most 15).
const PHONE_DIGITS: std::ops::RangeInclusive<usize> = 7..=15;

/// Error raised when a rule definition itself is malformed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid rule at '{path}': {message}")]
pub struct RuleError {
    /// Location inside the rule, e.g. `.props.street` (empty for the root)
    pub path: String,
    /// What is wrong
    pub message: String,
}

impl RuleError {
    fn new(path: &str, message: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleKind {
    Any,
    String,
    Number,
    Boolean,
    Email,
    Enum,
    Phone,
    Url,
    Array,
    Object,
    Null,
}

impl RuleKind {
    fn parse(name: &str, path: &str) -> Result<Self, RuleError> {
        Ok(match name {
            "any" => Self::Any,
            "string" => Self::String,
            "number" => Self::Number,
            "boolean" => Self::Boolean,
            "email" => Self::Email,
            "enum" => Self::Enum,
            "phone" => Self::Phone,
            "url" => Self::Url,
            "array" => Self::Array,
            "object" => Self::Object,
            "null" => Self::Null,
            other => return Err(RuleError::new(path, format!("unknown type '{other}'"))),
        })
    }
}

/// A single typed check with its constraints.
#[derive(Debug, Clone)]
struct Check {
    kind: RuleKind,
    optional: bool,
    allow_empty: bool,
    trim: bool,
    min: Option<f64>,
    max: Option<f64>,
    length: Option<usize>,
    pattern: Option<Regex>,
    values: Vec<Value>,
    items: Option<Box<Rule>>,
    props: Option<BTreeMap<String, Rule>>,
    strict: bool,
    integer: bool,
    positive: bool,
}

impl Check {
    const fn new(kind: RuleKind) -> Self {
        Self {
            kind,
            optional: false,
            allow_empty: true,
            trim: false,
            min: None,
            max: None,
            length: None,
            pattern: None,
            values: Vec::new(),
            items: None,
            props: None,
            strict: false,
            integer: false,
            positive: false,
        }
    }
}

/// A compiled validation rule.
#[derive(Debug, Clone)]
pub struct Rule(RuleNode);

#[derive(Debug, Clone)]
enum RuleNode {
    Single(Box<Check>),
    OneOf(Vec<Rule>),
}

impl Rule {
    /// Compiles a JSON rule definition.
    ///
    /// # Errors
    /// - `RuleError` if the definition uses an unknown type, an invalid pattern or a
    ///   constraint of the wrong type.
    pub fn parse(definition: &Value) -> Result<Self, RuleError> {
        parse_at(definition, "")
    }

    /// A strict object rule with exactly one property.
    #[must_use]
    pub fn single_property(key: &str, rule: Self) -> Self {
        let mut check = Check::new(RuleKind::Object);
        check.strict = true;
        check.props = Some(BTreeMap::from([(key.to_string(), rule)]));
        Self(RuleNode::Single(Box::new(check)))
    }

    /// Checks `value` located at `field`, appending every failure.
    pub fn check(&self, field: &str, value: &Value, failures: &mut Vec<ValidationFailure>) {
        match &self.0 {
            RuleNode::Single(check) => check_value(check, field, value, failures),
            RuleNode::OneOf(alternatives) => {
                let mut collected = Vec::new();
                for alternative in alternatives {
                    let mut attempt = Vec::new();
                    alternative.check(field, value, &mut attempt);
                    if attempt.is_empty() {
                        return;
                    }
                    collected.extend(attempt);
                }
                failures.extend(collected);
            }
        }
    }
}

fn parse_at(definition: &Value, path: &str) -> Result<Rule, RuleError> {
    match definition {
        Value::String(shorthand) => parse_shorthand(shorthand, path),
        Value::Array(alternatives) => {
            if alternatives.is_empty() {
                return Err(RuleError::new(path, "rule alternatives must not be empty"));
            }
            let rules = alternatives
                .iter()
                .enumerate()
                .map(|(i, alternative)| parse_at(alternative, &format!("{path}[{i}]")))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Rule(RuleNode::OneOf(rules)))
        }
        Value::Object(map) => parse_object(map, path),
        _ => Err(RuleError::new(
            path,
            "rule must be a type name, an object or an array of rules",
        )),
    }
}

fn parse_shorthand(shorthand: &str, path: &str) -> Result<Rule, RuleError> {
    let mut parts = shorthand.split('|').map(str::trim);
    let kind = RuleKind::parse(parts.next().unwrap_or_default(), path)?;
    let mut check = Check::new(kind);

    for flag in parts {
        let (name, argument) = flag
            .split_once(':')
            .map_or((flag, None), |(name, argument)| (name, Some(argument)));
        match (name, argument) {
            ("optional", None | Some("true")) => check.optional = true,
            ("empty", Some(argument)) => check.allow_empty = parse_flag(argument, path)?,
            ("trim", None | Some("true")) => check.trim = true,
            ("min", Some(argument)) => check.min = Some(parse_number(argument, path)?),
            ("max", Some(argument)) => check.max = Some(parse_number(argument, path)?),
            ("integer", None | Some("true")) => check.integer = true,
            ("positive", None | Some("true")) => check.positive = true,
            _ => {
                return Err(RuleError::new(
                    path,
                    format!("unsupported shorthand flag '{flag}'"),
                ))
            }
        }
    }

    Ok(Rule(RuleNode::Single(Box::new(check))))
}

fn parse_flag(argument: &str, path: &str) -> Result<bool, RuleError> {
    argument
        .parse()
        .map_err(|_| RuleError::new(path, format!("expected true or false, got '{argument}'")))
}

fn parse_number(argument: &str, path: &str) -> Result<f64, RuleError> {
    argument
        .parse()
        .map_err(|_| RuleError::new(path, format!("expected a number, got '{argument}'")))
}

#[allow(clippy::too_many_lines)]
fn parse_object(map: &serde_json::Map<String, Value>, path: &str) -> Result<Rule, RuleError> {
    let kind_name = match map.get("type") {
        Some(Value::String(name)) => name.as_str(),
        Some(_) => return Err(RuleError::new(path, "'type' must be a string")),
        None => "any",
    };
    let mut check = Check::new(RuleKind::parse(kind_name, path)?);

    for (name, constraint) in map {
        let at = format!("{path}.{name}");
        match name.as_str() {
            "type" | "country" | "normalize" | "convert" | "messages" => {}
            // A default makes an absent value acceptable.
            "optional" | "nullable" => check.optional |= expect_bool(constraint, &at)?,
            "default" => check.optional = true,
            "empty" => check.allow_empty = expect_bool(constraint, &at)?,
            "trim" => check.trim = expect_bool(constraint, &at)?,
            "strict" => check.strict = expect_bool(constraint, &at)?,
            "integer" => check.integer = expect_bool(constraint, &at)?,
            "positive" => check.positive = expect_bool(constraint, &at)?,
            "min" => check.min = Some(expect_number(constraint, &at)?),
            "max" => check.max = Some(expect_number(constraint, &at)?),
            "length" => {
                let length = constraint
                    .as_u64()
                    .and_then(|length| usize::try_from(length).ok())
                    .ok_or_else(|| RuleError::new(&at, "expected a non-negative integer"))?;
                check.length = Some(length);
            }
            "pattern" => {
                let source = constraint
                    .as_str()
                    .ok_or_else(|| RuleError::new(&at, "expected a regular expression string"))?;
                check.pattern = Some(compile_pattern(source, &at)?);
            }
            "values" => {
                check.values = constraint
                    .as_array()
                    .cloned()
                    .ok_or_else(|| RuleError::new(&at, "expected an array of values"))?;
            }
            "items" => check.items = Some(Box::new(parse_at(constraint, &at)?)),
            "props" | "properties" => {
                let props = constraint
                    .as_object()
                    .ok_or_else(|| RuleError::new(&at, "expected an object of rules"))?;
                let mut rules = BTreeMap::new();
                for (prop, definition) in props {
                    rules.insert(prop.clone(), parse_at(definition, &format!("{at}.{prop}"))?);
                }
                check.props = Some(rules);
            }
            other => {
                return Err(RuleError::new(
                    path,
                    format!("unsupported constraint '{other}'"),
                ))
            }
        }
    }

    if check.kind == RuleKind::Enum && check.values.is_empty() {
        return Err(RuleError::new(path, "enum rules need a non-empty 'values'"));
    }

    Ok(Rule(RuleNode::Single(Box::new(check))))
}

fn expect_bool(value: &Value, path: &str) -> Result<bool, RuleError> {
    value
        .as_bool()
        .ok_or_else(|| RuleError::new(path, "expected a boolean"))
}

fn expect_number(value: &Value, path: &str) -> Result<f64, RuleError> {
    value
        .as_f64()
        .ok_or_else(|| RuleError::new(path, "expected a number"))
}

/// Compiles a pattern, accepting the `/source/flags` literal form as well as a bare source.
fn compile_pattern(source: &str, path: &str) -> Result<Regex, RuleError> {
    let expression = match source.strip_prefix('/').and_then(|rest| rest.rsplit_once('/')) {
        Some((body, flags)) if flags.chars().all(|c| "gimsuy".contains(c)) => {
            let inline: String = flags.chars().filter(|c| "ims".contains(*c)).collect();
            if inline.is_empty() {
                body.to_string()
            } else {
                format!("(?{inline}){body}")
            }
        }
        _ => source.to_string(),
    };
    Regex::new(&expression).map_err(|e| RuleError::new(path, format!("invalid pattern: {e}")))
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(_) => "boolean".to_string(),
        Value::Number(_) => "number".to_string(),
        Value::String(_) => "string".to_string(),
        Value::Array(_) => "array".to_string(),
        Value::Object(_) => "object".to_string(),
    }
}

fn type_failure(field: &str, kind: &str, expected: &str, value: &Value) -> ValidationFailure {
    ValidationFailure::new(field, kind, format!("'{field}' must be {expected}"))
        .expected(expected)
        .actual(describe(value))
}

#[allow(clippy::cast_precision_loss)]
fn check_value(check: &Check, field: &str, value: &Value, failures: &mut Vec<ValidationFailure>) {
    if value.is_null() {
        if check.optional || matches!(check.kind, RuleKind::Null) {
            return;
        }
        failures.push(ValidationFailure::new(
            field,
            "required",
            format!("'{field}' is required"),
        ));
        return;
    }

    match check.kind {
        RuleKind::Any => {}
        RuleKind::Null => failures.push(type_failure(field, "null", "null", value)),
        RuleKind::Boolean => {
            if !value.is_boolean() {
                failures.push(type_failure(field, "boolean", "a boolean", value));
            }
        }
        RuleKind::Number => {
            let Some(number) = value.as_f64() else {
                failures.push(type_failure(field, "number", "a number", value));
                return;
            };
            if check.integer && number.fract().abs() > 0.0 {
                failures.push(
                    ValidationFailure::new(field, "numberInteger", format!("'{field}' must be an integer"))
                        .actual(number.to_string()),
                );
            }
            if check.positive && number <= 0.0 {
                failures.push(
                    ValidationFailure::new(field, "numberPositive", format!("'{field}' must be positive"))
                        .actual(number.to_string()),
                );
            }
            check_bounds(check, field, number, "number", failures);
        }
        RuleKind::String | RuleKind::Email | RuleKind::Phone | RuleKind::Url => {
            let Some(text) = value.as_str() else {
                failures.push(type_failure(field, "string", "a string", value));
                return;
            };
            check_string(check, field, text, failures);
        }
        RuleKind::Enum => {
            if !check.values.contains(value) {
                let expected = check
                    .values
                    .iter()
                    .map(Value::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                failures.push(
                    ValidationFailure::new(
                        field,
                        "enumValue",
                        format!("'{field}' must be one of: {expected}"),
                    )
                    .expected(expected)
                    .actual(value.to_string()),
                );
            }
        }
        RuleKind::Array => {
            let Some(items) = value.as_array() else {
                failures.push(type_failure(field, "array", "an array", value));
                return;
            };
            if !check.allow_empty && items.is_empty() {
                failures.push(ValidationFailure::new(
                    field,
                    "arrayEmpty",
                    format!("'{field}' must not be empty"),
                ));
            }
            if let Some(length) = check.length {
                if items.len() != length {
                    failures.push(
                        ValidationFailure::new(field, "arrayLength", format!("'{field}' must contain {length} items"))
                            .expected(length.to_string())
                            .actual(items.len().to_string()),
                    );
                }
            }
            check_bounds(check, field, items.len() as f64, "array", failures);
            if let Some(rule) = &check.items {
                for (i, item) in items.iter().enumerate() {
                    rule.check(&format!("{field}[{i}]"), item, failures);
                }
            }
        }
        RuleKind::Object => {
            let Some(object) = value.as_object() else {
                failures.push(type_failure(field, "object", "an object", value));
                return;
            };
            if let Some(props) = &check.props {
                for (prop, rule) in props {
                    let nested = format!("{field}.{prop}");
                    rule.check(&nested, object.get(prop).unwrap_or(&Value::Null), failures);
                }
                if check.strict {
                    for extra in object.keys().filter(|key| !props.contains_key(*key)) {
                        failures.push(
                            ValidationFailure::new(
                                format!("{field}.{extra}"),
                                "objectStrict",
                                format!("'{field}' does not allow property '{extra}'"),
                            )
                            .expected(props.keys().cloned().collect::<Vec<_>>().join(", ")),
                        );
                    }
                }
            }
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn check_string(check: &Check, field: &str, text: &str, failures: &mut Vec<ValidationFailure>) {
    let text = if check.trim { text.trim() } else { text };

    if text.is_empty() && (!check.allow_empty || check.kind != RuleKind::String) {
        failures.push(ValidationFailure::new(
            field,
            "stringEmpty",
            format!("'{field}' must not be empty"),
        ));
        return;
    }

    let chars = text.chars().count();
    if let Some(length) = check.length {
        if chars != length {
            failures.push(
                ValidationFailure::new(
                    field,
                    "stringLength",
                    format!("'{field}' must be {length} characters long"),
                )
                .expected(length.to_string())
                .actual(chars.to_string()),
            );
        }
    }
    check_bounds(check, field, chars as f64, "string", failures);

    if let Some(pattern) = &check.pattern {
        if !pattern.is_match(text) {
            failures.push(
                ValidationFailure::new(
                    field,
                    "stringPattern",
                    format!("'{field}' does not match the required pattern"),
                )
                .expected(pattern.as_str())
                .actual(text),
            );
        }
    }

    match check.kind {
        RuleKind::Email if !EMAIL_PATTERN.is_match(text) => failures.push(
            ValidationFailure::new(field, "email", format!("'{field}' must be a valid e-mail"))
                .actual(text),
        ),
        RuleKind::Url if !URL_PATTERN.is_match(text) => failures.push(
            ValidationFailure::new(field, "url", format!("'{field}' must be a valid URL"))
                .actual(text),
        ),
        RuleKind::Phone if !is_phone_number(text) => failures.push(
            ValidationFailure::new(field, "phone", format!("'{field}' must be a valid phone number"))
                .actual(text),
        ),
        _ => {}
    }
}

fn check_bounds(
    check: &Check,
    field: &str,
    measured: f64,
    subject: &str,
    failures: &mut Vec<ValidationFailure>,
) {
    if let Some(min) = check.min {
        if measured < min {
            failures.push(
                ValidationFailure::new(field, &format!("{subject}Min"), format!("'{field}' is below the minimum of {min}"))
                    .expected(min.to_string())
                    .actual(measured.to_string()),
            );
        }
    }
    if let Some(max) = check.max {
        if measured > max {
            failures.push(
                ValidationFailure::new(field, &format!("{subject}Max"), format!("'{field}' is above the maximum of {max}"))
                    .expected(max.to_string())
                    .actual(measured.to_string()),
            );
        }
    }
}

/// Digits with an optional leading `+`; spaces, dashes, dots and parentheses are separators.
fn is_phone_number(text: &str) -> bool {
    let body = text.strip_prefix('+').unwrap_or(text);
    let mut digits = 0;
    for c in body.chars() {
        match c {
            '0'..='9' => digits += 1,
            ' ' | '-' | '.' | '(' | ')' => {}
            _ => return false,
        }
    }
    PHONE_DIGITS.contains(&digits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn failures_of(definition: Value, value: Value) -> Vec<ValidationFailure> {
        let rule = Rule::parse(&definition).unwrap();
        let mut failures = Vec::new();
        rule.check("claim", &value, &mut failures);
        failures
    }

    fn kinds(failures: &[ValidationFailure]) -> Vec<&str> {
        failures.iter().map(|f| f.kind.as_str()).collect()
    }

    #[test]
    fn test_shorthand_types() {
        assert!(failures_of(json!("string"), json!("x")).is_empty());
        assert_eq!(kinds(&failures_of(json!("string"), json!(1))), vec!["string"]);
        assert_eq!(kinds(&failures_of(json!("boolean"), json!(null))), vec!["required"]);
        assert!(failures_of(json!("boolean|optional"), json!(null)).is_empty());
        assert_eq!(
            kinds(&failures_of(json!("string|min:3"), json!("ab"))),
            vec!["stringMin"]
        );
    }

    #[test]
    fn test_default_accepts_null() {
        assert!(failures_of(json!({"type": "boolean", "default": false}), json!(null)).is_empty());
        assert_eq!(
            kinds(&failures_of(json!({"type": "boolean", "default": false}), json!("yes"))),
            vec!["boolean"]
        );
    }

    #[test]
    fn test_non_empty_trimmed_string() {
        let rule = json!({"type": "string", "empty": false, "trim": true});
        assert!(failures_of(rule.clone(), json!(" Jane ")).is_empty());
        assert_eq!(kinds(&failures_of(rule, json!("   "))), vec!["stringEmpty"]);
    }

    #[test]
    fn test_enum_values() {
        let rule = json!({"type": "enum", "values": ["male", "female", "other"]});
        assert!(failures_of(rule.clone(), json!("other")).is_empty());
        let failures = failures_of(rule, json!("robot"));
        assert_eq!(kinds(&failures), vec!["enumValue"]);
        assert_eq!(failures[0].actual.as_deref(), Some("\"robot\""));
    }

    #[test]
    fn test_pattern_in_literal_form() {
        let rule = json!({
            "type": "string",
            "pattern": r"/^\d{4}\-(0?[1-9]|1[012])\-(0?[1-9]|[12][0-9]|3[01])$/"
        });
        assert!(failures_of(rule.clone(), json!("1990-01-31")).is_empty());
        assert_eq!(kinds(&failures_of(rule, json!("31/01/1990"))), vec!["stringPattern"]);
    }

    #[test]
    fn test_email_phone_url() {
        assert!(failures_of(json!("email"), json!("jane@example.com")).is_empty());
        assert_eq!(kinds(&failures_of(json!("email"), json!("jane@"))), vec!["email"]);
        assert!(failures_of(json!({"type": "phone", "country": "KR"}), json!("+82 10-1234-5678")).is_empty());
        assert_eq!(kinds(&failures_of(json!("phone"), json!("call me"))), vec!["phone"]);
        assert!(failures_of(json!("url"), json!("https://example.com/a.png")).is_empty());
        assert_eq!(kinds(&failures_of(json!("url"), json!("example"))), vec!["url"]);
    }

    #[test]
    fn test_number_constraints() {
        let rule = json!({"type": "number", "integer": true, "positive": true, "max": 10});
        assert!(failures_of(rule.clone(), json!(3)).is_empty());
        assert_eq!(
            kinds(&failures_of(rule, json!(-1.5))),
            vec!["numberInteger", "numberPositive"]
        );
    }

    #[test]
    fn test_nested_object_and_array() {
        let rule = json!({
            "type": "object",
            "strict": true,
            "props": {
                "street": "string",
                "tags": {"type": "array", "items": "string", "empty": false}
            }
        });
        assert!(failures_of(rule.clone(), json!({"street": "Main", "tags": ["a"]})).is_empty());

        let failures = failures_of(rule, json!({"street": 5, "tags": [1], "zip": "x"}));
        let fields: Vec<&str> = failures.iter().map(|f| f.field.as_str()).collect();
        assert_eq!(fields, vec!["claim.street", "claim.tags[0]", "claim.zip"]);
    }

    #[test]
    fn test_alternatives() {
        let rule = json!(["number", {"type": "string", "pattern": "^[0-9]+$"}]);
        assert!(failures_of(rule.clone(), json!(12)).is_empty());
        assert!(failures_of(rule.clone(), json!("12")).is_empty());
        assert_eq!(
            kinds(&failures_of(rule, json!("twelve"))),
            vec!["number", "stringPattern"]
        );
    }

    #[test]
    fn test_single_property_is_strict() {
        let rule = Rule::single_property("email", Rule::parse(&json!("email")).unwrap());
        let mut failures = Vec::new();
        rule.check("claims", &json!({"email": "a@b.co", "other": 1}), &mut failures);
        assert_eq!(kinds(&failures), vec!["objectStrict"]);
    }

    #[test]
    fn test_invalid_definitions() {
        assert!(Rule::parse(&json!("colour")).is_err());
        assert!(Rule::parse(&json!({"type": "enum"})).is_err());
        assert!(Rule::parse(&json!({"type": "string", "pattern": "("})).is_err());
        assert!(Rule::parse(&json!({"type": "string", "wat": 1})).is_err());
        assert!(Rule::parse(&json!([])).is_err());
        assert!(Rule::parse(&json!(42)).is_err());

        let err = Rule::parse(&json!({"type": "object", "props": {"a": {"type": 1}}})).unwrap_err();
        assert_eq!(err.path, ".props.a");
    }
}
