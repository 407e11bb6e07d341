use std::{fmt, sync::Arc};

use serde_json::Value;
use strum::{Display, EnumString};

/// Labels written by migrations, which are not carried into other versions.
const CONVERSION_LABEL_PREFIX_PATTERN: &str = "observability.io/conversion-*";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "camelCase")]
pub enum RuleType {
    Annotation,
    Label,
    Finalizer,
    CustomField,
}

/// Either an exact key or a prefix ending in `*`, like `team/*`. A single `*`
/// matches everything.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Pattern {
    Exact(String),
    Prefix(String),
}

impl Pattern {
    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::Exact(exact) => exact == key,
            Self::Prefix(prefix) => key.starts_with(prefix.as_str()),
        }
    }
}

impl From<&str> for Pattern {
    fn from(pattern: &str) -> Self {
        match pattern.strip_suffix('*') {
            Some(prefix) => Self::Prefix(prefix.to_owned()),
            None => Self::Exact(pattern.to_owned()),
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(exact) => f.write_str(exact),
            Self::Prefix(prefix) => write!(f, "{prefix}*"),
        }
    }
}

/// A named value transformation. Metadata values are passed in as JSON
/// strings.
#[derive(Clone)]
pub struct Transformer {
    name: String,
    function: Arc<dyn Fn(&Value) -> Value + Send + Sync>,
}

impl Transformer {
    pub fn new(
        name: impl Into<String>,
        function: impl Fn(&Value) -> Value + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            function: Arc::new(function),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn apply(&self, value: &Value) -> Value {
        (self.function)(value)
    }

    /// Applies the transformation to a metadata string. Non-string results
    /// are stored in their JSON encoding.
    pub fn apply_str(&self, value: &str) -> String {
        match self.apply(&Value::String(value.to_owned())) {
            Value::String(transformed) => transformed,
            other => other.to_string(),
        }
    }
}

impl fmt::Debug for Transformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Transformer").field(&self.name).finish()
    }
}

#[derive(Clone, Debug)]
pub enum Action {
    Preserve,
    Drop,
    Transform(Transformer),
}

#[derive(Clone, Debug)]
pub struct Rule {
    pub rule_type: RuleType,
    pub pattern: Pattern,
    pub action: Action,
    pub priority: i32,
}

impl Rule {
    pub fn new(rule_type: RuleType, pattern: impl Into<Pattern>, action: Action) -> Self {
        Self {
            rule_type,
            pattern: pattern.into(),
            action,
            priority: 0,
        }
    }

    pub fn preserve(rule_type: RuleType, pattern: impl Into<Pattern>) -> Self {
        Self::new(rule_type, pattern, Action::Preserve)
    }

    pub fn drop(rule_type: RuleType, pattern: impl Into<Pattern>) -> Self {
        Self::new(rule_type, pattern, Action::Drop)
    }

    pub fn transform(
        rule_type: RuleType,
        pattern: impl Into<Pattern>,
        transformer: Transformer,
    ) -> Self {
        Self::new(rule_type, pattern, Action::Transform(transformer))
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// An ordered list of [`Rule`]s.
///
/// For any key, the matching rule with the highest priority wins. Among rules
/// with equal priority the one registered first wins.
#[derive(Clone, Debug, Default)]
pub struct PreservationPolicy {
    rules: Vec<Rule>,
}

impl PreservationPolicy {
    /// A policy without any rules. Nothing is retained.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Retains every label, annotation, finalizer and unknown field at
    /// priority `0`.
    pub fn preserve_all() -> Self {
        Self::empty()
            .with_rule(Rule::preserve(RuleType::Annotation, "*"))
            .with_rule(Rule::preserve(RuleType::Label, "*"))
            .with_rule(Rule::preserve(RuleType::Finalizer, "*"))
            .with_rule(Rule::preserve(RuleType::CustomField, "*"))
    }

    /// [`Self::preserve_all`], except for the bookkeeping labels written by
    /// previous migrations.
    pub fn standard() -> Self {
        Self::preserve_all().with_rule(
            Rule::drop(RuleType::Label, CONVERSION_LABEL_PREFIX_PATTERN).with_priority(1),
        )
    }

    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn resolve(&self, rule_type: RuleType, key: &str) -> Option<&Rule> {
        self.rules
            .iter()
            .filter(|rule| rule.rule_type == rule_type && rule.pattern.matches(key))
            .fold(None, |best: Option<&Rule>, rule| match best {
                Some(best) if best.priority >= rule.priority => Some(best),
                _ => Some(rule),
            })
    }
}
