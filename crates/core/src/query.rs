//! Deferred query descriptors.
//!
//! A [`DeferredQuery`] is everything needed to run one expensive read later:
//! the query text, its bound parameters and hints, and where (and for how
//! long) its result is cached. The target cache key doubles as the
//! descriptor's identity in the pending-work registry.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{DescriptorError, DescriptorResult};

/// Opaque directives passed through to the query engine.
pub type Hints = BTreeMap<String, JsonValue>;

/// Reference to a persisted entity used as a parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity: String,
    pub id: JsonValue,
}

/// Value of a query parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ParamValue {
    /// Plain value, bound as-is.
    Scalar(JsonValue),
    /// Entity reference, bound as its identifier.
    Entity(EntityRef),
}

impl ParamValue {
    pub fn scalar(value: impl Into<JsonValue>) -> Self {
        Self::Scalar(value.into())
    }

    pub fn entity(entity: impl Into<String>, id: impl Into<JsonValue>) -> Self {
        Self::Entity(EntityRef {
            entity: entity.into(),
            id: id.into(),
        })
    }

    /// The value handed to the query engine.
    pub fn bind_value(&self) -> &JsonValue {
        match self {
            ParamValue::Scalar(value) => value,
            ParamValue::Entity(reference) => &reference.id,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Scalar(value) => write!(f, "{value}"),
            ParamValue::Entity(reference) => write!(f, "{}#{}", reference.entity, reference.id),
        }
    }
}

/// A named, optionally typed query parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryParameter {
    pub name: String,
    pub value: ParamValue,
    /// Engine-specific type hint (e.g. a SQL type name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_hint: Option<String>,
}

impl QueryParameter {
    pub fn new(name: impl Into<String>, value: ParamValue) -> Self {
        Self {
            name: name.into(),
            value,
            type_hint: None,
        }
    }

    pub fn with_type(mut self, type_hint: impl Into<String>) -> Self {
        self.type_hint = Some(type_hint.into());
        self
    }
}

impl fmt::Display for QueryParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Name: {}, Value: {}", self.name, self.value)
    }
}

/// Descriptor of one deferred query.
///
/// Two descriptors with the same `target_cache_key` are the same unit of
/// pending work. Deserialization re-validates the descriptor, so a payload
/// with an empty key or duplicate parameter names is rejected as malformed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawDeferredQuery")]
pub struct DeferredQuery {
    target_cache_key: String,
    query: String,
    parameters: Vec<QueryParameter>,
    hints: Hints,
    /// Lifetime of the cached result. Zero means no expiry.
    result_ttl: Duration,
}

impl DeferredQuery {
    /// Create a descriptor with no parameters, no hints and no result expiry.
    pub fn new(target_cache_key: impl Into<String>, query: impl Into<String>) -> DescriptorResult<Self> {
        let target_cache_key = target_cache_key.into();
        if target_cache_key.is_empty() {
            return Err(DescriptorError::EmptyTargetKey);
        }

        Ok(Self {
            target_cache_key,
            query: query.into(),
            parameters: Vec::new(),
            hints: Hints::new(),
            result_ttl: Duration::ZERO,
        })
    }

    /// Append a parameter. Names must be non-empty and unique.
    pub fn with_parameter(mut self, parameter: QueryParameter) -> DescriptorResult<Self> {
        if parameter.name.is_empty() {
            return Err(DescriptorError::invalid_parameter("parameter name must not be empty"));
        }
        if self.parameters.iter().any(|p| p.name == parameter.name) {
            return Err(DescriptorError::invalid_parameter(format!(
                "duplicate parameter: {}",
                parameter.name
            )));
        }
        self.parameters.push(parameter);
        Ok(self)
    }

    pub fn with_parameters(
        self,
        parameters: impl IntoIterator<Item = QueryParameter>,
    ) -> DescriptorResult<Self> {
        parameters
            .into_iter()
            .try_fold(self, |query, parameter| query.with_parameter(parameter))
    }

    pub fn with_hint(mut self, name: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.hints.insert(name.into(), value.into());
        self
    }

    pub fn with_result_ttl(mut self, ttl: Duration) -> Self {
        self.result_ttl = ttl;
        self
    }

    pub fn target_cache_key(&self) -> &str {
        &self.target_cache_key
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn parameters(&self) -> &[QueryParameter] {
        &self.parameters
    }

    pub fn hints(&self) -> &Hints {
        &self.hints
    }

    pub fn result_ttl(&self) -> Duration {
        self.result_ttl
    }

    /// All parameters rendered for diagnostics, `;`-separated.
    pub fn parameters_display(&self) -> String {
        self.parameters
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(";")
    }
}

#[derive(Deserialize)]
struct RawDeferredQuery {
    target_cache_key: String,
    query: String,
    #[serde(default)]
    parameters: Vec<QueryParameter>,
    #[serde(default)]
    hints: Hints,
    #[serde(default)]
    result_ttl: Duration,
}

impl TryFrom<RawDeferredQuery> for DeferredQuery {
    type Error = DescriptorError;

    fn try_from(raw: RawDeferredQuery) -> Result<Self, Self::Error> {
        let mut query = DeferredQuery::new(raw.target_cache_key, raw.query)?
            .with_parameters(raw.parameters)?
            .with_result_ttl(raw.result_ttl);
        query.hints = raw.hints;
        Ok(query)
    }
}

/// A descriptor paired with the score observed when it was enumerated.
///
/// Demotion subtracts exactly this score, so promotions that land after the
/// observation are not consumed by it.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedDeferredQuery {
    query: DeferredQuery,
    score: i64,
}

impl CachedDeferredQuery {
    pub fn new(query: DeferredQuery, score: i64) -> Self {
        Self { query, score }
    }

    pub fn query(&self) -> &DeferredQuery {
        &self.query
    }

    pub fn score(&self) -> i64 {
        self.score
    }

    pub fn into_query(self) -> DeferredQuery {
        self.query
    }
}
