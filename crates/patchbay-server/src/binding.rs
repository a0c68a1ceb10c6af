//! Parameter binding: evaluator table plus the shared resolution algorithm.
//!
//! One [`ParamEvaluator`] exists per request-metadata source (header, query).
//! Both built-ins funnel into the same resolution steps so that required,
//! default, list, and zero-value handling cannot drift apart between
//! sources. The [`BindingEngine`] owns the closed evaluator table and is
//! consulted once per connection, after the dispatch guard has admitted it.

use std::collections::HashMap;
use std::sync::Arc;

use patchbay_core::convert::{self, convert};
use patchbay_core::{
    BoundParams, BoundValue, ConfigError, ParamSource, ParamSpec, RequestMeta, TargetType,
    ValidationError,
};
use percent_encoding::percent_decode_str;
use tracing::error;

/// Evaluates one declared parameter against the request metadata of a
/// single source.
pub trait ParamEvaluator: Send + Sync {
    /// The metadata source this evaluator reads from.
    fn source(&self) -> ParamSource;

    /// Produces the bound value for `spec`, or the validation failure that
    /// rejects the connection.
    fn evaluate(
        &self,
        meta: &RequestMeta,
        spec: &ParamSpec,
        handler: &str,
    ) -> Result<BoundValue, ValidationError>;
}

/// Resolution shared by every evaluator.
///
/// `values` holds every occurrence of the parameter in declaration order,
/// exactly as the transport provided them.
fn resolve_values(
    values: &[&str],
    spec: &ParamSpec,
    source: ParamSource,
    handler: &str,
) -> Result<BoundValue, ValidationError> {
    let default = spec.declared_default();
    // A usable default demotes an explicit `required` to advisory.
    let effectively_required = spec.required_flag() && default.is_none();

    let present: Vec<&str> = values.iter().copied().filter(|v| !v.is_empty()).collect();
    if effectively_required && present.is_empty() {
        return Err(ValidationError::required_missing(source, spec.key(), handler));
    }

    let wrap = |result: Result<BoundValue, patchbay_core::ConvertError>| {
        result.map_err(|cause| ValidationError::conversion(source, spec.key(), handler, cause))
    };

    if !present.is_empty() {
        if spec.target() == TargetType::StrList {
            // A single occurrence is treated as a joined list and split on
            // commas; multiple occurrences pass through verbatim.
            let items = if present.len() == 1 {
                convert::split_joined(present[0])
            } else {
                present.iter().map(|v| (*v).to_owned()).collect()
            };
            return Ok(BoundValue::StrList(items));
        }
        return wrap(convert(present[0], spec.target()));
    }

    if let Some(default) = default {
        return wrap(convert(default, spec.target()));
    }

    Ok(convert::zero_value(spec.target()))
}

/// Evaluator for `ParamSource::Header` parameters.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeaderEvaluator;

impl ParamEvaluator for HeaderEvaluator {
    fn source(&self) -> ParamSource {
        ParamSource::Header
    }

    fn evaluate(
        &self,
        meta: &RequestMeta,
        spec: &ParamSpec,
        handler: &str,
    ) -> Result<BoundValue, ValidationError> {
        let values = meta.header_values(spec.key());
        resolve_values(&values, spec, ParamSource::Header, handler)
    }
}

/// Evaluator for `ParamSource::Query` parameters.
#[derive(Debug, Default, Clone, Copy)]
pub struct QueryEvaluator;

impl ParamEvaluator for QueryEvaluator {
    fn source(&self) -> ParamSource {
        ParamSource::Query
    }

    fn evaluate(
        &self,
        meta: &RequestMeta,
        spec: &ParamSpec,
        handler: &str,
    ) -> Result<BoundValue, ValidationError> {
        let values = meta.query_values(spec.key());
        resolve_values(&values, spec, ParamSource::Query, handler)
    }
}

/// Closed table of parameter evaluators keyed by source.
///
/// The table is populated at construction and only grows through
/// [`BindingEngine::register`], which rejects duplicate sources so a
/// later registration can never shadow a built-in.
pub struct BindingEngine {
    evaluators: HashMap<ParamSource, Arc<dyn ParamEvaluator>>,
}

impl BindingEngine {
    /// Engine with the built-in header and query evaluators registered.
    pub fn new() -> Self {
        let mut evaluators: HashMap<ParamSource, Arc<dyn ParamEvaluator>> = HashMap::new();
        let prior = evaluators.insert(ParamSource::Header, Arc::new(HeaderEvaluator));
        debug_assert!(prior.is_none());
        let prior = evaluators.insert(ParamSource::Query, Arc::new(QueryEvaluator));
        debug_assert!(prior.is_none());
        Self { evaluators }
    }

    /// Engine with no evaluators at all, for assembling a custom table.
    pub fn empty() -> Self {
        Self {
            evaluators: HashMap::new(),
        }
    }

    /// Adds an evaluator to the table.
    ///
    /// Fails with [`ConfigError::DuplicateEvaluator`] when the source is
    /// already covered.
    pub fn register(&mut self, evaluator: Arc<dyn ParamEvaluator>) -> Result<(), ConfigError> {
        let source = evaluator.source();
        if self.evaluators.contains_key(&source) {
            return Err(ConfigError::DuplicateEvaluator { source });
        }
        let prior = self.evaluators.insert(source, evaluator);
        debug_assert!(prior.is_none());
        Ok(())
    }

    /// Whether the table holds an evaluator for `source`.
    pub fn supports(&self, source: ParamSource) -> bool {
        self.evaluators.contains_key(&source)
    }

    /// Binds every declared parameter of a handler, stopping at the first
    /// validation failure.
    ///
    /// Registry validation guarantees each spec names exactly one
    /// supported source before any connection reaches this point.
    pub fn bind(
        &self,
        meta: &RequestMeta,
        specs: &[ParamSpec],
        handler: &str,
    ) -> Result<BoundParams, ValidationError> {
        let mut params = BoundParams::new();
        for spec in specs {
            let Some(source) = spec.source() else {
                error!(key = spec.key(), handler, "parameter reached binding without a single source");
                continue;
            };
            let Some(evaluator) = self.evaluators.get(&source) else {
                error!(key = spec.key(), %source, handler, "no evaluator registered for source");
                continue;
            };
            let value = evaluator.evaluate(meta, spec, handler)?;
            params.insert(spec.key(), value);
        }
        Ok(params)
    }
}

impl Default for BindingEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits a raw query string into decoded key/value pairs, preserving
/// occurrence order and duplicate keys.
///
/// `+` decodes to a space, then percent-escapes are decoded. A pair
/// without `=` becomes a key with an empty value.
pub fn parse_query(raw: &str) -> Vec<(String, String)> {
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_component(key), decode_component(value))
        })
        .collect()
}

fn decode_component(component: &str) -> String {
    let spaced = component.replace('+', " ");
    percent_decode_str(&spaced).decode_utf8_lossy().into_owned()
}
