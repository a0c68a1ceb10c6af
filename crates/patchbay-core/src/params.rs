//! Parameter-binding model: descriptors declared at registration time,
//! request metadata they resolve against, and the values binding produces.
//!
//! Descriptors are plain data built once per handler registration — nothing
//! is re-derived per request. The binding engine in `patchbay-server` walks
//! them against a [`RequestMeta`] on every dispatch.

use std::collections::HashMap;
use std::fmt;

/// Where a parameter's raw value comes from.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum ParamSource {
    /// Request header map.
    Header,
    /// Query-parameter multimap.
    Query,
}

impl fmt::Display for ParamSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Header => f.write_str("header"),
            Self::Query => f.write_str("query"),
        }
    }
}

/// Declared variant set for an enum-typed parameter.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EnumSpec {
    /// Enum name used in diagnostics.
    pub name: &'static str,
    /// Declared variant names, matched case-sensitively.
    pub variants: &'static [&'static str],
}

impl EnumSpec {
    /// Case-sensitive lookup of `raw` among the declared variants.
    pub fn matches(&self, raw: &str) -> Option<&'static str> {
        self.variants.iter().copied().find(|v| *v == raw)
    }
}

/// Target type tag for a declared parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetType {
    /// UTF-8 string, passed through.
    Str,
    /// 8-bit signed integer.
    I8,
    /// 16-bit signed integer.
    I16,
    /// 32-bit signed integer.
    I32,
    /// 64-bit signed integer.
    I64,
    /// 8-bit unsigned integer.
    U8,
    /// 16-bit unsigned integer.
    U16,
    /// 32-bit unsigned integer.
    U32,
    /// 64-bit unsigned integer.
    U64,
    /// Big decimal-text integer (128-bit).
    BigInt,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
    /// Strict `true`/`false` literal, case-insensitive.
    Bool,
    /// First code point of the value.
    Char,
    /// Case-sensitive match against a declared variant set.
    Enum(EnumSpec),
    /// List of strings; elements pass through unconverted.
    StrList,
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str => f.write_str("string"),
            Self::I8 => f.write_str("i8"),
            Self::I16 => f.write_str("i16"),
            Self::I32 => f.write_str("i32"),
            Self::I64 => f.write_str("i64"),
            Self::U8 => f.write_str("u8"),
            Self::U16 => f.write_str("u16"),
            Self::U32 => f.write_str("u32"),
            Self::U64 => f.write_str("u64"),
            Self::BigInt => f.write_str("i128"),
            Self::F32 => f.write_str("f32"),
            Self::F64 => f.write_str("f64"),
            Self::Bool => f.write_str("bool"),
            Self::Char => f.write_str("char"),
            Self::Enum(spec) => write!(f, "enum {}", spec.name),
            Self::StrList => f.write_str("string list"),
        }
    }
}

/// One declared handler parameter.
///
/// Built through [`ParamSpec::header`] / [`ParamSpec::query`] (or the
/// lower-level [`ParamSpec::new`] + [`ParamSpec::from`]). Declaring more
/// than one source, or none, is rejected when the route table is built.
#[derive(Clone, Debug)]
pub struct ParamSpec {
    key: String,
    sources: Vec<ParamSource>,
    required: bool,
    default: Option<String>,
    target: TargetType,
}

impl ParamSpec {
    /// Descriptor with no source yet; attach one with [`ParamSpec::from`].
    pub fn new(key: impl Into<String>, target: TargetType) -> Self {
        Self {
            key: key.into(),
            sources: Vec::new(),
            required: false,
            default: None,
            target,
        }
    }

    /// Descriptor bound to the request header map.
    pub fn header(key: impl Into<String>, target: TargetType) -> Self {
        Self::new(key, target).from(ParamSource::Header)
    }

    /// Descriptor bound to the query-parameter multimap.
    pub fn query(key: impl Into<String>, target: TargetType) -> Self {
        Self::new(key, target).from(ParamSource::Query)
    }

    /// Attach a source. Calling this twice makes the descriptor ambiguous,
    /// which the route-table build rejects.
    pub fn from(mut self, source: ParamSource) -> Self {
        self.sources.push(source);
        self
    }

    /// Mark the parameter required (effective only without a default).
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Fallback value converted when the request carries none. An empty
    /// string is treated as no default.
    pub fn default_value(mut self, value: impl Into<String>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Source key looked up on the request.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// All declared sources (validated to exactly one at build time).
    pub fn sources(&self) -> &[ParamSource] {
        &self.sources
    }

    /// The single declared source, if unambiguous.
    pub fn source(&self) -> Option<ParamSource> {
        match self.sources.as_slice() {
            [one] => Some(*one),
            _ => None,
        }
    }

    /// Raw required flag as declared.
    pub fn required_flag(&self) -> bool {
        self.required
    }

    /// Declared default, with the empty string filtered out.
    pub fn declared_default(&self) -> Option<&str> {
        self.default.as_deref().filter(|d| !d.is_empty())
    }

    /// Target type tag.
    pub fn target(&self) -> TargetType {
        self.target
    }
}

/// Resolved value of one bound parameter.
#[derive(Clone, Debug, PartialEq)]
pub enum BoundValue {
    /// Null-equivalent for string-ish targets with nothing to bind.
    Absent,
    /// String pass-through.
    Str(String),
    /// 8-bit signed integer.
    I8(i8),
    /// 16-bit signed integer.
    I16(i16),
    /// 32-bit signed integer.
    I32(i32),
    /// 64-bit signed integer.
    I64(i64),
    /// 8-bit unsigned integer.
    U8(u8),
    /// 16-bit unsigned integer.
    U16(u16),
    /// 32-bit unsigned integer.
    U32(u32),
    /// 64-bit unsigned integer.
    U64(u64),
    /// 128-bit big-number integer.
    BigInt(i128),
    /// 32-bit float.
    F32(f32),
    /// 64-bit float.
    F64(f64),
    /// Boolean literal.
    Bool(bool),
    /// Single character.
    Char(char),
    /// Matched enum variant.
    Enum {
        /// Enum name from the [`EnumSpec`].
        type_name: &'static str,
        /// Matched variant name.
        variant: &'static str,
    },
    /// String list.
    StrList(Vec<String>),
}

impl BoundValue {
    /// True for [`BoundValue::Absent`].
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    /// Borrow a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Widen any signed integer value to `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::I8(v) => Some(i64::from(*v)),
            Self::I16(v) => Some(i64::from(*v)),
            Self::I32(v) => Some(i64::from(*v)),
            Self::I64(v) => Some(*v),
            Self::U8(v) => Some(i64::from(*v)),
            Self::U16(v) => Some(i64::from(*v)),
            Self::U32(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    /// Unsigned value as `u64`.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::U8(v) => Some(u64::from(*v)),
            Self::U16(v) => Some(u64::from(*v)),
            Self::U32(v) => Some(u64::from(*v)),
            Self::U64(v) => Some(*v),
            _ => None,
        }
    }

    /// Big-number value, widening from any integer.
    pub fn as_big(&self) -> Option<i128> {
        match self {
            Self::BigInt(v) => Some(*v),
            Self::U64(v) => Some(i128::from(*v)),
            other => other.as_i64().map(i128::from),
        }
    }

    /// Float value, widening `f32`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::F32(v) => Some(f64::from(*v)),
            Self::F64(v) => Some(*v),
            _ => None,
        }
    }

    /// Boolean value.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Character value.
    pub fn as_char(&self) -> Option<char> {
        match self {
            Self::Char(v) => Some(*v),
            _ => None,
        }
    }

    /// Matched enum variant name.
    pub fn as_variant(&self) -> Option<&'static str> {
        match self {
            Self::Enum { variant, .. } => Some(variant),
            _ => None,
        }
    }

    /// Borrow a string-list value.
    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            Self::StrList(values) => Some(values),
            _ => None,
        }
    }
}

/// Bag of bound parameter values keyed by source key.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BoundParams {
    values: HashMap<String, BoundValue>,
}

impl BoundParams {
    /// Empty bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a bound value, replacing any previous value for the key.
    pub fn insert(&mut self, key: impl Into<String>, value: BoundValue) {
        let _ = self.values.insert(key.into(), value);
    }

    /// Look up a bound value by key.
    pub fn get(&self, key: &str) -> Option<&BoundValue> {
        self.values.get(key)
    }

    /// Convenience: the string value for a key, if bound as a string.
    pub fn str_value(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(BoundValue::as_str)
    }

    /// Number of bound parameters.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when nothing is bound.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Request metadata handed over by the transport at dispatch time.
///
/// Both maps are ordered multimaps: repeated keys keep every occurrence in
/// arrival order. Header lookup is case-as-provided — the transport decides
/// any normalization.
#[derive(Clone, Debug, Default)]
pub struct RequestMeta {
    headers: Vec<(String, String)>,
    query: Vec<(String, String)>,
}

impl RequestMeta {
    /// Empty metadata (no headers, no query parameters).
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from already-parsed header and query pairs.
    pub fn from_parts(headers: Vec<(String, String)>, query: Vec<(String, String)>) -> Self {
        Self { headers, query }
    }

    /// Append one header pair.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Append one query pair.
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// All header values for `key`, in arrival order.
    pub fn header_values(&self, key: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// All query values for `key`, in arrival order.
    pub fn query_values(&self, key: &str) -> Vec<&str> {
        self.query
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_builder_records_declaration() {
        let spec = ParamSpec::query("ids", TargetType::StrList)
            .required()
            .default_value("a,b");

        assert_eq!(spec.key(), "ids");
        assert_eq!(spec.source(), Some(ParamSource::Query));
        assert!(spec.required_flag());
        assert_eq!(spec.declared_default(), Some("a,b"));
        assert_eq!(spec.target(), TargetType::StrList);
    }

    #[test]
    fn empty_default_is_filtered() {
        let spec = ParamSpec::header("id", TargetType::Str).default_value("");
        assert_eq!(spec.declared_default(), None);
    }

    #[test]
    fn double_source_is_ambiguous() {
        let spec = ParamSpec::header("id", TargetType::Str).from(ParamSource::Query);
        assert_eq!(spec.source(), None);
        assert_eq!(spec.sources().len(), 2);
    }

    #[test]
    fn missing_source_is_detectable() {
        let spec = ParamSpec::new("id", TargetType::Str);
        assert_eq!(spec.source(), None);
        assert!(spec.sources().is_empty());
    }

    #[test]
    fn request_meta_is_a_multimap() {
        let meta = RequestMeta::new()
            .with_query("id", "a")
            .with_query("id", "b")
            .with_header("Token", "t1");

        assert_eq!(meta.query_values("id"), vec!["a", "b"]);
        assert_eq!(meta.header_values("Token"), vec!["t1"]);
        // Case-as-provided: no normalization on lookup.
        assert!(meta.header_values("token").is_empty());
    }

    #[test]
    fn bound_value_accessors() {
        assert_eq!(BoundValue::I16(7).as_i64(), Some(7));
        assert_eq!(BoundValue::U32(7).as_u64(), Some(7));
        assert_eq!(BoundValue::I8(-3).as_big(), Some(-3));
        assert_eq!(BoundValue::F32(1.5).as_f64(), Some(1.5));
        assert_eq!(BoundValue::Bool(true).as_bool(), Some(true));
        assert_eq!(BoundValue::Char('x').as_char(), Some('x'));
        assert!(BoundValue::Absent.is_absent());
    }

    #[test]
    fn enum_spec_matching_is_case_sensitive() {
        const COLORS: EnumSpec = EnumSpec { name: "Color", variants: &["RED", "GREEN"] };
        assert_eq!(COLORS.matches("RED"), Some("RED"));
        assert_eq!(COLORS.matches("red"), None);
    }

    #[test]
    fn bound_params_round_trip() {
        let mut params = BoundParams::new();
        params.insert("id", BoundValue::Str("abc".into()));
        assert_eq!(params.str_value("id"), Some("abc"));
        assert_eq!(params.len(), 1);
        assert!(params.get("missing").is_none());
    }
}
