use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

/// A single option value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(value) => write!(f, "{value}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Str(value) => write!(f, "{value:?}"),
        }
    }
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for OptionValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<String> for OptionValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

/// A set of named options handed to loaders, decoders and encoders.
///
/// Options contribute to cache keys, so their textual representation is stable: keys are
/// ordered and values are printed deterministically.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Options {
    values: BTreeMap<Cow<'static, str>, OptionValue>,
}

impl Options {
    /// Whether decoders may produce hardware-backed (immutable) bitmaps.
    pub const ALLOW_HARDWARE_CONFIG: &'static str = "bitmill.bitmap.allow_hardware";
    /// The preferred bitmap config, one of `argb_8888`, `rgb_565` or `alpha_8`.
    pub const DECODE_FORMAT: &'static str = "bitmill.bitmap.decode_format";
    /// PNG compression for encoded resources, one of `fast`, `default` or `best`.
    pub const ENCODE_COMPRESSION: &'static str = "bitmill.bitmap.encode_compression";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<Cow<'static, str>>, value: impl Into<OptionValue>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn with(mut self, key: impl Into<Cow<'static, str>>, value: impl Into<OptionValue>) -> Self {
        self.set(key, value);
        self
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&OptionValue> {
        self.values.get(key)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.values.get(key) {
            Some(OptionValue::Bool(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.values.get(key) {
            Some(OptionValue::Str(value)) => Some(value),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Display for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.values {
            writeln!(f, "  {key}: {value}")?;
        }
        Ok(())
    }
}
