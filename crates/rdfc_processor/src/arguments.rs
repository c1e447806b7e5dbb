//! Typed stage arguments.
//!
//! [`Arguments::bind`] turns the raw IR literals of a stage into values a
//! processor can consume. Reader and writer literals are channel URIs and are
//! resolved through a [`ChannelBinder`], which is how the same processor code
//! runs against the in-process broker or a remote connection.
use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, NaiveDate, Utc};

use crate::channel::{Reader, Writer};
use crate::error::{ChannelError, ProcessorError};
use crate::ir::{IRArgument, IRParameter, IRStage, LiteralType, ParameterKind};

/// Hands out channel endpoints while a stage is being bound.
pub trait ChannelBinder {
    fn reader(&mut self, uri: &str) -> Result<Reader, ChannelError>;
    fn writer(&mut self, uri: &str) -> Result<Writer, ChannelError>;
}

#[derive(Debug)]
pub enum ArgumentValue {
    Boolean(bool),
    Byte(u8),
    Date(DateTime<Utc>),
    Double(f64),
    Float(f32),
    Int(i32),
    Long(i64),
    String(String),
    Reader(Reader),
    Writer(Writer),
    Nested(Arguments),
}

impl ArgumentValue {
    pub fn kind(&self) -> &'static str {
        match self {
            ArgumentValue::Boolean(_) => "boolean",
            ArgumentValue::Byte(_) => "byte",
            ArgumentValue::Date(_) => "date",
            ArgumentValue::Double(_) => "double",
            ArgumentValue::Float(_) => "float",
            ArgumentValue::Int(_) => "int",
            ArgumentValue::Long(_) => "long",
            ArgumentValue::String(_) => "string",
            ArgumentValue::Reader(_) => "reader",
            ArgumentValue::Writer(_) => "writer",
            ArgumentValue::Nested(_) => "nested",
        }
    }
}

/// Conversion out of an [`ArgumentValue`], used by the typed accessors.
pub trait FromArgument: Sized {
    const KIND: &'static str;
    fn from_argument(value: ArgumentValue) -> Result<Self, ArgumentValue>;
}

macro_rules! from_argument {
    ($ty:ty, $variant:ident, $kind:literal) => {
        impl FromArgument for $ty {
            const KIND: &'static str = $kind;
            fn from_argument(value: ArgumentValue) -> Result<Self, ArgumentValue> {
                match value {
                    ArgumentValue::$variant(v) => Ok(v),
                    other => Err(other),
                }
            }
        }
    };
}

from_argument!(bool, Boolean, "boolean");
from_argument!(u8, Byte, "byte");
from_argument!(DateTime<Utc>, Date, "date");
from_argument!(f64, Double, "double");
from_argument!(f32, Float, "float");
from_argument!(i32, Int, "int");
from_argument!(i64, Long, "long");
from_argument!(String, String, "string");
from_argument!(Reader, Reader, "reader");
from_argument!(Writer, Writer, "writer");
from_argument!(Arguments, Nested, "nested");

/// Bound arguments of one stage. Accessors take the value out, so every
/// reader and writer ends up owned by exactly one processor.
#[derive(Debug, Default)]
pub struct Arguments {
    values: HashMap<String, Vec<ArgumentValue>>,
}

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(stage: &IRStage, binder: &mut dyn ChannelBinder) -> Result<Self, ProcessorError> {
        stage.validate()?;
        bind_level(&stage.processor.parameters, &stage.arguments, binder)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: ArgumentValue) {
        self.values.entry(name.into()).or_default().push(value);
    }

    pub fn with(mut self, name: impl Into<String>, value: ArgumentValue) -> Self {
        self.insert(name, value);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.get(name).is_some_and(|v| !v.is_empty())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Every value bound to `name`, possibly none.
    pub fn get_all<T: FromArgument>(&mut self, name: &str) -> Result<Vec<T>, ProcessorError> {
        self.values
            .remove(name)
            .unwrap_or_default()
            .into_iter()
            .map(|value| convert(name, value))
            .collect()
    }

    pub fn get_optional<T: FromArgument>(&mut self, name: &str) -> Result<Option<T>, ProcessorError> {
        let mut values = self.get_all::<T>(name)?;
        match values.len() {
            0 => Ok(None),
            1 => Ok(values.pop()),
            n => Err(ProcessorError::InvalidArgument {
                name: name.to_string(),
                reason: format!("expected a single value, got {n}"),
            }),
        }
    }

    pub fn get<T: FromArgument>(&mut self, name: &str) -> Result<T, ProcessorError> {
        self.get_optional(name)?
            .ok_or_else(|| ProcessorError::MissingArgument(name.to_string()))
    }

    pub fn reader(&mut self, name: &str) -> Result<Reader, ProcessorError> {
        self.get(name)
    }

    pub fn writer(&mut self, name: &str) -> Result<Writer, ProcessorError> {
        self.get(name)
    }

    pub fn string(&mut self, name: &str) -> Result<String, ProcessorError> {
        self.get(name)
    }
}

fn convert<T: FromArgument>(name: &str, value: ArgumentValue) -> Result<T, ProcessorError> {
    T::from_argument(value).map_err(|other| ProcessorError::InvalidArgument {
        name: name.to_string(),
        reason: format!("expected {}, found {}", T::KIND, other.kind()),
    })
}

fn bind_level(
    parameters: &[IRParameter],
    arguments: &BTreeMap<String, IRArgument>,
    binder: &mut dyn ChannelBinder,
) -> Result<Arguments, ProcessorError> {
    let mut out = Arguments::new();
    for parameter in parameters {
        let Some(argument) = arguments.get(&parameter.name) else {
            continue;
        };
        match (&parameter.kind, argument) {
            (ParameterKind::Literal(ty), IRArgument::Literal { values }) => {
                for raw in values {
                    let value = parse_literal(&parameter.name, *ty, raw, binder)?;
                    out.insert(parameter.name.clone(), value);
                }
            }
            (ParameterKind::Nested(inner), IRArgument::Nested { values }) => {
                for value in values {
                    let nested = bind_level(inner, value, binder)?;
                    out.insert(parameter.name.clone(), ArgumentValue::Nested(nested));
                }
            }
            _ => {
                return Err(ProcessorError::InvalidArgument {
                    name: parameter.name.clone(),
                    reason: "argument shape does not match parameter".to_string(),
                });
            }
        }
    }
    Ok(out)
}

fn parse_literal(
    name: &str,
    ty: LiteralType,
    raw: &str,
    binder: &mut dyn ChannelBinder,
) -> Result<ArgumentValue, ProcessorError> {
    let invalid = |reason: String| ProcessorError::InvalidArgument {
        name: name.to_string(),
        reason,
    };
    let value = match ty {
        LiteralType::Boolean => ArgumentValue::Boolean(
            raw.trim().parse().map_err(|e| invalid(format!("`{raw}`: {e}")))?,
        ),
        LiteralType::Byte => {
            ArgumentValue::Byte(raw.trim().parse().map_err(|e| invalid(format!("`{raw}`: {e}")))?)
        }
        LiteralType::Date => ArgumentValue::Date(parse_date(raw).ok_or_else(|| {
            invalid(format!("`{raw}` is neither RFC 3339 nor YYYY-MM-DD"))
        })?),
        LiteralType::Double => {
            ArgumentValue::Double(raw.trim().parse().map_err(|e| invalid(format!("`{raw}`: {e}")))?)
        }
        LiteralType::Float => {
            ArgumentValue::Float(raw.trim().parse().map_err(|e| invalid(format!("`{raw}`: {e}")))?)
        }
        LiteralType::Int => {
            ArgumentValue::Int(raw.trim().parse().map_err(|e| invalid(format!("`{raw}`: {e}")))?)
        }
        LiteralType::Long => {
            ArgumentValue::Long(raw.trim().parse().map_err(|e| invalid(format!("`{raw}`: {e}")))?)
        }
        LiteralType::String => ArgumentValue::String(raw.to_string()),
        LiteralType::Reader => ArgumentValue::Reader(binder.reader(raw)?),
        LiteralType::Writer => ArgumentValue::Writer(binder.writer(raw)?),
    };
    Ok(value)
}

fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelSink, channel};
    use crate::ir::IRProcessor;
    use async_trait::async_trait;
    use chrono::Datelike;
    use std::sync::Arc;

    struct NullSink;

    #[async_trait]
    impl ChannelSink for NullSink {
        async fn send(&self, _uri: &str, _payload: Vec<u8>) -> Result<(), ChannelError> {
            Ok(())
        }
        async fn close(&self, _uri: &str) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct TestBinder {
        readers: Vec<String>,
        writers: Vec<String>,
    }

    impl ChannelBinder for TestBinder {
        fn reader(&mut self, uri: &str) -> Result<Reader, ChannelError> {
            self.readers.push(uri.to_string());
            Ok(channel(uri, 1).1)
        }
        fn writer(&mut self, uri: &str) -> Result<Writer, ChannelError> {
            self.writers.push(uri.to_string());
            Ok(Writer::new(uri, Arc::new(NullSink)))
        }
    }

    fn stage() -> IRStage {
        let mut args = BTreeMap::new();
        args.insert("input".into(), IRArgument::literal("urn:ch:in"));
        args.insert("output".into(), IRArgument::literal("urn:ch:out"));
        args.insert("count".into(), IRArgument::literal("42"));
        args.insert("when".into(), IRArgument::literal("2024-03-01"));
        args.insert("tags".into(), IRArgument::literals(["a", "b"]));
        IRStage {
            uri: "urn:stage".into(),
            runner: "urn:runner".into(),
            processor: IRProcessor {
                uri: "urn:proc".into(),
                implementation: "test".into(),
                parameters: vec![
                    IRParameter::literal("input", LiteralType::Reader),
                    IRParameter::literal("output", LiteralType::Writer),
                    IRParameter::literal("count", LiteralType::Int),
                    IRParameter::literal("when", LiteralType::Date),
                    IRParameter::literal("tags", LiteralType::String).many(),
                    IRParameter::literal("flag", LiteralType::Boolean).optional(),
                ],
                metadata: BTreeMap::new(),
            },
            arguments: args,
        }
    }

    #[test]
    fn bind_parses_literals_and_channels() {
        let mut binder = TestBinder::default();
        let mut args = Arguments::bind(&stage(), &mut binder).unwrap();

        assert_eq!(binder.readers, vec!["urn:ch:in"]);
        assert_eq!(binder.writers, vec!["urn:ch:out"]);
        assert_eq!(args.get::<i32>("count").unwrap(), 42);
        assert_eq!(args.get::<DateTime<Utc>>("when").unwrap().month(), 3);
        assert_eq!(args.get_all::<String>("tags").unwrap(), vec!["a", "b"]);
        assert_eq!(args.get_optional::<bool>("flag").unwrap(), None);
        assert_eq!(args.reader("input").unwrap().uri(), "urn:ch:in");
        assert_eq!(args.writer("output").unwrap().uri(), "urn:ch:out");
    }

    #[test]
    fn accessors_report_kind_mismatch_and_absence() {
        let mut binder = TestBinder::default();
        let mut args = Arguments::bind(&stage(), &mut binder).unwrap();

        assert!(matches!(
            args.get::<String>("count"),
            Err(ProcessorError::InvalidArgument { .. })
        ));
        assert!(matches!(
            args.get::<String>("count"),
            Err(ProcessorError::MissingArgument(name)) if name == "count"
        ));
    }

    #[test]
    fn bad_literal_is_rejected() {
        let mut s = stage();
        s.arguments.insert("count".into(), IRArgument::literal("forty-two"));
        let err = Arguments::bind(&s, &mut TestBinder::default()).unwrap_err();
        assert!(matches!(err, ProcessorError::InvalidArgument { name, .. } if name == "count"));
    }
}
