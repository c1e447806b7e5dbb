//! Intermediate representation of a pipeline.
//!
//! The IR is produced by the pipeline description parser and handed to the
//! orchestrator as plain data. Every type here is immutable once built and
//! serializes with `serde`, so a parsed pipeline can be stored as JSON and
//! executed later.
use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::error::IRError;

/// A package that must be present on disk before the pipeline runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IRDependency {
    pub uri: String,
}

impl IRDependency {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }

    /// Name of the directory this package lives in below the packages root.
    ///
    /// This is the last non-empty path segment of the URI, so
    /// `https://github.com/rdf-connect/template.git` maps to `template.git`
    /// and `file:///opt/procs/` maps to `procs`.
    pub fn directory(&self) -> String {
        let trimmed = self.uri.trim_end_matches('/');
        trimmed
            .rsplit('/')
            .find(|segment| !segment.is_empty())
            .unwrap_or(trimmed)
            .to_string()
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, AsRefStr, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LiteralType {
    Boolean,
    Byte,
    Date,
    Double,
    Float,
    Int,
    Long,
    String,
    Writer,
    Reader,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterKind {
    Literal(LiteralType),
    Nested(Vec<IRParameter>),
}

/// Declared parameter of a processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IRParameter {
    pub name: String,
    pub kind: ParameterKind,
    /// At most one value.
    #[serde(default)]
    pub single: bool,
    #[serde(default)]
    pub optional: bool,
}

impl IRParameter {
    pub fn literal(name: impl Into<String>, ty: LiteralType) -> Self {
        Self {
            name: name.into(),
            kind: ParameterKind::Literal(ty),
            single: true,
            optional: false,
        }
    }

    pub fn nested(name: impl Into<String>, parameters: Vec<IRParameter>) -> Self {
        Self {
            name: name.into(),
            kind: ParameterKind::Nested(parameters),
            single: true,
            optional: false,
        }
    }

    pub fn many(mut self) -> Self {
        self.single = false;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// Raw, unparsed argument values as they appeared in the pipeline description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum IRArgument {
    Literal {
        values: Vec<String>,
    },
    Nested {
        values: Vec<BTreeMap<String, IRArgument>>,
    },
}

impl IRArgument {
    pub fn literal(value: impl Into<String>) -> Self {
        IRArgument::Literal {
            values: vec![value.into()],
        }
    }

    pub fn literals<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        IRArgument::Literal {
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            IRArgument::Literal { values } => values.len(),
            IRArgument::Nested { values } => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IRProcessor {
    pub uri: String,
    /// Registry key of the implementation, looked up by the runner.
    pub implementation: String,
    #[serde(default)]
    pub parameters: Vec<IRParameter>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// A processor instance bound to concrete arguments and a runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IRStage {
    pub uri: String,
    pub runner: String,
    pub processor: IRProcessor,
    #[serde(default)]
    pub arguments: BTreeMap<String, IRArgument>,
}

impl IRStage {
    /// Channel URIs this stage reads from, in parameter declaration order.
    pub fn readers(&self) -> Vec<String> {
        let mut out = Vec::new();
        collect_channels(&self.processor.parameters, &self.arguments, LiteralType::Reader, &mut out);
        out
    }

    /// Channel URIs this stage writes to, in parameter declaration order.
    pub fn writers(&self) -> Vec<String> {
        let mut out = Vec::new();
        collect_channels(&self.processor.parameters, &self.arguments, LiteralType::Writer, &mut out);
        out
    }

    pub fn validate(&self) -> Result<(), IRError> {
        validate_arguments(self, &self.processor.parameters, &self.arguments)
    }
}

fn collect_channels(
    parameters: &[IRParameter],
    arguments: &BTreeMap<String, IRArgument>,
    wanted: LiteralType,
    out: &mut Vec<String>,
) {
    for parameter in parameters {
        match (&parameter.kind, arguments.get(&parameter.name)) {
            (ParameterKind::Literal(ty), Some(IRArgument::Literal { values })) if *ty == wanted => {
                out.extend(values.iter().cloned());
            }
            (ParameterKind::Nested(inner), Some(IRArgument::Nested { values })) => {
                for value in values {
                    collect_channels(inner, value, wanted, out);
                }
            }
            _ => {}
        }
    }
}

fn validate_arguments(
    stage: &IRStage,
    parameters: &[IRParameter],
    arguments: &BTreeMap<String, IRArgument>,
) -> Result<(), IRError> {
    if let Some(name) = arguments
        .keys()
        .find(|name| !parameters.iter().any(|p| &p.name == *name))
    {
        return Err(IRError::UnknownArgument {
            stage: stage.uri.clone(),
            processor: stage.processor.uri.clone(),
            argument: name.clone(),
        });
    }

    for parameter in parameters {
        let Some(argument) = arguments.get(&parameter.name) else {
            if parameter.optional {
                continue;
            }
            return Err(IRError::MissingArgument {
                stage: stage.uri.clone(),
                parameter: parameter.name.clone(),
            });
        };

        if argument.is_empty() && !parameter.optional {
            return Err(IRError::MissingArgument {
                stage: stage.uri.clone(),
                parameter: parameter.name.clone(),
            });
        }
        if parameter.single && argument.len() > 1 {
            return Err(IRError::TooManyValues {
                stage: stage.uri.clone(),
                parameter: parameter.name.clone(),
                count: argument.len(),
            });
        }

        match (&parameter.kind, argument) {
            (ParameterKind::Literal(_), IRArgument::Literal { .. }) => {}
            (ParameterKind::Nested(inner), IRArgument::Nested { values }) => {
                for value in values {
                    validate_arguments(stage, inner, value)?;
                }
            }
            (ParameterKind::Literal(_), IRArgument::Nested { .. }) => {
                return Err(IRError::KindMismatch {
                    stage: stage.uri.clone(),
                    parameter: parameter.name.clone(),
                    expected: "literal",
                });
            }
            (ParameterKind::Nested(_), IRArgument::Literal { .. }) => {
                return Err(IRError::KindMismatch {
                    stage: stage.uri.clone(),
                    parameter: parameter.name.clone(),
                    expected: "nested",
                });
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum RunnerType {
    /// Stages run inside the orchestrator process.
    BuiltIn,
    /// Stages run in a worker process reached over the runner protocol.
    #[serde(alias = "GRPC")]
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IRRunner {
    pub uri: String,
    #[serde(rename = "type")]
    pub runner_type: RunnerType,
    /// Command line that starts a worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
    /// `host:port` of a worker that is already listening.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency: Option<IRDependency>,
}

impl IRRunner {
    pub fn built_in(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            runner_type: RunnerType::BuiltIn,
            entrypoint: None,
            directory: None,
            address: None,
            dependency: None,
        }
    }

    pub fn remote(uri: impl Into<String>) -> Self {
        Self {
            runner_type: RunnerType::Remote,
            ..Self::built_in(uri)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IRPipeline {
    pub uri: String,
    #[serde(default)]
    pub dependencies: Vec<IRDependency>,
    #[serde(default)]
    pub runners: Vec<IRRunner>,
    #[serde(default)]
    pub stages: Vec<IRStage>,
}

impl IRPipeline {
    pub fn runner(&self, uri: &str) -> Option<&IRRunner> {
        self.runners.iter().find(|r| r.uri == uri)
    }

    pub fn stages_for<'a>(&'a self, runner: &'a str) -> impl Iterator<Item = &'a IRStage> + 'a {
        self.stages.iter().filter(move |s| s.runner == runner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_processor() -> IRProcessor {
        IRProcessor {
            uri: "urn:proc:echo".into(),
            implementation: "rdfc:echo".into(),
            parameters: vec![
                IRParameter::literal("input", LiteralType::Reader),
                IRParameter::literal("output", LiteralType::Writer),
                IRParameter::nested(
                    "taps",
                    vec![IRParameter::literal("sink", LiteralType::Writer)],
                )
                .many()
                .optional(),
            ],
            metadata: BTreeMap::new(),
        }
    }

    fn stage(arguments: BTreeMap<String, IRArgument>) -> IRStage {
        IRStage {
            uri: "urn:stage:echo".into(),
            runner: "urn:runner".into(),
            processor: echo_processor(),
            arguments,
        }
    }

    #[test]
    fn directory_is_last_segment() {
        assert_eq!(
            IRDependency::new("https://github.com/rdf-connect/template.git").directory(),
            "template.git"
        );
        assert_eq!(IRDependency::new("file:///opt/procs/").directory(), "procs");
        assert_eq!(IRDependency::new("file:///opt/procs").directory(), "procs");
    }

    #[test]
    fn readers_and_writers_walk_nested_arguments() {
        let mut tap = BTreeMap::new();
        tap.insert("sink".to_string(), IRArgument::literal("urn:ch:tap"));
        let mut args = BTreeMap::new();
        args.insert("input".to_string(), IRArgument::literal("urn:ch:in"));
        args.insert("output".to_string(), IRArgument::literal("urn:ch:out"));
        args.insert("taps".to_string(), IRArgument::Nested { values: vec![tap] });

        let stage = stage(args);
        assert_eq!(stage.readers(), vec!["urn:ch:in"]);
        assert_eq!(stage.writers(), vec!["urn:ch:out", "urn:ch:tap"]);
        assert!(stage.validate().is_ok());
    }

    #[test]
    fn validate_reports_missing_and_unknown() {
        let mut args = BTreeMap::new();
        args.insert("input".to_string(), IRArgument::literal("urn:ch:in"));
        assert!(matches!(
            stage(args.clone()).validate(),
            Err(IRError::MissingArgument { parameter, .. }) if parameter == "output"
        ));

        args.insert("output".to_string(), IRArgument::literal("urn:ch:out"));
        args.insert("bogus".to_string(), IRArgument::literal("x"));
        assert!(matches!(
            stage(args).validate(),
            Err(IRError::UnknownArgument { argument, .. }) if argument == "bogus"
        ));
    }

    #[test]
    fn validate_rejects_multiple_values_for_single() {
        let mut args = BTreeMap::new();
        args.insert("input".to_string(), IRArgument::literals(["a", "b"]));
        args.insert("output".to_string(), IRArgument::literal("urn:ch:out"));
        assert!(matches!(
            stage(args).validate(),
            Err(IRError::TooManyValues { count: 2, .. })
        ));
    }

    #[test]
    fn runner_type_accepts_grpc_name() {
        let runner: IRRunner =
            serde_json::from_str(r#"{"uri":"urn:r","type":"GRPC","entrypoint":"worker"}"#).unwrap();
        assert_eq!(runner.runner_type, RunnerType::Remote);
        assert_eq!(runner.entrypoint.as_deref(), Some("worker"));
    }
}
