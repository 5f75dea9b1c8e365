// Protocol Loader
// Reads JSON/YAML protocol files into a validated ProtocolDefinition

use crate::expression::Expression;
use crate::protocol::error::{ParseError, ParseErrorKind, ParseResult};
use crate::protocol::models::{
    FilterClause, ParameterMap, ParameterUpdateRule, PickClause, ProtocolDefinition, RunSettings,
    SelectionExpression, StepSpec, TaskKind, Value, WashSettings,
};

use serde::de::{self, Deserializer, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde::Deserialize;
use serde_json::{Map, Value as Json};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

/// Global keys every protocol document must carry
pub const REQUIRED_KEYS: [&str; 7] = [
    "Protocol Name",
    "Steps",
    "Sample Volume",
    "Total Volume",
    "Discard Sample",
    "Purge",
    "Wash",
];

/// Step-level keys of dilute steps folded into the parameters
const INLINE_PARAMETER_KEYS: [&str; 3] = ["volume", "factor", "channel"];

/// Source of protocol definitions
pub trait ProtocolLoader: Send + Sync {
    fn load(&self, path: &Path) -> ParseResult<ProtocolDefinition>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolFormat {
    Json,
    Yaml,
}

impl ProtocolFormat {
    pub fn from_path(path: &Path) -> ParseResult<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();

        match ext.as_str() {
            "json" => Ok(ProtocolFormat::Json),
            "yaml" | "yml" => Ok(ProtocolFormat::Yaml),
            _ => Err(ParseError::new(
                ParseErrorKind::UnsupportedFormat,
                format!("unsupported protocol file type '{}'", path.display()),
            )
            .with_suggestion("protocol files must end in .json, .yaml or .yml")),
        }
    }
}

/// Loads protocol files from disk, resolving relative paths against a base directory
#[derive(Debug, Clone)]
pub struct FileProtocolLoader {
    base_dir: PathBuf,
}

impl FileProtocolLoader {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }
}

impl Default for FileProtocolLoader {
    fn default() -> Self {
        Self::new(".")
    }
}

impl ProtocolLoader for FileProtocolLoader {
    fn load(&self, path: &Path) -> ParseResult<ProtocolDefinition> {
        load_file(&self.resolve(path))
    }
}

/// Load a protocol file, picking the format from its suffix
pub fn load_file(path: &Path) -> ParseResult<ProtocolDefinition> {
    let format = ProtocolFormat::from_path(path)?;
    let source = std::fs::read_to_string(path).map_err(|e| {
        ParseError::new(
            ParseErrorKind::IoError,
            format!("failed to read '{}': {}", path.display(), e),
        )
    })?;
    parse_str(&source, format)
}

/// Parse and validate protocol source text
pub fn parse_str(source: &str, format: ProtocolFormat) -> ParseResult<ProtocolDefinition> {
    let document: Json = match format {
        ProtocolFormat::Json => {
            serde_json::from_str(source).map_err(|e| ParseError::from_json_error(&e, source))?
        }
        ProtocolFormat::Yaml => {
            serde_yaml::from_str(source).map_err(|e| ParseError::from_yaml_error(&e, source))?
        }
    };

    // Map-form step names as written, before duplicate keys collapse
    let declared = if document.is_object() {
        let names: DeclaredDocument = match format {
            ProtocolFormat::Json => serde_json::from_str(source)
                .map_err(|e| ParseError::from_json_error(&e, source))?,
            ProtocolFormat::Yaml => serde_yaml::from_str(source)
                .map_err(|e| ParseError::from_yaml_error(&e, source))?,
        };
        names.steps.0
    } else {
        Vec::new()
    };

    DocumentReader { source, declared }.protocol(&document)
}

#[derive(Deserialize)]
struct DeclaredDocument {
    #[serde(rename = "Steps", default)]
    steps: DeclaredSteps,
}

/// Keys of a map-form `Steps`, repeats included; empty for any other shape
#[derive(Default)]
struct DeclaredSteps(Vec<String>);

impl<'de> Deserialize<'de> for DeclaredSteps {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(DeclaredStepsVisitor)
    }
}

struct DeclaredStepsVisitor;

impl<'de> Visitor<'de> for DeclaredStepsVisitor {
    type Value = DeclaredSteps;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a mapping or list of steps")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut names = Vec::new();
        while let Some(name) = map.next_key::<String>()? {
            map.next_value::<IgnoredAny>()?;
            names.push(name);
        }
        Ok(DeclaredSteps(names))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        while seq.next_element::<IgnoredAny>()?.is_some() {}
        Ok(DeclaredSteps::default())
    }

    // Other shapes are rejected with a schema error once the document is read
    fn visit_bool<E: de::Error>(self, _: bool) -> Result<Self::Value, E> {
        Ok(DeclaredSteps::default())
    }

    fn visit_i64<E: de::Error>(self, _: i64) -> Result<Self::Value, E> {
        Ok(DeclaredSteps::default())
    }

    fn visit_u64<E: de::Error>(self, _: u64) -> Result<Self::Value, E> {
        Ok(DeclaredSteps::default())
    }

    fn visit_f64<E: de::Error>(self, _: f64) -> Result<Self::Value, E> {
        Ok(DeclaredSteps::default())
    }

    fn visit_str<E: de::Error>(self, _: &str) -> Result<Self::Value, E> {
        Ok(DeclaredSteps::default())
    }

    fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(DeclaredSteps::default())
    }

    fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(DeclaredSteps::default())
    }
}

struct DocumentReader<'s> {
    source: &'s str,
    declared: Vec<String>,
}

impl DocumentReader<'_> {
    fn protocol(&self, document: &Json) -> ParseResult<ProtocolDefinition> {
        let root = document.as_object().ok_or_else(|| {
            ParseError::new(
                ParseErrorKind::InvalidSchema,
                "protocol document must be a mapping",
            )
        })?;

        let missing: Vec<&str> = REQUIRED_KEYS
            .iter()
            .copied()
            .filter(|key| !root.contains_key(*key))
            .collect();
        if !missing.is_empty() {
            return Err(ParseError::new(
                ParseErrorKind::MissingField,
                format!("missing required key(s): {}", missing.join(", ")),
            )
            .with_suggestion(format!("a protocol needs: {}", REQUIRED_KEYS.join(", "))));
        }

        let name = self.string(root, "Protocol Name")?;
        let settings = self.settings(root)?;
        let steps = self.steps(&root["Steps"])?;
        self.check_references(&steps)?;

        Ok(ProtocolDefinition {
            name,
            settings,
            steps,
        })
    }

    fn settings(&self, root: &Map<String, Json>) -> ParseResult<RunSettings> {
        let wash = root["Wash"].as_object().ok_or_else(|| {
            self.schema_error("'Wash' must be a mapping", "\"Wash\"")
        })?;

        Ok(RunSettings {
            sample_volume: self.number(root, "Sample Volume")?,
            total_volume: self.number(root, "Total Volume")?,
            discard_sample: self.boolean(root, "Discard Sample")?,
            purge: self.number(root, "Purge")?,
            wash: WashSettings {
                wash_volume: self.optional_number(wash, "wash_volume")?.unwrap_or(5.0),
                washing_cycles: self.optional_count(wash, "washing_cycles")?.unwrap_or(3),
            },
        })
    }

    fn steps(&self, steps: &Json) -> ParseResult<Vec<StepSpec>> {
        let named: Vec<(String, &Map<String, Json>)> = match steps {
            Json::Object(map) => {
                let mut seen = HashSet::new();
                if let Some(name) = self.declared.iter().find(|name| !seen.insert(name.as_str())) {
                    let needle = if self.source.contains(&quoted(name)) {
                        quoted(name)
                    } else {
                        format!("{}:", name)
                    };
                    return Err(self.duplicate_step(name, &needle));
                }
                map
                .iter()
                .map(|(name, spec)| {
                    spec.as_object()
                        .map(|obj| (name.clone(), obj))
                        .ok_or_else(|| {
                            self.schema_error(
                                format!("step '{}' must be a mapping", name),
                                &quoted(name),
                            )
                        })
                })
                .collect::<ParseResult<_>>()?
            }
            Json::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, spec)| {
                    let obj = spec.as_object().ok_or_else(|| {
                        ParseError::new(
                            ParseErrorKind::InvalidSchema,
                            format!("step #{} must be a mapping", i + 1),
                        )
                    })?;
                    let name = obj.get("name").and_then(Json::as_str).ok_or_else(|| {
                        ParseError::new(
                            ParseErrorKind::MissingField,
                            format!("step #{} has no 'name'", i + 1),
                        )
                        .with_suggestion("steps given as a list need a \"name\" field")
                    })?;
                    Ok((name.to_string(), obj))
                })
                .collect::<ParseResult<_>>()?,
            _ => {
                return Err(self.schema_error(
                    "'Steps' must be a mapping or a list",
                    "\"Steps\"",
                ))
            }
        };

        if named.is_empty() {
            return Err(ParseError::new(
                ParseErrorKind::EmptyProtocol,
                "protocol has no steps",
            ));
        }

        let mut seen = HashSet::new();
        let mut specs = Vec::with_capacity(named.len());
        for (name, obj) in named {
            if !seen.insert(name.clone()) {
                return Err(self.duplicate_step(&name, &format!("\"name\": \"{}\"", name)));
            }
            specs.push(self.step(name, obj)?);
        }

        Ok(specs)
    }

    fn step(&self, name: String, obj: &Map<String, Json>) -> ParseResult<StepSpec> {
        let task = match obj.get("task") {
            None => TaskKind::Measure,
            Some(Json::String(task)) => TaskKind::parse(task).ok_or_else(|| {
                self.schema_error(
                    format!("step '{}' has unknown task '{}'", name, task),
                    &quoted(task),
                )
                .with_suggestion("task must be \"measure\" or \"dilute\"")
            })?,
            Some(_) => {
                return Err(self.schema_error(
                    format!("step '{}': 'task' must be a string", name),
                    &quoted(&name),
                ))
            }
        };

        let technique = match (obj.get("technique"), task) {
            (Some(Json::String(t)), _) => t.clone(),
            (None, TaskKind::Dilute) => String::new(),
            (None, TaskKind::Measure) => {
                return Err(ParseError::new(
                    ParseErrorKind::MissingField,
                    format!("measurement step '{}' has no 'technique'", name),
                )
                .located(self.source, &quoted(&name)))
            }
            (Some(_), _) => {
                return Err(self.schema_error(
                    format!("step '{}': 'technique' must be a string", name),
                    &quoted(&name),
                ))
            }
        };

        let mut parameters = match obj.get("parameters") {
            None | Some(Json::Null) => ParameterMap::new(),
            Some(Json::Object(map)) => map
                .iter()
                .map(|(k, v)| (k.clone(), Value::from(v.clone())))
                .collect(),
            Some(_) => {
                return Err(self.schema_error(
                    format!("step '{}': 'parameters' must be a mapping", name),
                    &quoted(&name),
                ))
            }
        };
        for key in INLINE_PARAMETER_KEYS {
            if let Some(value) = obj.get(key) {
                parameters.insert(key.to_string(), Value::from(value.clone()));
            }
        }

        let update_rules = match obj.get("update_parameters") {
            None | Some(Json::Null) => Vec::new(),
            Some(Json::Array(rules)) => rules
                .iter()
                .map(|rule| self.update_rule(&name, rule))
                .collect::<ParseResult<_>>()?,
            Some(_) => {
                return Err(self.schema_error(
                    format!("step '{}': 'update_parameters' must be a list", name),
                    &quoted(&name),
                ))
            }
        };

        let analysis = obj
            .get("analysis_settings")
            .cloned()
            .map(Value::from)
            .unwrap_or(Value::Null);

        Ok(StepSpec {
            name,
            task,
            technique,
            parameters,
            update_rules,
            analysis,
        })
    }

    fn update_rule(&self, step: &str, rule: &Json) -> ParseResult<ParameterUpdateRule> {
        let obj = rule.as_object().ok_or_else(|| {
            self.schema_error(
                format!("step '{}': each update_parameters entry must be a mapping", step),
                &quoted(step),
            )
        })?;

        let field = |key: &str| -> ParseResult<String> {
            obj.get(key)
                .and_then(Json::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    ParseError::new(
                        ParseErrorKind::MissingField,
                        format!("step '{}': update rule needs a string '{}'", step, key),
                    )
                    .located(self.source, &quoted(step))
                })
        };

        let target = field("parameter")?;
        let source_step = field("from measurement")?;
        let source_key = field("key")?;

        let selection = match (obj.get("filters"), obj.get("selection")) {
            (None, None) => None,
            (filters, Some(selection)) => Some(self.selection(step, filters, selection)?),
            (Some(_), None) => {
                return Err(ParseError::new(
                    ParseErrorKind::MissingField,
                    format!(
                        "step '{}': rule for '{}' has filters but no selection",
                        step, target
                    ),
                )
                .located(self.source, &quoted(&target))
                .with_suggestion(
                    "add \"selection\": {\"key\": ..., \"operation\": \"max(x)\"}",
                ))
            }
        };

        Ok(ParameterUpdateRule {
            target,
            source_step,
            source_key,
            selection,
        })
    }

    fn selection(
        &self,
        step: &str,
        filters: Option<&Json>,
        selection: &Json,
    ) -> ParseResult<SelectionExpression> {
        let filters = match filters {
            None | Some(Json::Null) => Vec::new(),
            Some(Json::Array(items)) => items
                .iter()
                .map(|f| {
                    let (key, predicate) = self.clause(step, f)?;
                    Ok(FilterClause { key, predicate })
                })
                .collect::<ParseResult<_>>()?,
            Some(_) => {
                return Err(self.schema_error(
                    format!("step '{}': 'filters' must be a list", step),
                    "\"filters\"",
                ))
            }
        };

        let (key, aggregator) = self.clause(step, selection)?;
        Ok(SelectionExpression {
            filters,
            pick: PickClause { key, aggregator },
        })
    }

    /// `{ "key": ..., "operation": ... }` with a compiled operation
    fn clause(&self, step: &str, clause: &Json) -> ParseResult<(String, Expression)> {
        let key = clause.get("key").and_then(Json::as_str);
        let operation = clause.get("operation").and_then(Json::as_str);
        let (Some(key), Some(operation)) = (key, operation) else {
            return Err(ParseError::new(
                ParseErrorKind::MissingField,
                format!("step '{}': clauses need string 'key' and 'operation'", step),
            )
            .located(self.source, &quoted(step)));
        };

        let expression = Expression::compile(operation).map_err(|e| {
            ParseError::new(
                ParseErrorKind::ExpressionError,
                format!("step '{}': invalid expression '{}': {}", step, operation, e),
            )
            .located(self.source, operation)
        })?;

        Ok((key.to_string(), expression))
    }

    /// Every rule must name a step that comes before the owning step
    fn check_references(&self, steps: &[StepSpec]) -> ParseResult<()> {
        for (index, step) in steps.iter().enumerate() {
            for rule in &step.update_rules {
                match steps.iter().position(|s| s.name == rule.source_step) {
                    Some(source) if source < index => {}
                    Some(_) => {
                        return Err(ParseError::new(
                            ParseErrorKind::ForwardReference,
                            format!(
                                "step '{}' takes '{}' from '{}', which does not run before it",
                                step.name, rule.target, rule.source_step
                            ),
                        )
                        .located(self.source, &quoted(&rule.source_step))
                        .with_suggestion("update rules may only use outputs of earlier steps"))
                    }
                    None => {
                        let known: Vec<&str> = steps[..index].iter().map(|s| s.name.as_str()).collect();
                        let mut err = ParseError::new(
                            ParseErrorKind::UnknownStep,
                            format!(
                                "step '{}' references unknown step '{}'",
                                step.name, rule.source_step
                            ),
                        )
                        .located(self.source, &quoted(&rule.source_step));
                        if !known.is_empty() {
                            err = err.with_suggestion(format!(
                                "earlier steps are: {}",
                                known.join(", ")
                            ));
                        }
                        return Err(err);
                    }
                }
            }
        }
        Ok(())
    }

    fn string(&self, obj: &Map<String, Json>, key: &str) -> ParseResult<String> {
        obj[key]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| self.schema_error(format!("'{}' must be a string", key), &quoted(key)))
    }

    fn number(&self, obj: &Map<String, Json>, key: &str) -> ParseResult<f64> {
        obj[key]
            .as_f64()
            .ok_or_else(|| self.schema_error(format!("'{}' must be a number", key), &quoted(key)))
    }

    fn optional_number(&self, obj: &Map<String, Json>, key: &str) -> ParseResult<Option<f64>> {
        match obj.get(key) {
            None => Ok(None),
            Some(v) => v.as_f64().map(Some).ok_or_else(|| {
                self.schema_error(format!("'{}' must be a number", key), &quoted(key))
            }),
        }
    }

    /// A non-negative whole number that fits in `u32`
    fn optional_count(&self, obj: &Map<String, Json>, key: &str) -> ParseResult<Option<u32>> {
        match obj.get(key) {
            None => Ok(None),
            Some(v) => v
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .or_else(|| {
                    v.as_f64()
                        .filter(|n| n.fract() == 0.0 && *n >= 0.0 && *n <= f64::from(u32::MAX))
                        .map(|n| n as u32)
                })
                .map(Some)
                .ok_or_else(|| {
                    self.schema_error(
                        format!("'{}' must be a non-negative whole number", key),
                        &quoted(key),
                    )
                }),
        }
    }

    fn boolean(&self, obj: &Map<String, Json>, key: &str) -> ParseResult<bool> {
        obj[key]
            .as_bool()
            .ok_or_else(|| self.schema_error(format!("'{}' must be true or false", key), &quoted(key)))
    }

    fn duplicate_step(&self, name: &str, needle: &str) -> ParseError {
        ParseError::new(
            ParseErrorKind::DuplicateStep,
            format!("step '{}' is defined more than once", name),
        )
        .located(self.source, needle)
        .with_suggestion("step names must be unique within a protocol")
    }

    fn schema_error(&self, message: impl Into<String>, needle: &str) -> ParseError {
        let error = ParseError::new(ParseErrorKind::InvalidSchema, message);
        // YAML keys are usually unquoted
        if self.source.contains(needle) {
            error.located(self.source, needle)
        } else {
            error.located(self.source, needle.trim_matches('"'))
        }
    }
}

fn quoted(text: &str) -> String {
    format!("\"{}\"", text)
}
