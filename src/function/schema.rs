//! Schema synthesis: typed input validators and output envelopes per route.
//!
//! Schemas are built once at registration from a [`Reflection`] and never
//! mutated. Validation walks the static [`SemanticType`] tree instead of
//! re-inspecting the function on every call.

use crate::function::error::{ValidationError, ValidationIssue};
use crate::function::manifest::OutputShape;
use crate::function::reflect::Reflection;
use crate::http::{ResultEnvelope, UploadFile};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};

/// Name of the reserved per-call environment overlay field.
pub const ENVS_FIELD: &str = "envs";

/// Wire-level type of a field, derived from the Rust parameter type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "of", rename_all = "snake_case")]
pub enum SemanticType {
    String,
    Int,
    Float,
    Bool,
    /// Any JSON object; nested structure is checked when the argument is
    /// converted to its Rust type.
    Object,
    /// String-keyed object with homogeneous values.
    Map(Box<SemanticType>),
    List(Box<SemanticType>),
    Optional(Box<SemanticType>),
    /// Binary upload, only accepted as a multipart part.
    File,
    Any,
}

impl SemanticType {
    /// Short human readable name, e.g. `list[int]`.
    pub fn name(&self) -> String {
        match self {
            SemanticType::String => "str".into(),
            SemanticType::Int => "int".into(),
            SemanticType::Float => "float".into(),
            SemanticType::Bool => "bool".into(),
            SemanticType::Object => "object".into(),
            SemanticType::Map(inner) => format!("dict[str, {}]", inner.name()),
            SemanticType::List(inner) => format!("list[{}]", inner.name()),
            SemanticType::Optional(inner) => format!("optional[{}]", inner.name()),
            SemanticType::File => "file".into(),
            SemanticType::Any => "any".into(),
        }
    }

    /// True for `File` and `Optional(File)`.
    pub fn is_file(&self) -> bool {
        match self {
            SemanticType::File => true,
            SemanticType::Optional(inner) => inner.is_file(),
            _ => false,
        }
    }

    /// Check `value` against this type, appending any problems to `issues`.
    pub fn check(&self, value: &Value, loc: &[Value], issues: &mut Vec<ValidationIssue>) {
        let ok = match (self, value) {
            (SemanticType::Any, _) => true,
            (SemanticType::Optional(_), Value::Null) => true,
            (SemanticType::Optional(inner), other) => {
                inner.check(other, loc, issues);
                return;
            }
            (SemanticType::String, Value::String(_)) => true,
            (SemanticType::Int, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (SemanticType::Float, Value::Number(_)) => true,
            (SemanticType::Bool, Value::Bool(_)) => true,
            (SemanticType::Object, Value::Object(_)) => true,
            (SemanticType::Map(inner), Value::Object(entries)) => {
                for (key, entry) in entries {
                    inner.check(entry, &child(loc, Value::from(key.as_str())), issues);
                }
                return;
            }
            (SemanticType::List(inner), Value::Array(items)) => {
                for (idx, item) in items.iter().enumerate() {
                    inner.check(item, &child(loc, Value::from(idx)), issues);
                }
                return;
            }
            _ => false,
        };

        if !ok {
            let (msg, kind) = self.type_error();
            issues.push(ValidationIssue::new(loc.to_vec(), msg, kind));
        }
    }

    fn type_error(&self) -> (&'static str, &'static str) {
        match self {
            SemanticType::String => ("str type expected", "type_error.str"),
            SemanticType::Int => ("value is not a valid integer", "type_error.integer"),
            SemanticType::Float => ("value is not a valid float", "type_error.float"),
            SemanticType::Bool => ("value could not be parsed to a boolean", "type_error.bool"),
            SemanticType::Object | SemanticType::Map(_) => {
                ("value is not a valid dict", "type_error.dict")
            }
            SemanticType::List(_) => ("value is not a valid list", "type_error.list"),
            SemanticType::File => ("expected an uploaded file", "type_error.file"),
            SemanticType::Optional(inner) => inner.type_error(),
            SemanticType::Any => ("invalid value", "type_error"),
        }
    }

    /// JSON-Schema flavoured description used by route introspection.
    pub fn json_schema(&self) -> Value {
        match self {
            SemanticType::String => json!({"type": "string"}),
            SemanticType::Int => json!({"type": "integer"}),
            SemanticType::Float => json!({"type": "number"}),
            SemanticType::Bool => json!({"type": "boolean"}),
            SemanticType::Object => json!({"type": "object"}),
            SemanticType::Map(inner) => {
                json!({"type": "object", "additionalProperties": inner.json_schema()})
            }
            SemanticType::List(inner) => json!({"type": "array", "items": inner.json_schema()}),
            SemanticType::Optional(inner) => {
                json!({"anyOf": [inner.json_schema(), {"type": "null"}]})
            }
            SemanticType::File => json!({"type": "string", "format": "binary"}),
            SemanticType::Any => json!({}),
        }
    }
}

fn child(loc: &[Value], part: Value) -> Vec<Value> {
    let mut next = loc.to_vec();
    next.push(part);
    next
}

fn body_loc(name: &str) -> Vec<Value> {
    vec![Value::from("body"), Value::from(name)]
}

/// One input field, derived once from reflection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub semantic_type: SemanticType,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl FieldSpec {
    pub fn required(name: impl Into<String>, semantic_type: SemanticType) -> Self {
        Self {
            name: name.into(),
            semantic_type,
            required: true,
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>, semantic_type: SemanticType, default: Value) -> Self {
        Self {
            name: name.into(),
            semantic_type,
            required: false,
            default: Some(default),
        }
    }

    /// The reserved `envs: dict[str, str] = {}` field.
    pub fn envs() -> Self {
        Self::optional(
            ENVS_FIELD,
            SemanticType::Map(Box::new(SemanticType::String)),
            Value::Object(Map::new()),
        )
    }

    fn describe(&self) -> Value {
        let mut schema = self.semantic_type.json_schema();
        if let (Some(default), Value::Object(map)) = (&self.default, &mut schema) {
            map.insert("default".into(), default.clone());
        }
        schema
    }
}

/// Validated inbound call.
#[derive(Debug, Clone, Default)]
pub struct CallEnvelope {
    /// Declared fields with defaults filled in; excludes `envs`.
    pub fields: Map<String, Value>,
    pub envs: BTreeMap<String, String>,
    pub files: HashMap<String, UploadFile>,
}

/// Request validator for one route, named `Input<Route>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputSchema {
    pub name: String,
    /// Ordered input fields; the reserved `envs` field is always last.
    pub fields: Vec<FieldSpec>,
    pub file_fields: Vec<FieldSpec>,
}

impl InputSchema {
    pub fn is_file_field(&self, name: &str) -> bool {
        self.file_fields.iter().any(|f| f.name == name)
    }

    /// Validate a JSON body.
    pub fn validate(&self, body: Value) -> Result<CallEnvelope, ValidationError> {
        self.validate_with_files(body, HashMap::new())
    }

    /// Validate a JSON body together with uploaded file parts.
    ///
    /// Every problem is reported, not only the first one. Unknown fields are
    /// dropped.
    pub fn validate_with_files(
        &self,
        body: Value,
        mut files: HashMap<String, UploadFile>,
    ) -> Result<CallEnvelope, ValidationError> {
        let mut body = match body {
            Value::Object(map) => map,
            _ => {
                return Err(ValidationError::single(
                    vec![Value::from("body")],
                    "value is not a valid dict",
                    "type_error.dict",
                ))
            }
        };

        let mut issues = Vec::new();
        let mut envelope = CallEnvelope::default();

        for field in &self.fields {
            let loc = body_loc(&field.name);
            match body.remove(&field.name) {
                Some(value) => {
                    let before = issues.len();
                    field.semantic_type.check(&value, &loc, &mut issues);
                    if issues.len() != before {
                        continue;
                    }
                    if field.name == ENVS_FIELD {
                        envelope.envs = string_map(value);
                    } else {
                        envelope.fields.insert(field.name.clone(), value);
                    }
                }
                None if field.required => issues.push(ValidationIssue::missing(loc)),
                None => {
                    if field.name != ENVS_FIELD {
                        let default = field.default.clone().unwrap_or(Value::Null);
                        envelope.fields.insert(field.name.clone(), default);
                    }
                }
            }
        }

        for field in &self.file_fields {
            match files.remove(&field.name) {
                Some(file) => {
                    envelope.files.insert(field.name.clone(), file);
                }
                None if field.required => {
                    issues.push(ValidationIssue::missing(body_loc(&field.name)))
                }
                None => {}
            }
        }

        if issues.is_empty() {
            Ok(envelope)
        } else {
            Err(ValidationError::new(issues))
        }
    }

    pub fn describe(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for field in self.fields.iter().chain(&self.file_fields) {
            properties.insert(field.name.clone(), field.describe());
            if field.required {
                required.push(Value::from(field.name.as_str()));
            }
        }
        json!({
            "title": self.name,
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

fn string_map(value: Value) -> BTreeMap<String, String> {
    match value {
        Value::Object(entries) => entries
            .into_iter()
            .filter_map(|(k, v)| match v {
                Value::String(s) => Some((k, s)),
                _ => None,
            })
            .collect(),
        _ => BTreeMap::new(),
    }
}

/// Response envelope builder for one route, named `Output<Route>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputSchema {
    pub name: String,
    pub result_type: SemanticType,
    pub shape: OutputShape,
}

impl OutputSchema {
    /// Successful envelope.
    pub fn ok(&self, result: Value, stdout: String) -> ResultEnvelope {
        ResultEnvelope {
            result,
            error: String::new(),
            stdout,
        }
    }

    /// Failed envelope; `result` is null.
    pub fn failed(&self, error: impl Into<String>, stdout: String) -> ResultEnvelope {
        ResultEnvelope {
            result: Value::Null,
            error: error.into(),
            stdout,
        }
    }

    pub fn describe(&self) -> Value {
        json!({
            "title": self.name,
            "type": "object",
            "properties": {
                "result": self.result_type.json_schema(),
                "error": {"type": "string"},
                "stdout": {"type": "string", "default": ""},
            },
            "required": ["result", "error"],
            "streaming": self.shape == OutputShape::Stream,
        })
    }
}

/// Build the input and output schemas for a route.
pub fn synthesize(route_name: &str, reflection: &Reflection) -> (InputSchema, OutputSchema) {
    let input = InputSchema {
        name: format!("Input{}", route_name),
        fields: reflection.input_fields.clone(),
        file_fields: reflection.file_fields.clone(),
    };
    let output = OutputSchema {
        name: format!("Output{}", route_name),
        result_type: reflection.output_type.clone(),
        shape: reflection.output_shape,
    };
    (input, output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn schema() -> InputSchema {
        InputSchema {
            name: "InputDemo".into(),
            fields: vec![
                FieldSpec::required("interval", SemanticType::Int),
                FieldSpec::required("name", SemanticType::String),
                FieldSpec::optional("loud", SemanticType::Bool, json!(false)),
                FieldSpec::optional(
                    "tags",
                    SemanticType::Optional(Box::new(SemanticType::List(Box::new(
                        SemanticType::String,
                    )))),
                    Value::Null,
                ),
                FieldSpec::envs(),
            ],
            file_fields: vec![],
        }
    }

    #[test]
    fn test_accepts_required_fields_and_fills_defaults() {
        let envelope = schema()
            .validate(json!({"interval": 1, "name": "x"}))
            .unwrap();
        assert_eq!(envelope.fields["interval"], json!(1));
        assert_eq!(envelope.fields["loud"], json!(false));
        assert_eq!(envelope.fields["tags"], Value::Null);
        assert!(envelope.envs.is_empty());
        assert!(!envelope.fields.contains_key("envs"));
    }

    #[test]
    fn test_reports_every_missing_required_field() {
        let err = schema().validate(json!({"loud": true})).unwrap_err();
        let locs: Vec<_> = err.issues.iter().map(|i| i.loc.clone()).collect();
        assert_eq!(
            locs,
            vec![
                vec![json!("body"), json!("interval")],
                vec![json!("body"), json!("name")],
            ]
        );
        assert!(err.issues.iter().all(|i| i.kind == "value_error.missing"));
    }

    #[test]
    fn test_nested_type_errors_carry_location() {
        let err = schema()
            .validate(json!({"interval": 1, "name": "x", "tags": ["a", 2]}))
            .unwrap_err();
        assert_eq!(err.issues.len(), 1);
        assert_eq!(err.issues[0].loc, vec![json!("body"), json!("tags"), json!(1)]);
        assert_eq!(err.issues[0].kind, "type_error.str");
    }

    #[test]
    fn test_int_rejects_float_and_string() {
        let err = schema()
            .validate(json!({"interval": 1.5, "name": "x"}))
            .unwrap_err();
        assert_eq!(err.issues[0].kind, "type_error.integer");
        assert!(schema()
            .validate(json!({"interval": "1", "name": "x"}))
            .is_err());
    }

    #[test]
    fn test_envs_extracted_and_validated() {
        let envelope = schema()
            .validate(json!({"interval": 1, "name": "x", "envs": {"API_KEY": "k"}}))
            .unwrap();
        assert_eq!(envelope.envs.get("API_KEY").map(String::as_str), Some("k"));

        let err = schema()
            .validate(json!({"interval": 1, "name": "x", "envs": {"API_KEY": 3}}))
            .unwrap_err();
        assert_eq!(
            err.issues[0].loc,
            vec![json!("body"), json!("envs"), json!("API_KEY")]
        );
    }

    #[test]
    fn test_non_object_body_rejected() {
        let err = schema().validate(json!([1, 2])).unwrap_err();
        assert_eq!(err.issues[0].loc, vec![json!("body")]);
    }

    #[test]
    fn test_unknown_fields_are_dropped() {
        let envelope = schema()
            .validate(json!({"interval": 1, "name": "x", "extra": true}))
            .unwrap();
        assert!(!envelope.fields.contains_key("extra"));
    }

    #[test]
    fn test_required_file_part() {
        let mut schema = schema();
        schema.file_fields = vec![FieldSpec::required("upload", SemanticType::File)];
        let err = schema
            .validate(json!({"interval": 1, "name": "x"}))
            .unwrap_err();
        assert_eq!(err.issues[0].loc, vec![json!("body"), json!("upload")]);

        let mut files = HashMap::new();
        files.insert(
            "upload".to_string(),
            UploadFile::new(Some("a.txt".into()), None, Bytes::from_static(b"hi")),
        );
        let envelope = schema
            .validate_with_files(json!({"interval": 1, "name": "x"}), files)
            .unwrap();
        assert_eq!(envelope.files["upload"].data.as_ref(), b"hi");
    }

    #[test]
    fn test_describe_lists_required_and_defaults() {
        let described = schema().describe();
        assert_eq!(described["title"], "InputDemo");
        assert_eq!(described["required"], json!(["interval", "name"]));
        assert_eq!(described["properties"]["envs"]["default"], json!({}));
    }
}
