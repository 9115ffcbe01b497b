//! Signature reflection.
//!
//! [`FieldType`] maps Rust parameter types onto wire-level semantic types; the
//! `#[servable]` macro calls it for every parameter. [`reflect`] then turns a
//! [`FunctionDecl`] into the field lists the schema synthesizer consumes.

use crate::function::error::RegistrationError;
use crate::function::manifest::{FunctionDecl, Injection, OutputShape, ParamDecl, RouteKind};
use crate::function::schema::{FieldSpec, SemanticType, ENVS_FIELD};
use crate::http::UploadFile;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Wire type of a parameter or return value.
///
/// Implemented for scalars, `String`, `Vec`, `Option`, string-keyed maps and
/// JSON values. Your own `Deserialize` structs opt in with an empty impl and
/// are treated as nested objects:
///
/// ```
/// # use servegate::FieldType;
/// #[derive(serde::Deserialize, serde::Serialize)]
/// struct Query { text: String, limit: u32 }
///
/// impl FieldType for Query {}
/// ```
pub trait FieldType {
    fn semantic_type() -> SemanticType {
        SemanticType::Object
    }
}

macro_rules! field_types {
    ($semantic:ident => $($ty:ty),+ $(,)?) => {
        $(
            impl FieldType for $ty {
                fn semantic_type() -> SemanticType {
                    SemanticType::$semantic
                }
            }
        )+
    };
}

field_types!(String => String, char);
field_types!(Int => i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize);
field_types!(Float => f32, f64);
field_types!(Bool => bool);
field_types!(Any => Value);
field_types!(File => UploadFile);

impl FieldType for serde_json::Map<String, Value> {}

impl<T: FieldType> FieldType for Vec<T> {
    fn semantic_type() -> SemanticType {
        SemanticType::List(Box::new(T::semantic_type()))
    }
}

impl<T: FieldType> FieldType for Option<T> {
    fn semantic_type() -> SemanticType {
        SemanticType::Optional(Box::new(T::semantic_type()))
    }
}

impl<T: FieldType> FieldType for Box<T> {
    fn semantic_type() -> SemanticType {
        T::semantic_type()
    }
}

impl<V: FieldType, S> FieldType for HashMap<String, V, S> {
    fn semantic_type() -> SemanticType {
        SemanticType::Map(Box::new(V::semantic_type()))
    }
}

impl<V: FieldType> FieldType for BTreeMap<String, V> {
    fn semantic_type() -> SemanticType {
        SemanticType::Map(Box::new(V::semantic_type()))
    }
}

/// Output of the signature reflector.
#[derive(Debug, Clone, PartialEq)]
pub struct Reflection {
    /// Payload fields in declaration order, with `envs` appended.
    pub input_fields: Vec<FieldSpec>,
    pub file_fields: Vec<FieldSpec>,
    pub output_type: SemanticType,
    pub output_shape: OutputShape,
    pub injections: Vec<Injection>,
}

/// Classify every parameter of `decl`.
///
/// `has_authorizer` tells whether the route will carry an authorizer, which a
/// non-optional `AuthContext` parameter needs.
pub fn reflect(decl: &FunctionDecl, has_authorizer: bool) -> Result<Reflection, RegistrationError> {
    let mut input_fields = Vec::new();
    let mut file_fields = Vec::new();
    let mut injections = Vec::new();
    let mut seen = HashSet::new();

    for param in &decl.params {
        let name = param.name();
        if !seen.insert(name.to_string()) {
            return Err(RegistrationError::DuplicateParameter {
                function: decl.name.clone(),
                param: name.to_string(),
            });
        }

        match param {
            ParamDecl::Context { .. } => {}
            ParamDecl::Injected { injection, .. } => {
                check_injection(decl, name, *injection, has_authorizer)?;
                injections.push(*injection);
            }
            ParamDecl::Field {
                annotation,
                default,
                ..
            } => {
                if name == ENVS_FIELD {
                    return Err(RegistrationError::ReservedParameter {
                        function: decl.name.clone(),
                        param: name.to_string(),
                    });
                }
                let semantic_type =
                    annotation
                        .clone()
                        .ok_or_else(|| RegistrationError::MissingAnnotation {
                            function: decl.name.clone(),
                            param: name.to_string(),
                        })?;

                let spec = field_spec(name, semantic_type, default.clone());
                if spec.semantic_type.is_file() {
                    file_fields.push(spec);
                } else {
                    input_fields.push(spec);
                }
            }
        }
    }

    input_fields.push(FieldSpec::envs());

    Ok(Reflection {
        input_fields,
        file_fields,
        output_type: decl
            .returns
            .annotation
            .clone()
            .unwrap_or(SemanticType::String),
        output_shape: decl.returns.shape,
        injections,
    })
}

fn field_spec(name: &str, semantic_type: SemanticType, default: Option<Value>) -> FieldSpec {
    match (default, semantic_type) {
        (Some(default), semantic_type) => FieldSpec::optional(name, semantic_type, default),
        (None, SemanticType::Optional(inner)) => {
            let inner = match *inner {
                // Optional uploads are simply absent from the form.
                SemanticType::File => SemanticType::File,
                other => SemanticType::Optional(Box::new(other)),
            };
            FieldSpec::optional(name, inner, Value::Null)
        }
        (None, semantic_type) => FieldSpec::required(name, semantic_type),
    }
}

fn check_injection(
    decl: &FunctionDecl,
    param: &str,
    injection: Injection,
    has_authorizer: bool,
) -> Result<(), RegistrationError> {
    let reason = match injection {
        Injection::Auth if !has_authorizer => Some("the route has no authorizer"),
        Injection::StreamSender | Injection::Connection if decl.kind == RouteKind::Http => {
            Some("only available on websocket routes")
        }
        _ => None,
    };
    match reason {
        Some(reason) => Err(RegistrationError::UnsupportedInjection {
            function: decl.name.clone(),
            param: param.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::manifest::ReturnDecl;
    use serde_json::json;

    #[test]
    fn test_field_types() {
        assert_eq!(u64::semantic_type(), SemanticType::Int);
        assert_eq!(
            Vec::<Option<String>>::semantic_type(),
            SemanticType::List(Box::new(SemanticType::Optional(Box::new(
                SemanticType::String
            ))))
        );
        assert_eq!(
            HashMap::<String, f64>::semantic_type(),
            SemanticType::Map(Box::new(SemanticType::Float))
        );
        assert_eq!(serde_json::Map::<String, Value>::semantic_type(), SemanticType::Object);
    }

    #[test]
    fn test_reflect_classifies_parameters() {
        let decl = FunctionDecl::new("summarize", RouteKind::Http)
            .param(ParamDecl::typed::<String>("text"))
            .param(ParamDecl::typed::<u32>("limit").with_default(10))
            .param(ParamDecl::typed::<Option<bool>>("verbose"))
            .param(ParamDecl::typed::<UploadFile>("document"))
            .param(ParamDecl::typed::<Option<UploadFile>>("appendix"))
            .param(ParamDecl::injected("auth", Injection::OptionalAuth))
            .param(ParamDecl::context("ctx"))
            .returns(ReturnDecl::single::<String>());

        let reflection = reflect(&decl, false).unwrap();
        let names: Vec<_> = reflection.input_fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["text", "limit", "verbose", "envs"]);
        assert!(reflection.input_fields[0].required);
        assert_eq!(reflection.input_fields[1].default, Some(json!(10)));
        assert!(!reflection.input_fields[2].required);

        assert_eq!(reflection.file_fields.len(), 2);
        assert!(reflection.file_fields[0].required);
        assert!(!reflection.file_fields[1].required);
        assert_eq!(reflection.file_fields[1].semantic_type, SemanticType::File);
        assert_eq!(reflection.injections, vec![Injection::OptionalAuth]);
    }

    #[test]
    fn test_missing_annotation_is_rejected() {
        let decl = FunctionDecl::new("legacy", RouteKind::Http)
            .param(ParamDecl::typed::<String>("ok"))
            .param(ParamDecl::untyped("mystery"));
        let err = reflect(&decl, false).unwrap_err();
        assert_eq!(
            err,
            RegistrationError::MissingAnnotation {
                function: "legacy".into(),
                param: "mystery".into(),
            }
        );
    }

    #[test]
    fn test_context_parameter_needs_no_annotation() {
        let decl = FunctionDecl::new("kw", RouteKind::Http).param(ParamDecl::context("kwargs"));
        assert!(reflect(&decl, false).is_ok());
    }

    #[test]
    fn test_reserved_and_duplicate_names() {
        let decl = FunctionDecl::new("f", RouteKind::Http)
            .param(ParamDecl::typed::<HashMap<String, String>>("envs"));
        assert!(matches!(
            reflect(&decl, false),
            Err(RegistrationError::ReservedParameter { .. })
        ));

        let decl = FunctionDecl::new("f", RouteKind::Http)
            .param(ParamDecl::typed::<i64>("x"))
            .param(ParamDecl::typed::<i64>("x"));
        assert!(matches!(
            reflect(&decl, false),
            Err(RegistrationError::DuplicateParameter { .. })
        ));
    }

    #[test]
    fn test_stream_injections_need_websocket() {
        let decl = FunctionDecl::new("f", RouteKind::Http)
            .param(ParamDecl::injected("sender", Injection::StreamSender));
        assert!(matches!(
            reflect(&decl, false),
            Err(RegistrationError::UnsupportedInjection { .. })
        ));

        let decl = FunctionDecl::new("f", RouteKind::Stream)
            .param(ParamDecl::injected("sender", Injection::StreamSender))
            .param(ParamDecl::injected("conn", Injection::Connection));
        assert!(reflect(&decl, false).is_ok());
    }

    #[test]
    fn test_required_auth_needs_authorizer() {
        let decl =
            FunctionDecl::new("f", RouteKind::Http).param(ParamDecl::injected("a", Injection::Auth));
        assert!(reflect(&decl, false).is_err());
        assert!(reflect(&decl, true).is_ok());
    }

    #[test]
    fn test_output_type_defaults_to_string() {
        let decl = FunctionDecl::new("f", RouteKind::Stream);
        let reflection = reflect(&decl, false).unwrap();
        assert_eq!(reflection.output_type, SemanticType::String);
        assert_eq!(reflection.output_shape, OutputShape::Single);

        let decl = FunctionDecl::new("g", RouteKind::Stream).returns(ReturnDecl::stream::<i64>());
        let reflection = reflect(&decl, false).unwrap();
        assert_eq!(reflection.output_type, SemanticType::Int);
        assert_eq!(reflection.output_shape, OutputShape::Stream);
    }
}
