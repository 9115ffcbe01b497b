//! Function declarations: the compile-time picture of a servable signature.
//!
//! A [`FunctionDecl`] is generated by the `#[servable]` macro (or written by
//! hand for a [`DynamicFunction`](crate::function::DynamicFunction)) and is
//! the only input the signature reflector looks at.

use crate::function::reflect::FieldType;
use crate::function::schema::SemanticType;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Transport a route is mounted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteKind {
    /// `POST /<name>` request/response.
    Http,
    /// `GET /<name>` upgraded to a WebSocket.
    Stream,
}

/// Whether a function returns one value or a lazy sequence of values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputShape {
    Single,
    Stream,
}

/// Handles the gateway provides instead of reading them from the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Injection {
    /// `AuthContext`; the route must have an authorizer.
    Auth,
    /// `Option<AuthContext>`.
    OptionalAuth,
    /// `StreamSender`, streaming routes only.
    StreamSender,
    /// `Connection`, streaming routes only.
    Connection,
}

/// One declared parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamDecl {
    /// Read from the request payload.
    Field {
        name: String,
        /// `None` when the parameter carries no type.
        annotation: Option<SemanticType>,
        default: Option<Value>,
    },
    /// Supplied by the gateway.
    Injected { name: String, injection: Injection },
    /// The catch-all `CallContext`; exempt from annotation rules.
    Context { name: String },
}

impl ParamDecl {
    /// A payload field typed by `T`.
    pub fn typed<T: FieldType>(name: impl Into<String>) -> Self {
        ParamDecl::Field {
            name: name.into(),
            annotation: Some(T::semantic_type()),
            default: None,
        }
    }

    /// A payload field with an explicit semantic type.
    pub fn of_type(name: impl Into<String>, semantic_type: SemanticType) -> Self {
        ParamDecl::Field {
            name: name.into(),
            annotation: Some(semantic_type),
            default: None,
        }
    }

    /// A payload field without a type. Rejected at registration.
    pub fn untyped(name: impl Into<String>) -> Self {
        ParamDecl::Field {
            name: name.into(),
            annotation: None,
            default: None,
        }
    }

    pub fn injected(name: impl Into<String>, injection: Injection) -> Self {
        ParamDecl::Injected {
            name: name.into(),
            injection,
        }
    }

    pub fn context(name: impl Into<String>) -> Self {
        ParamDecl::Context { name: name.into() }
    }

    /// Make a field optional with the given default. No effect on injected
    /// or context parameters.
    pub fn with_default<V: Serialize>(mut self, value: V) -> Self {
        if let ParamDecl::Field { default, .. } = &mut self {
            *default = Some(serde_json::to_value(value).unwrap_or(Value::Null));
        }
        self
    }

    pub fn name(&self) -> &str {
        match self {
            ParamDecl::Field { name, .. }
            | ParamDecl::Injected { name, .. }
            | ParamDecl::Context { name } => name,
        }
    }
}

/// Declared return type.
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnDecl {
    /// `None` when the function has no return annotation.
    pub annotation: Option<SemanticType>,
    pub shape: OutputShape,
}

impl ReturnDecl {
    pub fn single<T: FieldType>() -> Self {
        Self {
            annotation: Some(T::semantic_type()),
            shape: OutputShape::Single,
        }
    }

    /// A lazy sequence whose elements are `T`.
    pub fn stream<T: FieldType>() -> Self {
        Self {
            annotation: Some(T::semantic_type()),
            shape: OutputShape::Stream,
        }
    }

    pub fn unannotated() -> Self {
        Self {
            annotation: None,
            shape: OutputShape::Single,
        }
    }
}

impl Default for ReturnDecl {
    fn default() -> Self {
        Self::unannotated()
    }
}

/// Everything the gateway needs to know about a servable function.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDecl {
    /// Function identifier; the route path is `/<name>`.
    pub name: String,
    pub kind: RouteKind,
    pub doc: String,
    pub params: Vec<ParamDecl>,
    pub returns: ReturnDecl,
    /// Runs on the worker pool instead of the event loop.
    pub blocking: bool,
    /// Streaming routes only: keep the socket open for further calls once
    /// the function returns.
    pub multi_turn: bool,
}

impl FunctionDecl {
    pub fn new(name: impl Into<String>, kind: RouteKind) -> Self {
        Self {
            name: name.into(),
            kind,
            doc: String::new(),
            params: Vec::new(),
            returns: ReturnDecl::default(),
            blocking: false,
            multi_turn: false,
        }
    }

    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = doc.into();
        self
    }

    pub fn param(mut self, param: ParamDecl) -> Self {
        self.params.push(param);
        self
    }

    pub fn returns(mut self, returns: ReturnDecl) -> Self {
        self.returns = returns;
        self
    }

    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    pub fn multi_turn(mut self, multi_turn: bool) -> Self {
        self.multi_turn = multi_turn;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decl_builder() {
        let decl = FunctionDecl::new("sync_http", RouteKind::Http)
            .doc("Sleeps then greets")
            .blocking(true)
            .param(ParamDecl::typed::<u64>("interval"))
            .returns(ReturnDecl::single::<String>());
        assert_eq!(decl.name, "sync_http");
        assert!(decl.blocking);
        assert_eq!(decl.params.len(), 1);
        assert_eq!(decl.returns.annotation, Some(SemanticType::String));
    }

    #[test]
    fn test_with_default_only_touches_fields() {
        let field = ParamDecl::typed::<i64>("n").with_default(3);
        assert_eq!(
            field,
            ParamDecl::Field {
                name: "n".into(),
                annotation: Some(SemanticType::Int),
                default: Some(json!(3)),
            }
        );
        let injected = ParamDecl::injected("auth", Injection::Auth).with_default(1);
        assert_eq!(injected, ParamDecl::injected("auth", Injection::Auth));
    }

    #[test]
    fn test_kind_serialization() {
        assert_eq!(serde_json::to_string(&RouteKind::Stream).unwrap(), "\"stream\"");
        assert_eq!(serde_json::to_string(&OutputShape::Single).unwrap(), "\"single\"");
    }
}
