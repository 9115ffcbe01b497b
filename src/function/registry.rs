//! Route table: one entry per registered function.

use crate::auth::Authorizer;
use crate::function::error::RegistrationError;
use crate::function::handler::ServableFunction;
use crate::function::manifest::{Injection, OutputShape, RouteKind};
use crate::function::reflect::reflect;
use crate::function::schema::{synthesize, FieldSpec, InputSchema, OutputSchema, SemanticType};
use crate::observe::RouteStats;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Turn a function identifier into a route name.
///
/// Each run of letters is title-cased (first letter upper, rest lower) and
/// underscores are removed, so `sync_http` becomes `SyncHttp`. Distinct
/// identifiers can collapse to the same name: `foo_bar` and `foo__bar` both
/// give `FooBar`.
pub fn derive_route_name(function_name: &str) -> String {
    let mut name = String::with_capacity(function_name.len());
    let mut prev_is_letter = false;
    for c in function_name.chars() {
        if c.is_alphabetic() {
            if prev_is_letter {
                name.extend(c.to_lowercase());
            } else {
                name.extend(c.to_uppercase());
            }
            prev_is_letter = true;
        } else {
            prev_is_letter = false;
            if c != '_' {
                name.push(c);
            }
        }
    }
    name
}

/// Everything derived at registration for one route. Immutable afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteSpec {
    /// Route name, e.g. `SyncHttp`.
    pub name: String,
    /// Mount path, `/<function_name>`.
    pub path: String,
    pub function_name: String,
    pub kind: RouteKind,
    pub input: InputSchema,
    pub output: OutputSchema,
    pub injections: Vec<Injection>,
    pub requires_auth: bool,
    pub blocking: bool,
    pub multi_turn: bool,
    pub doc: String,
}

impl RouteSpec {
    pub fn input_fields(&self) -> &[FieldSpec] {
        &self.input.fields
    }

    pub fn file_fields(&self) -> &[FieldSpec] {
        &self.input.file_fields
    }

    pub fn output_type(&self) -> &SemanticType {
        &self.output.result_type
    }

    pub fn is_streaming(&self) -> bool {
        self.kind == RouteKind::Stream
    }

    pub fn describe(&self) -> Value {
        json!({
            "name": self.name,
            "path": self.path,
            "function": self.function_name,
            "kind": self.kind,
            "method": match self.kind {
                RouteKind::Http => "POST",
                RouteKind::Stream => "GET",
            },
            "requires_auth": self.requires_auth,
            "blocking": self.blocking,
            "multi_turn": self.multi_turn,
            "streaming_output": self.output.shape == OutputShape::Stream,
            "doc": self.doc,
            "input": self.input.describe(),
            "output": self.output.describe(),
        })
    }
}

/// A mounted route: its spec, the function and per-route counters.
pub struct Route {
    pub spec: Arc<RouteSpec>,
    pub function: Arc<dyn ServableFunction>,
    pub authorizer: Option<Arc<dyn Authorizer>>,
    pub stats: Arc<RouteStats>,
}

/// Outcome of a successful registration call.
#[derive(Debug, Clone, PartialEq)]
pub enum Registration {
    Registered(Arc<RouteSpec>),
    /// A route with the same name already existed; the first one wins.
    Skipped { name: String },
}

/// Registered routes in registration order.
#[derive(Default)]
pub struct RouteTable {
    routes: Vec<Arc<Route>>,
    index: HashMap<String, usize>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reflect `function`, synthesize its schemas and add it.
    pub fn register(
        &mut self,
        function: Arc<dyn ServableFunction>,
    ) -> Result<Registration, RegistrationError> {
        let decl = function.declaration();
        let valid = !decl.name.is_empty()
            && decl
                .name
                .chars()
                .all(|c| c.is_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(RegistrationError::InvalidName(decl.name));
        }

        let authorizer = function.authorizer();
        let reflection = reflect(&decl, authorizer.is_some())?;
        let name = derive_route_name(&decl.name);

        if self.index.contains_key(&name) {
            warn!(
                "Route {} for function {} is already registered, skipping",
                name, decl.name
            );
            return Ok(Registration::Skipped { name });
        }

        let (input, output) = synthesize(&name, &reflection);
        let spec = Arc::new(RouteSpec {
            path: format!("/{}", decl.name),
            function_name: decl.name.clone(),
            kind: decl.kind,
            input,
            output,
            injections: reflection.injections,
            requires_auth: authorizer.is_some(),
            blocking: decl.blocking,
            multi_turn: decl.multi_turn && decl.kind == RouteKind::Stream,
            doc: decl.doc,
            name: name.clone(),
        });
        debug!("Route {} input fields: {:?}", name, spec.input.fields);

        self.index.insert(name.clone(), self.routes.len());
        self.routes.push(Arc::new(Route {
            spec: spec.clone(),
            function,
            authorizer,
            stats: Arc::new(RouteStats::default()),
        }));
        info!("Registered route {} at {} ({:?})", name, spec.path, spec.kind);

        Ok(Registration::Registered(spec))
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Route>> {
        self.index.get(name).map(|&idx| &self.routes[idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Route>> {
        self.routes.iter()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn has_streaming_routes(&self) -> bool {
        self.routes.iter().any(|route| route.spec.is_streaming())
    }
}
