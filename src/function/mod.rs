//! Servable functions: declarations, reflection, schemas and the route table.

pub mod dynamic;
pub mod error;
pub mod handler;
pub mod manifest;
pub mod reflect;
pub mod registry;
pub mod schema;

pub use dynamic::DynamicFunction;
pub use error::{CallError, RegistrationError, TransportError, ValidationError, ValidationIssue};
pub use handler::{catch_panic, CallArgs, CallContext, Output, ServableFunction};
pub use manifest::{FunctionDecl, Injection, OutputShape, ParamDecl, ReturnDecl, RouteKind};
pub use reflect::{reflect, FieldType, Reflection};
pub use registry::{derive_route_name, Registration, Route, RouteSpec, RouteTable};
