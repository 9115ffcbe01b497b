//! Closure-backed functions with a hand-written declaration.

use crate::auth::Authorizer;
use crate::function::error::CallError;
use crate::function::handler::{CallArgs, CallContext, Output, ServableFunction};
use crate::function::manifest::FunctionDecl;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

type Handler =
    dyn Fn(CallArgs, CallContext) -> BoxFuture<'static, Result<Output, CallError>> + Send + Sync;

/// A servable function assembled at runtime.
///
/// Useful when parameters come from configuration rather than a Rust
/// signature. The declaration goes through the same reflection checks as a
/// macro-generated one, so an untyped parameter still fails registration.
///
/// A declaration marked `blocking` has its handler driven on the worker pool,
/// so the handler may block the thread but should not call
/// [`CallContext::run_blocking`] itself.
#[derive(Clone)]
pub struct DynamicFunction {
    decl: FunctionDecl,
    handler: Arc<Handler>,
    authorizer: Option<Arc<dyn Authorizer>>,
}

impl DynamicFunction {
    pub fn new<F, Fut>(decl: FunctionDecl, handler: F) -> Self
    where
        F: Fn(CallArgs, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Output, CallError>> + Send + 'static,
    {
        Self {
            decl,
            handler: Arc::new(move |args, ctx| Box::pin(handler(args, ctx))),
            authorizer: None,
        }
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }
}

impl fmt::Debug for DynamicFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicFunction")
            .field("decl", &self.decl)
            .field("authorized", &self.authorizer.is_some())
            .finish()
    }
}

#[async_trait]
impl ServableFunction for DynamicFunction {
    fn declaration(&self) -> FunctionDecl {
        self.decl.clone()
    }

    fn authorizer(&self) -> Option<Arc<dyn Authorizer>> {
        self.authorizer.clone()
    }

    async fn call(&self, args: CallArgs, ctx: CallContext) -> Result<Output, CallError> {
        (self.handler)(args, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::manifest::{ParamDecl, ReturnDecl, RouteKind};
    use crate::runtime::WorkerPool;
    use serde_json::json;

    #[tokio::test]
    async fn test_dynamic_function_calls_closure() {
        let decl = FunctionDecl::new("double", RouteKind::Http)
            .param(ParamDecl::typed::<i64>("n"))
            .returns(ReturnDecl::single::<i64>());
        let function = DynamicFunction::new(decl, |mut args, _ctx| async move {
            let n: i64 = args.take("n")?;
            Output::single(n * 2)
        });

        assert_eq!(function.declaration().name, "double");
        assert!(function.authorizer().is_none());

        let mut fields = serde_json::Map::new();
        fields.insert("n".into(), json!(21));
        let args = CallArgs::new(fields, Default::default());
        let ctx = CallContext::new("Double", "req-1", WorkerPool::new(1));
        let output = function.call(args, ctx).await.unwrap();
        assert_eq!(output.collect().await.unwrap(), json!(42));
    }
}
