//! Procedural macros for servegate.
//!
//! This crate provides the `#[servable]` attribute macro, which turns an
//! ordinary function into a route the gateway can mount.
//!
//! # Example
//!
//! ```ignore
//! use servegate::prelude::*;
//!
//! #[servable]
//! fn sync_http(interval: u64) -> String {
//!     std::thread::sleep(std::time::Duration::from_secs(interval));
//!     "Hello, world!".to_string()
//! }
//!
//! #[servable(websocket)]
//! async fn chat(prompt: String, sender: StreamSender) -> Result<String, TransportError> {
//!     sender.send("thinking").await?;
//!     Ok(format!("you said {}", prompt))
//! }
//! ```

use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{
    parse_macro_input, punctuated::Punctuated, Attribute, Expr, ExprLit, FnArg, GenericArgument,
    Ident, ItemFn, Lit, Meta, Pat, Path, PathArguments, ReturnType, Token, Type,
    TypeParamBound,
};

/// Attributes for the `#[servable]` macro.
#[derive(Default)]
struct ServableAttrs {
    /// Mount as a WebSocket route instead of `POST`.
    websocket: bool,
    /// Keep the socket open after each call.
    multi_turn: bool,
    /// Authorizer function, `async fn(String) -> Option<AuthContext>`.
    auth: Option<Path>,
}

impl ServableAttrs {
    fn parse_meta_list(metas: Punctuated<Meta, Token![,]>) -> syn::Result<Self> {
        let mut attrs = ServableAttrs::default();

        for meta in metas {
            match &meta {
                Meta::Path(path) if path.is_ident("websocket") => attrs.websocket = true,
                Meta::Path(path) if path.is_ident("multi_turn") => attrs.multi_turn = true,
                Meta::NameValue(nv) if nv.path.is_ident("auth") => match &nv.value {
                    Expr::Path(expr) => attrs.auth = Some(expr.path.clone()),
                    other => {
                        return Err(syn::Error::new_spanned(
                            other,
                            "expected the path of an authorizer function",
                        ))
                    }
                },
                _ => {
                    return Err(syn::Error::new_spanned(
                        meta,
                        "unknown attribute, expected `websocket`, `multi_turn` or `auth = path`",
                    ))
                }
            }
        }

        if attrs.multi_turn && !attrs.websocket {
            return Err(syn::Error::new(
                proc_macro2::Span::call_site(),
                "`multi_turn` requires `websocket`",
            ));
        }

        Ok(attrs)
    }
}

/// How a parameter gets its value.
enum ParamKind {
    Field,
    File,
    OptionalFile,
    Auth,
    OptionalAuth,
    StreamSender,
    Connection,
    Context,
}

struct Param {
    ident: Ident,
    ty: Type,
    kind: ParamKind,
    default: Option<Expr>,
}

/// What the function hands back.
enum ReturnShape {
    Unit,
    Single(Type),
    Iter(Type),
    Stream(Type),
}

/// Turn a function into a servable route.
///
/// Generates a `{Name}Function` unit struct implementing
/// `servegate::ServableFunction`; the function itself is left in place and
/// can still be called directly.
///
/// # Attributes
///
/// - `websocket`: mount as a WebSocket route (`GET /<name>`)
/// - `multi_turn`: with `websocket`, keep the socket open between calls
/// - `auth = path`: require a bearer token checked by `path`
///
/// # Parameters
///
/// Parameters are read from the request payload by name and must implement
/// `Deserialize` and `servegate::FieldType`. `#[default(expr)]` makes one
/// optional. `AuthContext`, `Option<AuthContext>`, `StreamSender`,
/// `Connection` and `CallContext` are injected instead, and `UploadFile` /
/// `Option<UploadFile>` come from multipart parts.
///
/// # Return values
///
/// `T`, `Result<T, E>`, `impl Iterator<Item = T>` and `impl Stream<Item = T>`
/// (the latter two optionally inside a `Result`). Synchronous functions run on
/// the gateway's worker pool.
#[proc_macro_attribute]
pub fn servable(args: TokenStream, input: TokenStream) -> TokenStream {
    let args = parse_macro_input!(args with Punctuated::<Meta, Token![,]>::parse_terminated);
    let input_fn = parse_macro_input!(input as ItemFn);

    match generate_servable(args, input_fn) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn generate_servable(
    args: Punctuated<Meta, Token![,]>,
    mut input_fn: ItemFn,
) -> syn::Result<proc_macro2::TokenStream> {
    let attrs = ServableAttrs::parse_meta_list(args)?;

    let sig = &input_fn.sig;
    if !sig.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(
            &sig.generics,
            "servable functions cannot be generic",
        ));
    }
    if let Some(variadic) = &sig.variadic {
        return Err(syn::Error::new_spanned(variadic, "variadic functions are not supported"));
    }

    let mut params = Vec::new();
    for arg in input_fn.sig.inputs.iter_mut() {
        let pat_type = match arg {
            FnArg::Typed(pat_type) => pat_type,
            FnArg::Receiver(receiver) => {
                return Err(syn::Error::new_spanned(
                    receiver,
                    "servable functions cannot take `self`",
                ))
            }
        };
        let ident = match pat_type.pat.as_ref() {
            Pat::Ident(pat) if pat.by_ref.is_none() && pat.subpat.is_none() => pat.ident.clone(),
            other => {
                return Err(syn::Error::new_spanned(
                    other,
                    "parameters must be plain identifiers",
                ))
            }
        };
        let default = take_default(&mut pat_type.attrs)?;
        let ty = (*pat_type.ty).clone();
        let kind = classify_param(&ty)?;
        if default.is_some() && !matches!(kind, ParamKind::Field) {
            return Err(syn::Error::new_spanned(
                &ty,
                "`#[default]` only applies to payload fields",
            ));
        }
        params.push(Param {
            ident,
            ty,
            kind,
            default,
        });
    }

    let fn_name = &input_fn.sig.ident;
    let fn_name_str = fn_name.to_string();
    let struct_name = format_ident!("{}Function", to_pascal_case(&fn_name_str));
    let fn_vis = &input_fn.vis;
    let is_async = input_fn.sig.asyncness.is_some();
    let doc = doc_string(&input_fn.attrs);

    let (fallible, shape) = classify_return(&input_fn.sig.output)?;
    let blocking = !is_async && !matches!(shape, ReturnShape::Stream(_));

    let kind = if attrs.websocket {
        quote!(::servegate::RouteKind::Stream)
    } else {
        quote!(::servegate::RouteKind::Http)
    };
    let multi_turn = attrs.multi_turn;

    let decl_params = params.iter().map(param_decl);
    let extracts = params.iter().map(param_extract);
    let idents: Vec<_> = params.iter().map(|p| &p.ident).collect();

    let returns = match &shape {
        ReturnShape::Unit => quote!(::servegate::ReturnDecl::unannotated()),
        ReturnShape::Single(ty) => quote!(::servegate::ReturnDecl::single::<#ty>()),
        ReturnShape::Iter(ty) | ReturnShape::Stream(ty) => {
            quote!(::servegate::ReturnDecl::stream::<#ty>())
        }
    };

    let invoke = quote!(#fn_name(#(#idents),*));
    let check = if fallible {
        quote!(let __servegate_value = __servegate_value.map_err(::servegate::CallError::execution)?;)
    } else {
        quote!()
    };
    let body = match (&shape, is_async) {
        (ReturnShape::Iter(_), false) => {
            let produce = if fallible {
                invoke.clone()
            } else {
                quote!(::std::result::Result::<_, ::std::convert::Infallible>::Ok(#invoke))
            };
            quote! {
                ::std::result::Result::Ok(__servegate_ctx.run_blocking_iter(move || #produce))
            }
        }
        (_, _) => {
            let value = if blocking {
                quote!(__servegate_ctx.run_blocking(move || #invoke).await?)
            } else if is_async {
                quote!(#invoke.await)
            } else {
                invoke.clone()
            };
            let output = match &shape {
                ReturnShape::Unit => quote! {
                    let _ = __servegate_value;
                    ::std::result::Result::Ok(::servegate::Output::unit())
                },
                ReturnShape::Single(_) => quote!(::servegate::Output::single(__servegate_value)),
                ReturnShape::Iter(_) => quote! {
                    ::std::result::Result::Ok(::servegate::Output::stream(
                        ::servegate::__private::futures::stream::iter(__servegate_value),
                    ))
                },
                ReturnShape::Stream(_) => quote! {
                    ::std::result::Result::Ok(::servegate::Output::stream(__servegate_value))
                },
            };
            quote! {
                let __servegate_value = #value;
                #check
                #output
            }
        }
    };

    let authorizer = attrs.auth.as_ref().map(|path| {
        quote! {
            fn authorizer(&self) -> ::std::option::Option<::std::sync::Arc<dyn ::servegate::Authorizer>> {
                ::std::option::Option::Some(::servegate::auth::from_fn(#path))
            }
        }
    });

    let struct_doc = format!("Servable route for [`{}`].", fn_name_str);

    let expanded = quote! {
        #input_fn

        #[doc = #struct_doc]
        #[derive(Debug, Default, Clone, Copy)]
        #fn_vis struct #struct_name;

        impl #struct_name {
            /// Create a new instance of the function.
            pub fn new() -> Self {
                Self
            }
        }

        #[::servegate::__private::async_trait]
        impl ::servegate::ServableFunction for #struct_name {
            fn declaration(&self) -> ::servegate::FunctionDecl {
                ::servegate::FunctionDecl::new(#fn_name_str, #kind)
                    .doc(#doc)
                    .blocking(#blocking)
                    .multi_turn(#multi_turn)
                    #(.param(#decl_params))*
                    .returns(#returns)
            }

            #authorizer

            fn offloads_blocking(&self) -> bool {
                true
            }

            #[allow(unused_mut, unused_variables)]
            async fn call(
                &self,
                mut __servegate_args: ::servegate::CallArgs,
                __servegate_ctx: ::servegate::CallContext,
            ) -> ::std::result::Result<::servegate::Output, ::servegate::CallError> {
                #(#extracts)*
                #body
            }
        }
    };

    Ok(expanded)
}

/// Remove `#[default(expr)]` from a parameter and return the expression.
fn take_default(attrs: &mut Vec<Attribute>) -> syn::Result<Option<Expr>> {
    let mut default = None;
    let mut kept = Vec::with_capacity(attrs.len());
    for attr in attrs.drain(..) {
        if attr.path().is_ident("default") {
            default = Some(attr.parse_args::<Expr>()?);
        } else {
            kept.push(attr);
        }
    }
    *attrs = kept;
    Ok(default)
}

fn classify_param(ty: &Type) -> syn::Result<ParamKind> {
    match ty {
        Type::Reference(_) => {
            return Err(syn::Error::new_spanned(
                ty,
                "parameters must be owned types, not references",
            ))
        }
        Type::ImplTrait(_) => {
            return Err(syn::Error::new_spanned(ty, "`impl Trait` parameters are not supported"))
        }
        _ => {}
    }

    let Some(name) = last_segment(ty) else {
        return Ok(ParamKind::Field);
    };
    let kind = match name.as_str() {
        "AuthContext" => ParamKind::Auth,
        "StreamSender" => ParamKind::StreamSender,
        "Connection" => ParamKind::Connection,
        "CallContext" => ParamKind::Context,
        "UploadFile" => ParamKind::File,
        "Option" => match first_generic(ty).and_then(last_segment).as_deref() {
            Some("AuthContext") => ParamKind::OptionalAuth,
            Some("UploadFile") => ParamKind::OptionalFile,
            _ => ParamKind::Field,
        },
        _ => ParamKind::Field,
    };
    Ok(kind)
}

fn param_decl(param: &Param) -> proc_macro2::TokenStream {
    let name = param.ident.to_string();
    let ty = &param.ty;
    let injected = |injection: proc_macro2::TokenStream| {
        quote!(::servegate::ParamDecl::injected(#name, ::servegate::Injection::#injection))
    };
    match param.kind {
        ParamKind::Field | ParamKind::File | ParamKind::OptionalFile => match &param.default {
            Some(default) => {
                quote!(::servegate::ParamDecl::typed::<#ty>(#name).with_default(#default))
            }
            None => quote!(::servegate::ParamDecl::typed::<#ty>(#name)),
        },
        ParamKind::Auth => injected(quote!(Auth)),
        ParamKind::OptionalAuth => injected(quote!(OptionalAuth)),
        ParamKind::StreamSender => injected(quote!(StreamSender)),
        ParamKind::Connection => injected(quote!(Connection)),
        ParamKind::Context => quote!(::servegate::ParamDecl::context(#name)),
    }
}

fn param_extract(param: &Param) -> proc_macro2::TokenStream {
    let ident = &param.ident;
    let name = ident.to_string();
    let ty = &param.ty;
    let value = match param.kind {
        ParamKind::Field => quote!(__servegate_args.take::<#ty>(#name)?),
        ParamKind::File => quote!(__servegate_args.take_file(#name)?),
        ParamKind::OptionalFile => quote!(__servegate_args.take_optional_file(#name)),
        ParamKind::Auth => quote!(__servegate_ctx.auth_context()?),
        ParamKind::OptionalAuth => quote!(__servegate_ctx.auth().cloned()),
        ParamKind::StreamSender => quote!(__servegate_ctx.stream_sender()?),
        ParamKind::Connection => quote!(__servegate_ctx.connection()?),
        ParamKind::Context => quote!(__servegate_ctx.clone()),
    };
    quote!(let #ident: #ty = #value;)
}

/// Split the return type into (fallible, shape).
fn classify_return(output: &ReturnType) -> syn::Result<(bool, ReturnShape)> {
    let ty = match output {
        ReturnType::Default => return Ok((false, ReturnShape::Unit)),
        ReturnType::Type(_, ty) => ty.as_ref(),
    };
    if last_segment(ty).as_deref() == Some("Result") {
        let inner = first_generic(ty)
            .ok_or_else(|| syn::Error::new_spanned(ty, "expected `Result<T, E>`"))?;
        return Ok((true, classify_value(inner)));
    }
    Ok((false, classify_value(ty)))
}

fn classify_value(ty: &Type) -> ReturnShape {
    match ty {
        Type::Tuple(tuple) if tuple.elems.is_empty() => ReturnShape::Unit,
        Type::ImplTrait(impl_trait) => {
            for bound in &impl_trait.bounds {
                let TypeParamBound::Trait(bound) = bound else {
                    continue;
                };
                let Some(segment) = bound.path.segments.last() else {
                    continue;
                };
                let Some(item) = item_type(&segment.arguments) else {
                    continue;
                };
                if segment.ident == "Iterator" {
                    return ReturnShape::Iter(item);
                }
                if segment.ident == "Stream" {
                    return ReturnShape::Stream(item);
                }
            }
            ReturnShape::Single(ty.clone())
        }
        _ => ReturnShape::Single(ty.clone()),
    }
}

fn item_type(arguments: &PathArguments) -> Option<Type> {
    let PathArguments::AngleBracketed(args) = arguments else {
        return None;
    };
    args.args.iter().find_map(|arg| match arg {
        GenericArgument::AssocType(assoc) if assoc.ident == "Item" => Some(assoc.ty.clone()),
        _ => None,
    })
}

fn last_segment(ty: &Type) -> Option<String> {
    match ty {
        Type::Path(path) => path.path.segments.last().map(|s| s.ident.to_string()),
        Type::Group(group) => last_segment(&group.elem),
        Type::Paren(paren) => last_segment(&paren.elem),
        _ => None,
    }
}

fn first_generic(ty: &Type) -> Option<&Type> {
    let Type::Path(path) = ty else {
        return None;
    };
    let PathArguments::AngleBracketed(args) = &path.path.segments.last()?.arguments else {
        return None;
    };
    args.args.iter().find_map(|arg| match arg {
        GenericArgument::Type(ty) => Some(ty),
        _ => None,
    })
}

/// Collect `///` doc lines into one string.
fn doc_string(attrs: &[Attribute]) -> String {
    attrs
        .iter()
        .filter(|attr| attr.path().is_ident("doc"))
        .filter_map(|attr| match &attr.meta {
            Meta::NameValue(nv) => match &nv.value {
                Expr::Lit(ExprLit {
                    lit: Lit::Str(s), ..
                }) => Some(s.value().trim().to_string()),
                _ => None,
            },
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Convert a snake_case string to PascalCase.
fn to_pascal_case(s: &str) -> String {
    s.split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                None => String::new(),
                Some(first) => first.to_uppercase().chain(chars).collect(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use syn::parse_quote;

    #[test]
    fn test_to_pascal_case() {
        assert_eq!(to_pascal_case("sync_http"), "SyncHttp");
        assert_eq!(to_pascal_case("chat"), "Chat");
        assert_eq!(to_pascal_case("foo__bar"), "FooBar");
    }

    #[test]
    fn test_classify_return() {
        let (fallible, shape) = classify_return(&parse_quote!(-> Result<String, MyError>)).unwrap();
        assert!(fallible);
        assert!(matches!(shape, ReturnShape::Single(_)));

        let (fallible, shape) =
            classify_return(&parse_quote!(-> impl Iterator<Item = u32> + Send)).unwrap();
        assert!(!fallible);
        assert!(matches!(shape, ReturnShape::Iter(_)));

        let (_, shape) = classify_return(&parse_quote!(-> impl futures::Stream<Item = u32>)).unwrap();
        assert!(matches!(shape, ReturnShape::Stream(_)));

        let (_, shape) = classify_return(&ReturnType::Default).unwrap();
        assert!(matches!(shape, ReturnShape::Unit));
    }

    #[test]
    fn test_classify_param() {
        assert!(matches!(classify_param(&parse_quote!(u64)).unwrap(), ParamKind::Field));
        assert!(matches!(
            classify_param(&parse_quote!(servegate::AuthContext)).unwrap(),
            ParamKind::Auth
        ));
        assert!(matches!(
            classify_param(&parse_quote!(Option<AuthContext>)).unwrap(),
            ParamKind::OptionalAuth
        ));
        assert!(matches!(
            classify_param(&parse_quote!(Option<UploadFile>)).unwrap(),
            ParamKind::OptionalFile
        ));
        assert!(classify_param(&parse_quote!(&str)).is_err());
    }

    #[test]
    fn test_attrs() {
        let metas: Punctuated<Meta, Token![,]> = parse_quote!(websocket, multi_turn, auth = check);
        let attrs = ServableAttrs::parse_meta_list(metas).unwrap();
        assert!(attrs.websocket && attrs.multi_turn);
        assert!(attrs.auth.is_some());

        let metas: Punctuated<Meta, Token![,]> = parse_quote!(multi_turn);
        assert!(ServableAttrs::parse_meta_list(metas).is_err());
    }

    #[test]
    fn test_generics_rejected() {
        let item: ItemFn = parse_quote! {
            fn generic<T>(value: T) -> T { value }
        };
        assert!(generate_servable(Punctuated::new(), item).is_err());
    }
}
