use proc_macro2::TokenStream;
use quote::quote;
use syn::parse::Parser;
use syn::punctuated::Punctuated;
use syn::{Error, Expr, ItemFn, Lit, Meta, ReturnType, Token, Type};

/// Arguments accepted by `#[qhub_runtime::main(...)]`.
#[derive(Default)]
struct MainArgs {
    profile: Option<TokenStream>,
    overrides: Vec<TokenStream>,
}

/// Expands the `#[qhub_runtime::main]` attribute macro.
#[must_use]
pub fn expand_main(args: TokenStream, input: ItemFn) -> TokenStream {
    if input.sig.asyncness.is_none() {
        return Error::new_spanned(
            &input.sig.ident,
            "#[qhub_runtime::main] can only be used on async functions",
        )
        .to_compile_error();
    }

    if !returns_result(&input.sig.output) {
        return Error::new_spanned(
            &input.sig.output,
            "#[qhub_runtime::main] requires a Result return type",
        )
        .to_compile_error();
    }

    let args = match parse_args(args) {
        Ok(args) => args,
        Err(err) => return err.to_compile_error(),
    };

    let name = &input.sig.ident;
    let body = &input.block;
    let vis = &input.vis;
    let attrs = &input.attrs;
    let output = &input.sig.output;
    let profile = args.profile.unwrap_or_else(|| quote! { ::qhub_runtime::RuntimeConfig::default() });
    let overrides = &args.overrides;

    quote! {
        #(#attrs)*
        #vis fn #name() #output {
            let config = #profile #(#overrides)*;
            let rt = ::qhub_runtime::build_runtime_with_config(&config)?;
            rt.block_on(async { #body })
        }
    }
}

/// Parses `profile`, `worker_threads = N` and `thread_name = "..."` in any order.
fn parse_args(args: TokenStream) -> syn::Result<MainArgs> {
    let mut parsed = MainArgs::default();
    if args.is_empty() {
        return Ok(parsed);
    }

    let metas = Punctuated::<Meta, Token![,]>::parse_terminated.parse2(args)?;
    for meta in metas {
        match meta {
            Meta::Path(path) => {
                let Some(ident) = path.get_ident() else {
                    return Err(Error::new_spanned(path, "expected a runtime profile name"));
                };
                if parsed.profile.is_some() {
                    return Err(Error::new_spanned(ident, "runtime profile specified twice"));
                }
                parsed.profile = Some(match ident.to_string().as_str() {
                    "high_performance" => {
                        quote! { ::qhub_runtime::RuntimeConfig::high_performance() }
                    },
                    "memory_efficient" => {
                        quote! { ::qhub_runtime::RuntimeConfig::memory_efficient() }
                    },
                    "default" => quote! { ::qhub_runtime::RuntimeConfig::default() },
                    _ => {
                        return Err(Error::new_spanned(
                            ident,
                            "unknown runtime profile; use high_performance, memory_efficient or default",
                        ));
                    },
                });
            },
            Meta::NameValue(nv) if nv.path.is_ident("worker_threads") => {
                let Expr::Lit(lit) = &nv.value else {
                    return Err(Error::new_spanned(&nv.value, "worker_threads expects an integer"));
                };
                let Lit::Int(threads) = &lit.lit else {
                    return Err(Error::new_spanned(&nv.value, "worker_threads expects an integer"));
                };
                parsed.overrides.push(quote! { .with_worker_threads(#threads) });
            },
            Meta::NameValue(nv) if nv.path.is_ident("thread_name") => {
                let Expr::Lit(lit) = &nv.value else {
                    return Err(Error::new_spanned(&nv.value, "thread_name expects a string"));
                };
                let Lit::Str(name) = &lit.lit else {
                    return Err(Error::new_spanned(&nv.value, "thread_name expects a string"));
                };
                parsed.overrides.push(quote! { .with_thread_name(#name) });
            },
            other => return Err(Error::new_spanned(other, "unsupported runtime argument")),
        }
    }

    Ok(parsed)
}

fn returns_result(output: &ReturnType) -> bool {
    let ReturnType::Type(_, ty) = output else {
        return false;
    };
    let Type::Path(path) = &**ty else {
        return false;
    };
    path.path.segments.last().is_some_and(|seg| seg.ident == "Result")
}
