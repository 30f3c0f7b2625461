//! Attribute macros that give tests a hard wall-clock limit.
//!
//! A test that waits on a socket that never answers would otherwise hang the
//! whole suite. Both attributes move the test body onto a watchdog thread and
//! fail the test if it does not report back in time.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{Attribute, ItemFn, LitInt};

const DEFAULT_LIMIT_SECS: u64 = 45;

/// Runs an async test under a current-thread Tokio runtime with a time limit.
///
/// Takes an optional limit in seconds: `#[tokio_timeout_test(10)]`. Replaces
/// `#[tokio::test]`; do not stack the two.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let limit = match parse_limit(attr) {
        Ok(limit) => limit,
        Err(err) => return err,
    };
    let mut function = match syn::parse::<ItemFn>(item) {
        Ok(function) => function,
        Err(err) => return err.to_compile_error().into(),
    };
    if function.sig.asyncness.take().is_none() {
        return syn::Error::new_spanned(
            &function.sig.ident,
            "tokio_timeout_test requires an async fn",
        )
        .to_compile_error()
        .into();
    }
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = function;
    let attrs = strip_runner_attrs(attrs);
    let work = quote! {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build test runtime");
        runtime.block_on(async {
            tokio::time::timeout(__limit, async move #block)
                .await
                .expect("test exceeded its time limit");
        });
    };
    let body = watchdog(limit, work);
    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #body
        }
    })
}

/// Runs a synchronous test on a watchdog thread with a time limit.
///
/// Takes an optional limit in seconds: `#[timeout(5)]`. Async tests belong
/// under [`macro@tokio_timeout_test`] instead.
#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let limit = match parse_limit(attr) {
        Ok(limit) => limit,
        Err(err) => return err,
    };
    let function = match syn::parse::<ItemFn>(item) {
        Ok(function) => function,
        Err(err) => return err.to_compile_error().into(),
    };
    if function.sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &function.sig.ident,
            "timeout expects a synchronous fn; async tests take tokio_timeout_test",
        )
        .to_compile_error()
        .into();
    }
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = function;
    let attrs = strip_runner_attrs(attrs);
    let body = watchdog(limit, quote! { #block });
    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #body
        }
    })
}

/// Generates the channel-and-thread skeleton shared by both attributes. The
/// worker runs `work` under `catch_unwind` so assertion failures surface as
/// ordinary test panics rather than a poisoned channel.
fn watchdog(limit: u64, work: TokenStream2) -> TokenStream2 {
    quote! {
        let __limit = std::time::Duration::from_secs(#limit);
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| { #work }));
            let _ = done_tx.send(outcome);
        });
        match done_rx.recv_timeout(__limit) {
            Ok(Ok(_)) => {}
            Ok(Err(panic)) => std::panic::resume_unwind(panic),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                panic!("test exceeded its {}s time limit", #limit)
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test worker exited without reporting an outcome")
            }
        }
    }
}

fn parse_limit(attr: TokenStream) -> Result<u64, TokenStream> {
    if attr.is_empty() {
        return Ok(DEFAULT_LIMIT_SECS);
    }
    let lit: LitInt = syn::parse(attr).map_err(|err| TokenStream::from(err.to_compile_error()))?;
    let secs: u64 = lit
        .base10_parse()
        .map_err(|err| TokenStream::from(err.to_compile_error()))?;
    if secs == 0 {
        return Err(TokenStream::from(
            syn::Error::new_spanned(lit, "time limit must be at least one second")
                .to_compile_error(),
        ));
    }
    Ok(secs)
}

/// Drops `#[test]` and `#[tokio::test]` from the original function so the
/// expansion stays the only runner attribute.
fn strip_runner_attrs(attrs: Vec<Attribute>) -> Vec<Attribute> {
    attrs
        .into_iter()
        .filter(|attr| {
            let path = attr.path();
            !(path.is_ident("test") || path_matches(path, &["tokio", "test"]))
        })
        .collect()
}

fn path_matches(path: &syn::Path, want: &[&str]) -> bool {
    path.segments.len() == want.len()
        && path
            .segments
            .iter()
            .zip(want)
            .all(|(segment, name)| segment.ident == name)
}
