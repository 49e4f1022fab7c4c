//! Test attributes for the kiroframe crate.
//!
//! Both attributes route tracing output through `test_log`, so a failing test prints the
//! spans and events emitted by the dataset engine. The filter defaults to `warn` and can be
//! raised per run with `RUST_LOG`.

use proc_macro::TokenStream;
use quote::quote;
use syn::{ItemFn, parse_macro_input};

#[proc_macro_attribute]
pub fn tokio_test(_attr: TokenStream, item: TokenStream) -> TokenStream {
    with_test_log(item, quote! { #[test_log::test(tokio::test)] })
}

#[proc_macro_attribute]
pub fn test(_attr: TokenStream, item: TokenStream) -> TokenStream {
    with_test_log(item, quote! { #[test_log::test] })
}

fn with_test_log(item: TokenStream, harness: proc_macro2::TokenStream) -> TokenStream {
    let ItemFn { attrs, vis, sig, block } = parse_macro_input!(item as ItemFn);

    let expanded = quote! {
        #harness
        #[test_log(default_log_filter = "warn")]
        #(#attrs)*
        #vis #sig #block
    };

    TokenStream::from(expanded)
}
