/*
 * Copyright (c) 2024. Govcraft
 *
 * Licensed under either of
 *   * Apache License, Version 2.0 (the "License");
 *     you may not use this file except in compliance with the License.
 *     You may obtain a copy of the License at http://www.apache.org/licenses/LICENSE-2.0
 *   * MIT license: http://opensource.org/licenses/MIT
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the applicable License for the specific language governing permissions and
 * limitations under that License.
 */
#![forbid(unsafe_code)]

//! Myelin Macro Library
//!
//! This library provides procedural macros for the Myelin messaging layer.
//! It includes a macro to derive the traits a type needs before it can travel
//! between model processes as a message payload.
//!
//! # Payload Macro
//!
//! The [`myelin_payload`] macro prepares a type for use as a message payload:
//!
//! ```ignore
//! #[myelin_payload]
//! pub struct Reading {
//!     pub station: String,
//!     pub celsius: f64,
//! }
//! ```

use proc_macro::TokenStream;

use quote::quote;
use syn::{parse_macro_input, DeriveInput};

fn has_derive(input: &DeriveInput, trait_name: &str) -> bool {
    input.attrs.iter().any(|attr| {
        if attr.path().is_ident("derive") {
            let mut found = false;
            let _ = attr.parse_nested_meta(|meta| {
                if meta.path.is_ident(trait_name) {
                    found = true;
                }
                Ok(())
            });
            found
        } else {
            false
        }
    })
}

/// A procedural macro to derive the necessary traits for a Myelin payload.
///
/// Payloads always cross a serialization boundary, even on the in-process
/// transport, so the macro unconditionally derives `serde::Serialize` and
/// `serde::Deserialize` along with `Clone` and `Debug`. It also emits a
/// compile-time assertion that the type is `Send + Sync + 'static`, so an
/// invalid payload type fails where it is declared rather than where it first
/// crosses a task boundary.
///
/// # Usage
///
/// ```ignore
/// use myelin_macro::myelin_payload;
///
/// #[myelin_payload]
/// pub struct Reading {
///     pub station: String,
///     pub celsius: f64,
/// }
/// ```
///
/// This expands to:
/// - `#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]`
///   (only the traits not already present)
/// - A compile-time assertion that the type is `Send + Sync + 'static`
///
/// **Note:** the derives reference `serde::Serialize` and
/// `serde::Deserialize` by path, so `serde` must be a dependency of the crate
/// declaring the payload.
#[proc_macro_attribute]
pub fn myelin_payload(_attr: TokenStream, item: TokenStream) -> TokenStream {
    // Parse the input tokens into a syntax tree.
    let input = parse_macro_input!(item as DeriveInput);

    // Get the name and generics of the type.
    let name = &input.ident;
    let generics = &input.generics;
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    // Determine which traits need to be derived
    let need_clone = !has_derive(&input, "Clone");
    let need_debug = !has_derive(&input, "Debug");
    let need_ser = !has_derive(&input, "Serialize");
    let need_de = !has_derive(&input, "Deserialize");

    // Build the list of traits to derive
    let derives = {
        let mut traits = Vec::new();
        if need_clone {
            traits.push(quote!(Clone));
        }
        if need_debug {
            traits.push(quote!(Debug));
        }
        if need_ser {
            traits.push(quote!(serde::Serialize));
        }
        if need_de {
            traits.push(quote!(serde::Deserialize));
        }
        if traits.is_empty() {
            quote!()
        } else {
            quote!(#[derive(#(#traits),*)])
        }
    };

    // Generate a unique identifier for the static assertion to avoid conflicts
    let assert_ident = quote::format_ident!("_AssertMyelinPayload_{}", name);

    let expanded = quote! {
        #derives
        #input

        // Compile-time assertion that the payload type satisfies Send + Sync + 'static.
        // This catches invalid payload types early with clear error messages.
        #[doc(hidden)]
        #[allow(dead_code, non_camel_case_types, non_snake_case, clippy::needless_lifetimes)]
        const _: () = {
            fn #assert_ident #impl_generics () #where_clause {
                fn assert_bounds<T: Send + Sync + 'static>() {}
                assert_bounds::<#name #ty_generics>();
            }
        };
    };

    // Return the generated tokens.
    TokenStream::from(expanded)
}
