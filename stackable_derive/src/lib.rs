//! Derive macro for the `Stackable` trait.
//!
//! Deriving `Stackable` on a struct with named fields batches a `Vec` of
//! samples field by field: every field is collected into its own `Vec` and
//! stacked with that field type's `Stackable` implementation.
//!
//! ```ignore
//! use finetune_ml::dataset::Stackable;
//! use finetune_ml::ml::Tensor;
//!
//! #[derive(Stackable)]
//! pub struct Sample {
//!     image: Tensor,
//!     label: Tensor,
//! }
//! ```
//!
//! The generated code names the trait unqualified, so `Stackable` must be in
//! scope where the derive is used.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{parse_macro_input, Data, DataStruct, DeriveInput, Fields};

#[proc_macro_derive(Stackable)]
pub fn derive_stackable(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    let expanded = match &input.data {
        Data::Struct(data) => derive_struct(&input, data),
        _ => Err(syn::Error::new_spanned(
            &input.ident,
            "Stackable can only be derived for structs",
        )),
    };

    expanded
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

fn derive_struct(input: &DeriveInput, data: &DataStruct) -> syn::Result<TokenStream2> {
    let name = &input.ident;
    let fields = match &data.fields {
        Fields::Named(f) => &f.named,
        other => {
            return Err(syn::Error::new_spanned(
                other,
                "Stackable needs a struct with named fields",
            ))
        }
    };
    if fields.is_empty() {
        return Err(syn::Error::new_spanned(name, "Stackable needs at least one field"));
    }

    let field_names: Vec<_> = fields.iter().filter_map(|f| f.ident.as_ref()).collect();
    let field_types: Vec<_> = fields.iter().map(|f| &f.ty).collect();

    // prefixed so they cannot shadow user field names
    let columns: Vec<_> = field_names
        .iter()
        .map(|f| format_ident!("__column_{}", f))
        .collect();

    Ok(quote! {
        impl Stackable for #name
        where
            #( #field_types: Stackable<Output = #field_types> ),*
        {
            type Output = Self;

            fn stack(batch: Vec<Self>) -> Self::Output {
                let __len = batch.len();
                #( let mut #columns = Vec::with_capacity(__len); )*

                for item in batch {
                    #( #columns.push(item.#field_names); )*
                }

                #name {
                    #( #field_names: <#field_types as Stackable>::stack(#columns) ),*
                }
            }
        }
    })
}
