use proc_macro::TokenStream;
use syn::{parse_macro_input, DeriveInput};

mod coded;
mod from;

/// Declares a coded index over an ordered list of tables (ECMA-335, II.24.2.6).
///
/// `Unused` entries reserve a tag value without producing a variant.
#[proc_macro]
pub fn coded_index(input: TokenStream) -> TokenStream {
    coded::coded_index(parse_macro_input!(input)).into()
}

#[proc_macro_derive(From)]
pub fn derive_from(input: TokenStream) -> TokenStream {
    from::derive_from(parse_macro_input!(input as DeriveInput)).into()
}
