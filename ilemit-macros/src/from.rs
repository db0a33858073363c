use proc_macro2::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Fields};

// one From impl per single-field tuple variant
pub fn derive_from(input: DeriveInput) -> TokenStream {
    let type_name = input.ident;
    let variants = match input.data {
        Data::Enum(e) => e.variants,
        _ => panic!("derive(From) is only valid for enums"),
    };
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let impls = variants.iter().filter_map(|v| {
        let name = &v.ident;
        let field = match &v.fields {
            Fields::Unnamed(f) if f.unnamed.len() == 1 => &f.unnamed.first()?.ty,
            _ => return None,
        };
        Some(quote! {
            impl #impl_generics From<#field> for #type_name #ty_generics #where_clause {
                fn from(f: #field) -> Self {
                    Self::#name(f)
                }
            }
        })
    });

    quote! { #(#impls)* }
}
