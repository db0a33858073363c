use proc_macro2::Ident;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::punctuated::Punctuated;
use syn::{braced, Result, Token};

pub struct CodedIndex {
    name: Ident,
    tables: Punctuated<Ident, Token![,]>,
}

impl Parse for CodedIndex {
    fn parse(input: ParseStream) -> Result<Self> {
        let name = input.parse()?;
        input.parse::<Token![,]>()?;
        let tables;
        braced!(tables in input);
        Ok(CodedIndex {
            name,
            tables: tables.parse_terminated(Ident::parse)?,
        })
    }
}

pub fn coded_index(CodedIndex { name, tables }: CodedIndex) -> proc_macro2::TokenStream {
    let variants: Vec<_> = tables.iter().filter(|&n| n != "Unused").collect();

    // "log n" rounded up, so that every tag fits
    let log = (tables.len() as f32).log2().ceil() as u32;

    let decode_arms = tables.iter().enumerate().filter_map(|(tag, n)| {
        if n == "Unused" {
            None
        } else {
            let tag = tag as u32;
            Some(quote! { #tag => #name::#n(index) })
        }
    });

    let encode_arms = tables.iter().enumerate().filter_map(|(tag, n)| {
        if n == "Unused" {
            None
        } else {
            let tag = tag as u32;
            Some(quote! { #name::#n(i) => (*i, #tag) })
        }
    });

    let kind_arms = variants.iter().map(|n| quote! { #name::#n(_) => Some(Kind::#n) });

    quote! {
        #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
        pub enum #name {
            #(#variants(usize),)*
            Null
        }

        impl #name {
            pub const TAG_BITS: u32 = #log;

            pub const TABLES: &'static [Kind] = &[#(Kind::#variants),*];

            pub fn is_null(&self) -> bool {
                *self == #name::Null
            }

            pub fn kind(&self) -> Option<Kind> {
                match self {
                    #(#kind_arms,)*
                    #name::Null => None
                }
            }

            pub fn row(&self) -> usize {
                self.build_indices().0
            }

            fn build_indices(&self) -> (usize, u32) {
                match self {
                    #(#encode_arms,)*
                    #name::Null => (0, 0)
                }
            }

            pub fn encode(&self) -> Result<u32, scroll::Error> {
                let (index, tag) = self.build_indices();
                if index >= (1_usize << (32 - #log)) {
                    return Err(scroll::Error::Custom(format!(
                        "row {} does not fit in a {} coded index",
                        index,
                        stringify!(#name)
                    )));
                }
                Ok(((index as u32) << #log) | tag)
            }

            pub fn decode(coded: u32) -> Result<Self, scroll::Error> {
                if coded == 0 {
                    return Ok(#name::Null);
                }

                let mask = (1_u32 << #log) - 1;
                let index = (coded >> #log) as usize;

                Ok(match coded & mask {
                    #(#decode_arms,)*
                    bad_tag => return Err(scroll::Error::Custom(format!(
                        "bad {} coded index tag {}",
                        stringify!(#name),
                        bad_tag
                    )))
                })
            }

            // ECMA-335, II.24.2.6 (page 274)
            pub fn is_wide(sizes: &Sizes) -> bool {
                Self::TABLES
                    .iter()
                    .any(|&k| sizes.rows(k) >= (1_u32 << (16 - #log)))
            }
        }

        impl<'a> TryIntoCtx<Sizes<'a>> for #name {
            type Error = scroll::Error;

            fn try_into_ctx(self, into: &mut [u8], sizes: Sizes<'a>) -> Result<usize, Self::Error> {
                let offset = &mut 0;

                let coded = self.encode()?;

                if #name::is_wide(&sizes) {
                    into.gwrite_with(coded, offset, scroll::LE)?;
                } else {
                    into.gwrite_with(coded as u16, offset, scroll::LE)?;
                }

                Ok(*offset)
            }
        }

        impl PartialOrd for #name {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }
        impl Ord for #name {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                let (l_index, l_tag) = self.build_indices();
                let (r_index, r_tag) = other.build_indices();
                (l_index, l_tag).cmp(&(r_index, r_tag))
            }
        }
    }
}
