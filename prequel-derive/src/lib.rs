//! Derive macro that generates [`Serializable`] implementations for structs
//! and fieldless enums, mirroring the compile-time field walker of the
//! original library: fields are encoded in declaration order, with no
//! padding, and nested field offsets are emitted as `const fn`s so callers
//! can address a single field inside a larger buffer without a full
//! round-trip.
//!
//! [`Serializable`]: https://docs.rs/prequel

use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{parse_macro_input, Data, DeriveInput, Fields, Index};

/// Derives `Serializable` for a struct (named or tuple fields, all of which
/// must themselves implement `Serializable`) or for a fieldless enum with an
/// explicit `#[repr(...)]` integer representation.
#[proc_macro_derive(Serializable)]
pub fn derive_serializable(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let expanded = match &input.data {
        Data::Struct(data) => derive_struct(&input, data),
        Data::Enum(data) => derive_enum(&input, data),
        Data::Union(_) => {
            syn::Error::new_spanned(&input, "Serializable cannot be derived for unions")
                .to_compile_error()
        }
    };
    expanded.into()
}

fn derive_struct(input: &DeriveInput, data: &syn::DataStruct) -> proc_macro2::TokenStream {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    match &data.fields {
        Fields::Named(fields) => {
            let field_idents: Vec<_> = fields.named.iter().map(|f| f.ident.clone().unwrap()).collect();
            let field_types: Vec<_> = fields.named.iter().map(|f| f.ty.clone()).collect();
            let offset_fns = offset_fns(&field_idents, &field_types);

            let size_sum = size_sum(&field_types);
            let serialize_body = field_idents.iter().zip(field_types.iter()).map(|(ident, ty)| {
                quote! {
                    {
                        let __size = <#ty as ::prequel::serialize::Serializable>::SERIALIZED_SIZE;
                        ::prequel::serialize::Serializable::serialize(&self.#ident, &mut buf[__offset..__offset + __size]);
                        __offset += __size;
                    }
                }
            });
            let deserialize_body = field_idents.iter().zip(field_types.iter()).map(|(ident, ty)| {
                quote! {
                    let #ident = {
                        let __size = <#ty as ::prequel::serialize::Serializable>::SERIALIZED_SIZE;
                        let __value = <#ty as ::prequel::serialize::Serializable>::deserialize(&buf[__offset..__offset + __size])?;
                        __offset += __size;
                        __value
                    };
                }
            });

            quote! {
                impl #impl_generics ::prequel::serialize::Serializable for #name #ty_generics #where_clause {
                    const SERIALIZED_SIZE: usize = #size_sum;

                    fn serialize(&self, buf: &mut [u8]) {
                        debug_assert_eq!(buf.len(), <Self as ::prequel::serialize::Serializable>::SERIALIZED_SIZE);
                        #[allow(unused_mut, unused_variables)]
                        let mut __offset: usize = 0;
                        #(#serialize_body)*
                    }

                    fn deserialize(buf: &[u8]) -> ::prequel::error::Result<Self> {
                        debug_assert_eq!(buf.len(), <Self as ::prequel::serialize::Serializable>::SERIALIZED_SIZE);
                        #[allow(unused_mut, unused_variables)]
                        let mut __offset: usize = 0;
                        #(#deserialize_body)*
                        Ok(#name { #(#field_idents),* })
                    }
                }

                #offset_fns
            }
        }
        Fields::Unnamed(fields) => {
            let field_types: Vec<_> = fields.unnamed.iter().map(|f| f.ty.clone()).collect();
            let indices: Vec<Index> = (0..field_types.len()).map(Index::from).collect();
            let size_sum = size_sum(&field_types);
            let binders: Vec<_> = (0..field_types.len())
                .map(|i| format_ident!("__f{}", i))
                .collect();

            let serialize_body = indices.iter().zip(field_types.iter()).map(|(idx, ty)| {
                quote! {
                    {
                        let __size = <#ty as ::prequel::serialize::Serializable>::SERIALIZED_SIZE;
                        ::prequel::serialize::Serializable::serialize(&self.#idx, &mut buf[__offset..__offset + __size]);
                        __offset += __size;
                    }
                }
            });
            let deserialize_body = binders.iter().zip(field_types.iter()).map(|(binder, ty)| {
                quote! {
                    let #binder = {
                        let __size = <#ty as ::prequel::serialize::Serializable>::SERIALIZED_SIZE;
                        let __value = <#ty as ::prequel::serialize::Serializable>::deserialize(&buf[__offset..__offset + __size])?;
                        __offset += __size;
                        __value
                    };
                }
            });

            quote! {
                impl #impl_generics ::prequel::serialize::Serializable for #name #ty_generics #where_clause {
                    const SERIALIZED_SIZE: usize = #size_sum;

                    fn serialize(&self, buf: &mut [u8]) {
                        debug_assert_eq!(buf.len(), <Self as ::prequel::serialize::Serializable>::SERIALIZED_SIZE);
                        #[allow(unused_mut, unused_variables)]
                        let mut __offset: usize = 0;
                        #(#serialize_body)*
                    }

                    fn deserialize(buf: &[u8]) -> ::prequel::error::Result<Self> {
                        debug_assert_eq!(buf.len(), <Self as ::prequel::serialize::Serializable>::SERIALIZED_SIZE);
                        #[allow(unused_mut, unused_variables)]
                        let mut __offset: usize = 0;
                        #(#deserialize_body)*
                        Ok(#name(#(#binders),*))
                    }
                }
            }
        }
        Fields::Unit => {
            quote! {
                impl #impl_generics ::prequel::serialize::Serializable for #name #ty_generics #where_clause {
                    const SERIALIZED_SIZE: usize = 0;
                    fn serialize(&self, _buf: &mut [u8]) {}
                    fn deserialize(_buf: &[u8]) -> ::prequel::error::Result<Self> {
                        Ok(#name)
                    }
                }
            }
        }
    }
}

/// Sum of field sizes as a compile-time expression, e.g. `0 + SIZE_A + SIZE_B`.
fn size_sum(types: &[syn::Type]) -> proc_macro2::TokenStream {
    if types.is_empty() {
        return quote! { 0 };
    }
    let parts = types.iter().map(|ty| {
        quote! { <#ty as ::prequel::serialize::Serializable>::SERIALIZED_SIZE }
    });
    quote! { 0 #( + #parts )* }
}

/// Emits `offset_of_<field>()` const fns giving the byte offset of each
/// field within the struct's serialized form, so nested field paths can be
/// composed by summing offsets across levels without touching the rest of
/// the record.
fn offset_fns(idents: &[syn::Ident], types: &[syn::Type]) -> proc_macro2::TokenStream {
    let fns = idents.iter().enumerate().map(|(i, ident)| {
        let fn_name = format_ident!("offset_of_{}", ident);
        let preceding = &types[..i];
        let offset = size_sum(preceding);
        quote! {
            /// Byte offset of this field within the type's serialized form.
            #[allow(dead_code)]
            pub const fn #fn_name() -> usize { #offset }
        }
    });
    quote! { #(#fns)* }
}

fn derive_enum(input: &DeriveInput, data: &syn::DataEnum) -> proc_macro2::TokenStream {
    let name = &input.ident;

    // Only fieldless (C-like) enums are supported; they are encoded as
    // their underlying repr integer, matching the source's "enum encoded
    // as its underlying integer type" rule.
    for variant in &data.variants {
        if !matches!(variant.fields, Fields::Unit) {
            return syn::Error::new_spanned(
                variant,
                "Serializable can only be derived for fieldless (C-like) enums; \
                 use a variant wrapper type for enums carrying data",
            )
            .to_compile_error();
        }
    }

    let repr = find_repr(input).unwrap_or_else(|| format_ident!("u32"));

    let variant_idents: Vec<_> = data.variants.iter().map(|v| v.ident.clone()).collect();
    let to_repr_arms = variant_idents.iter().map(|v| {
        quote! { #name::#v => #name::#v as #repr, }
    });
    let from_repr_arms = variant_idents.iter().map(|v| {
        quote! { x if x == #name::#v as #repr => #name::#v, }
    });

    quote! {
        impl ::prequel::serialize::Serializable for #name {
            const SERIALIZED_SIZE: usize = <#repr as ::prequel::serialize::Serializable>::SERIALIZED_SIZE;

            fn serialize(&self, buf: &mut [u8]) {
                let raw: #repr = match *self {
                    #(#to_repr_arms)*
                };
                ::prequel::serialize::Serializable::serialize(&raw, buf);
            }

            fn deserialize(buf: &[u8]) -> ::prequel::error::Result<Self> {
                let raw = <#repr as ::prequel::serialize::Serializable>::deserialize(buf)?;
                Ok(match raw {
                    #(#from_repr_arms)*
                    _ => return Err(::prequel::error::Error::Io(
                        format!("invalid discriminant {} for enum {}", raw, stringify!(#name))
                    )),
                })
            }
        }
    }
}

fn find_repr(input: &DeriveInput) -> Option<syn::Ident> {
    for attr in &input.attrs {
        if attr.path().is_ident("repr") {
            let mut found = None;
            let _ = attr.parse_nested_meta(|meta| {
                if let Some(ident) = meta.path.get_ident() {
                    found = Some(ident.clone());
                }
                Ok(())
            });
            if found.is_some() {
                return found;
            }
        }
    }
    None
}
