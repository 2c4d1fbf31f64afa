extern crate proc_macro;

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, DeriveInput};

/// Implements `micro::MicroParam` for a serde type, encoding with
/// JSON or MessagePack according to the negotiated content type.
#[proc_macro_derive(MicroParam)]
pub fn micro_param(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    let name = input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let expanded = quote! {
        impl #impl_generics ::micro::protocol::MicroParam for #name #ty_generics #where_clause {
            fn into_bytes(
                &self,
                ct: ::micro::protocol::ContentType,
            ) -> ::micro::protocol::Result<::std::vec::Vec<u8>> {
                ::micro::protocol::encode_serde(self, ct)
            }
            fn from_slice(
                &mut self,
                ct: ::micro::protocol::ContentType,
                data: &[u8],
            ) -> ::micro::protocol::Result<()> {
                *self = ::micro::protocol::decode_serde(ct, data)?;
                Ok(())
            }
        }
    };

    TokenStream::from(expanded)
}
