use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, DeriveInput};

mod param_meta;
use param_meta::parse_params;

/// Derive `spiketab::registry::ExtensionParams` for a parameter struct.
///
/// Every field annotated with `#[param(default = "<json>", min = .., max = ..)]`
/// becomes one `ParameterSchema` entry. The default is written as a JSON
/// literal, so strings need inner quotes: `#[param(default = "\"ptp\"")]`.
#[proc_macro_derive(ExtensionParams, attributes(param))]
pub fn derive_extension_params(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    let fields = match parse_params(&input) {
        Ok(fields) => fields,
        Err(e) => return e.write_errors().into(),
    };

    let mut entries = Vec::with_capacity(fields.len());
    for f in &fields {
        let Some(ident) = f.ident.as_ref() else {
            continue;
        };
        let field_name = ident.to_string();
        let kind = param_kind(&f.ty);

        let default_tokens = match f.default.as_deref() {
            Some(literal) => match literal.parse::<proc_macro2::TokenStream>() {
                Ok(tokens) => quote! { ::serde_json::json!(#tokens) },
                Err(_) => {
                    return syn::Error::new_spanned(
                        ident,
                        format!("default for `{field_name}` is not a valid JSON literal"),
                    )
                    .to_compile_error()
                    .into()
                }
            },
            None => quote! { ::serde_json::Value::Null },
        };

        let min = option_tokens(f.min);
        let max = option_tokens(f.max);

        entries.push(quote! {
            ::spiketab::registry::ParameterSchema {
                name: #field_name.to_string(),
                kind: ::spiketab::registry::ParamKind::#kind,
                default: #default_tokens,
                min: #min,
                max: #max,
            }
        });
    }

    let struct_name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let expanded = quote! {
        impl #impl_generics ::spiketab::registry::ExtensionParams for #struct_name #ty_generics #where_clause {
            fn parameter_schema() -> Vec<::spiketab::registry::ParameterSchema> {
                vec![#(#entries),*]
            }
        }
    };

    TokenStream::from(expanded)
}

fn option_tokens(value: Option<f64>) -> proc_macro2::TokenStream {
    match value {
        Some(v) => quote! { Some(#v) },
        None => quote! { None },
    }
}

fn param_kind(ty: &syn::Type) -> syn::Ident {
    let type_str = quote!(#ty).to_string().replace(' ', "");

    let kind = if type_str == "f64" || type_str == "f32" {
        "Number"
    } else if matches!(
        type_str.as_str(),
        "u8" | "u16" | "u32" | "u64" | "usize" | "i8" | "i16" | "i32" | "i64" | "isize"
    ) {
        "Integer"
    } else if type_str == "String" || type_str.contains("str") {
        "String"
    } else if type_str == "bool" {
        "Boolean"
    } else if type_str.starts_with("Vec<") {
        "Array"
    } else {
        "Any"
    };

    syn::Ident::new(kind, proc_macro2::Span::call_site())
}
