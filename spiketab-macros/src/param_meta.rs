use darling::FromField;
use syn::{DeriveInput, Fields};

/// Parsed attributes from #[param(...)]
#[derive(Debug, FromField)]
#[darling(attributes(param))]
pub struct ParamField {
    pub ident: Option<syn::Ident>,
    pub ty: syn::Type,

    #[darling(default)]
    pub default: Option<String>,

    #[darling(default)]
    pub min: Option<f64>,

    #[darling(default)]
    pub max: Option<f64>,
}

/// Collect every named field carrying a #[param] attribute, in declaration order.
pub fn parse_params(input: &DeriveInput) -> darling::Result<Vec<ParamField>> {
    let fields = match &input.data {
        syn::Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => &fields.named,
            _ => {
                return Err(darling::Error::custom(
                    "ExtensionParams requires a struct with named fields",
                )
                .with_span(&input.ident))
            }
        },
        _ => {
            return Err(
                darling::Error::custom("ExtensionParams can only be derived for structs")
                    .with_span(&input.ident),
            )
        }
    };

    let mut errors = darling::Error::accumulator();
    let mut params = Vec::new();

    for field in fields.iter() {
        if !field.attrs.iter().any(|attr| attr.path().is_ident("param")) {
            continue;
        }
        if let Some(param) = errors.handle(ParamField::from_field(field)) {
            params.push(param);
        }
    }

    errors.finish_with(params)
}
