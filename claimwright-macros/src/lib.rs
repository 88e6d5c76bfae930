use proc_macro::TokenStream;
use quote::quote;
use syn::{
    parse_macro_input, Block, Data, DeriveInput, ImplItem, ImplItemFn, ItemImpl,
    ReturnType, Stmt, Variant, Visibility,
};

/// Procedural macro that enhances error enums with generic error handling
///
/// This macro automatically:
/// 1. Adds `#[derive(Debug, thiserror::Error, uniffi::Error)]` and `#[uniffi(flat_error)]`
/// 2. Adds a `Generic { message: String }` variant if not already present
/// 3. Implements `From<anyhow::Error>` for the error type
/// 4. Provides helper methods for error conversion
///
/// # Usage
///
/// ```rust,ignore
/// #[claims_error]
/// pub enum StoreError {
///     #[error("schema not found: {key}")]
///     NotFound { key: String },
///     #[error("backend failure: {message}")]
///     Backend { message: String },
/// }
/// ```
///
/// This will automatically add:
/// - `#[derive(Debug, thiserror::Error, uniffi::Error)]` and `#[uniffi(flat_error)]`
/// - `Generic { message: String }` variant
/// - `impl From<anyhow::Error> for StoreError`
#[proc_macro_attribute]
pub fn claims_error(_args: TokenStream, input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    let expanded = match &input.data {
        Data::Enum(data_enum) => {
            let enum_name = &input.ident;
            let visibility = &input.vis;

            // Existing derive/uniffi attributes would clash with the generated ones
            let attrs: Vec<_> = input
                .attrs
                .iter()
                .filter(|attr| {
                    !attr.path().is_ident("derive") && !attr.path().is_ident("uniffi")
                })
                .collect();

            let generics = &input.generics;

            let has_generic = data_enum
                .variants
                .iter()
                .any(|variant| variant.ident == "Generic");

            let mut variants = data_enum.variants.clone();

            if !has_generic {
                let generic_variant: Variant = syn::parse_quote! {
                    /// A generic error that can wrap any anyhow error.
                    #[error("Generic error: {message}")]
                    Generic {
                        /// The error message from the wrapped error.
                        message: String
                    }
                };
                variants.push(generic_variant);
            }

            quote! {
                #[derive(Debug, thiserror::Error, uniffi::Error)]
                #[uniffi(flat_error)]
                #(#attrs)*
                #visibility enum #enum_name #generics {
                    #variants
                }

                impl #generics From<anyhow::Error> for #enum_name #generics {
                    fn from(err: anyhow::Error) -> Self {
                        Self::Generic {
                            message: crate::claims_error::AnyhowErrorExt::to_generic_message(err),
                        }
                    }
                }

                impl #generics #enum_name #generics {
                    /// Convert an anyhow::Result to a Result with this error type
                    pub fn from_anyhow_result<T>(result: anyhow::Result<T>) -> Result<T, Self> {
                        result.map_err(Self::from)
                    }

                    /// Convert an anyhow::Result to a Result with this error type, adding a prefix
                    pub fn from_anyhow_result_with_prefix<T>(
                        result: anyhow::Result<T>,
                        prefix: &str
                    ) -> Result<T, Self> {
                        result.map_err(|err| Self::Generic {
                            message: crate::claims_error::AnyhowErrorExt::to_generic_message_with_prefix(
                                err, prefix,
                            ),
                        })
                    }
                }
            }
        }
        _ => {
            return syn::Error::new_spanned(
                &input,
                "claims_error can only be applied to enums",
            )
            .to_compile_error()
            .into();
        }
    };

    TokenStream::from(expanded)
}

/// Procedural macro that wraps `uniffi::export` and automatically injects logging context
///
/// This macro automatically:
/// 1. Forwards the attribute to `#[uniffi::export]`
/// 2. Injects `let _claims_logger_ctx = crate::primitives::logger::LogContext::new("StructName");`
///    at the start of every sync `pub fn`
/// 3. Runs the body of every `pub async fn` inside a task-local logging scope, so the
///    context survives `.await` points and never leaks into other tasks on the same thread
/// 4. Automatically adds `async_runtime = "tokio"` if any async functions are detected
///
/// # Usage
///
/// ```rust,ignore
/// #[claims_export]
/// impl ClaimsSchemaManager {
///     pub fn mandatory_scopes(&self) -> Vec<String> {
///         // _claims_logger_ctx is automatically injected here
///         debug!("This will be prefixed with [Claims][ClaimsSchemaManager]");
///         vec![]
///     }
///
///     pub async fn stop(&self) {
///         // async_runtime = "tokio" is automatically added to uniffi::export
///     }
/// }
/// ```
#[proc_macro_attribute]
pub fn claims_export(args: TokenStream, input: TokenStream) -> TokenStream {
    let input_impl = parse_macro_input!(input as ItemImpl);

    let type_name = match &*input_impl.self_ty {
        syn::Type::Path(type_path) => type_path
            .path
            .segments
            .last()
            .map_or_else(|| "Unknown".to_string(), |segment| segment.ident.to_string()),
        _ => "Unknown".to_string(),
    };

    let args = export_args(
        args.into(),
        has_async_functions_in_impl(&input_impl.items),
    );

    let items = input_impl
        .items
        .iter()
        .cloned()
        .map(|item| match item {
            ImplItem::Fn(mut method) if matches!(method.vis, Visibility::Public(_)) => {
                if method.sig.asyncness.is_some() {
                    scope_async_logging_context(&mut method, &type_name);
                } else {
                    inject_logging_context(&mut method, &type_name);
                }
                ImplItem::Fn(method)
            }
            other => other,
        })
        .collect();

    let new_impl = ItemImpl {
        items,
        ..input_impl
    };

    quote! {
        #[uniffi::export(#args)]
        #new_impl
    }
    .into()
}

/// Appends `async_runtime = "tokio"` to the export arguments when the impl has async methods.
fn export_args(args: proc_macro2::TokenStream, has_async: bool) -> proc_macro2::TokenStream {
    match (has_async, args.is_empty()) {
        (false, _) => args,
        (true, true) => quote! { async_runtime = "tokio" },
        (true, false) => quote! { #args, async_runtime = "tokio" },
    }
}

/// Check if any public functions in the impl items are async
fn has_async_functions_in_impl(impl_items: &[ImplItem]) -> bool {
    impl_items.iter().any(|item| {
        if let ImplItem::Fn(method) = item {
            matches!(method.vis, Visibility::Public(_))
                && method.sig.asyncness.is_some()
        } else {
            false
        }
    })
}

/// Inject logging context at the start of a function body
fn inject_logging_context(method: &mut ImplItemFn, type_name: &str) {
    let context_stmt: Stmt = syn::parse_quote! {
        let _claims_logger_ctx = crate::primitives::logger::LogContext::new(#type_name);
    };

    method.block.stmts.insert(0, context_stmt);
}

/// Move an async function body into a task-local logging scope.
///
/// The original statements are evaluated into a binding typed with the function's return
/// type, which keeps `?` and early `return` inside the body well-typed.
fn scope_async_logging_context(method: &mut ImplItemFn, type_name: &str) {
    let stmts = &method.block.stmts;
    let return_type = match &method.sig.output {
        ReturnType::Default => quote! { () },
        ReturnType::Type(_, ty) => quote! { #ty },
    };

    let block: Block = syn::parse_quote! {{
        crate::primitives::logger::LOG_CONTEXT
            .scope(::std::cell::RefCell::new(None), async {
                let _claims_logger_ctx = crate::primitives::logger::LogContext::new(#type_name);
                let claims_export_result: #return_type = { #(#stmts)* };
                claims_export_result
            })
            .await
    }};

    method.block = block;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_async_detection_with_async_functions() {
        let impl_block: ItemImpl = syn::parse_quote! {
            impl ClaimsSchemaManager {
                pub fn mandatory_scopes(&self) -> Vec<String> {
                    vec![]
                }

                pub async fn stop(&self) {}
            }
        };

        assert!(has_async_functions_in_impl(&impl_block.items));
    }

    #[test]
    fn test_async_detection_without_async_functions() {
        let impl_block: ItemImpl = syn::parse_quote! {
            impl ClaimsSchemaManager {
                pub fn mandatory_scopes(&self) -> Vec<String> {
                    vec![]
                }

                pub fn page_size(&self) -> u32 {
                    100
                }
            }
        };

        assert!(!has_async_functions_in_impl(&impl_block.items));
    }

    #[test]
    fn test_async_detection_ignores_private_async_functions() {
        let impl_block: ItemImpl = syn::parse_quote! {
            impl ClaimsSchemaManager {
                pub fn mandatory_scopes(&self) -> Vec<String> {
                    vec![]
                }

                async fn migrate_page(&self) {}
            }
        };

        assert!(!has_async_functions_in_impl(&impl_block.items));
    }

    #[test]
    fn test_sync_function_gets_context_statement() {
        let mut method: ImplItemFn = syn::parse_quote! {
            pub fn mandatory_scopes(&self) -> Vec<String> {
                vec![]
            }
        };

        inject_logging_context(&mut method, "ClaimsSchemaManager");

        assert_eq!(method.block.stmts.len(), 2);
        let first = &method.block.stmts[0];
        let rendered = quote! { #first }.to_string();
        assert!(rendered.contains("LogContext :: new"));
        assert!(rendered.contains("\"ClaimsSchemaManager\""));
    }

    #[test]
    fn test_async_function_body_is_scoped() {
        let mut method: ImplItemFn = syn::parse_quote! {
            pub async fn define_schema(&self, payload: ClaimsSchemaPayload) -> Result<ClaimsSchema, ClaimsError> {
                let schema = self.compile(payload)?;
                Ok(schema)
            }
        };

        scope_async_logging_context(&mut method, "ClaimsSchemaManager");

        let block = &method.block;
        let rendered = quote! { #block }.to_string();
        assert!(rendered.contains("LOG_CONTEXT"));
        assert!(rendered.contains(". scope"));
        assert!(rendered.contains("claims_export_result : Result < ClaimsSchema , ClaimsError >"));
        assert!(rendered.contains("self . compile (payload) ?"));
    }

    #[test]
    fn test_export_args() {
        let none = proc_macro2::TokenStream::new();
        assert!(export_args(none.clone(), false).is_empty());
        assert_eq!(
            export_args(none, true).to_string(),
            "async_runtime = \"tokio\""
        );
        assert_eq!(
            export_args(quote! { name = "ClaimsManager" }, true).to_string(),
            "name = \"ClaimsManager\" , async_runtime = \"tokio\""
        );
    }
}
