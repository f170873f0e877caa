use dispatch::{DispatchSpec, DispatchTree, ResponseContent, ResponseImpl, SchemaBuilder};

/// The built-in demonstration schema: a liveness endpoint plus an echo
/// subtree showing subpath capture. Embedding applications register their
/// own responses through the same builder API.
pub fn demo_schema() -> DispatchTree {
    let mut builder = SchemaBuilder::new();

    builder.insert(
        ResponseImpl::new(|_| Ok(ResponseContent::text("ok"))),
        &DispatchSpec::new().path("/health"),
    );

    builder.insert(
        ResponseImpl::new(|input| {
            Ok(ResponseContent::text(format!(
                "/{}",
                input.subpath.join("/")
            )))
        })
        .with_subpath(),
        &DispatchSpec::new().path("/echo"),
    );

    for diagnostic in builder.diagnostics() {
        tracing::warn!("schema diagnostic: {diagnostic}");
    }
    builder.build()
}
