// ─── define_plugin! ─────────────────────────────────────────────────────────

/// Creates a [`PluginDescriptor`](crate::plugin::PluginDescriptor).
///
/// # Syntax
///
/// ```rust,ignore
/// use syncbot_framework::prelude::*;
///
/// async fn init(ctx: PluginContext) -> Result<(), BoxError> {
///     ctx.register_command(CommandSpec::new("ping").help("replies pong"), |_| async {
///         Ok(CommandReply::from("pong"))
///     });
///     Ok(())
/// }
///
/// pub static PING: PluginDescriptor = define_plugin! {
///     name: "ping",
///     desc: "Answers /bot ping",
///     init: init,
/// };
/// ```
///
/// ## Field reference
///
/// | Field | Required | Description |
/// |-------|----------|-------------|
/// | `name` | ✓ | Must be **first**. Plugin name and config-section key. |
/// | `provides` | | `["shared", …]`: shared objects registered in `init` |
/// | `depends_on` | | `["shared", …]`: shared objects required before `init` |
/// | `desc` | | One-line description |
/// | `version` | | Defaults to `CARGO_PKG_VERSION` of the defining crate |
/// | `init` | ✓ | `async fn(PluginContext) -> Result<(), BoxError>` |
#[macro_export]
macro_rules! define_plugin {
    (
        name: $name:literal,
        $(provides: [$($provides:literal),* $(,)?],)?
        $(depends_on: [$($depends:literal),* $(,)?],)?
        $(desc: $desc:literal,)?
        $(version: $version:literal,)?
        init: $init:path $(,)?
    ) => {
        $crate::plugin::PluginDescriptor {
            api_version: $crate::plugin::PLUGIN_API_VERSION,
            name: $name,
            provides: &[$($($provides),*)?],
            depends_on: &[$($($depends),*)?],
            init: {
                fn __init(ctx: $crate::plugin::PluginContext) -> $crate::plugin::InitFuture {
                    ::std::boxed::Box::pin($init(ctx))
                }
                __init
            },
            metadata: $crate::plugin::PluginMetadata {
                version: $crate::__plugin_or!([$($version)?] ::std::env!("CARGO_PKG_VERSION")),
                desc: $crate::__plugin_or!([$($desc)?] ""),
            },
        }
    };
}

/// Internal helper: the optional literal, else the default.
#[macro_export]
#[doc(hidden)]
macro_rules! __plugin_or {
    ([] $default:expr) => {
        $default
    };
    ([$value:literal] $default:expr) => {
        $value
    };
}
