//! TOML overlay for parameter structs.

/// Builds a `$config_type` from its `Default`, then overrides the listed
/// fields with values from the TOML string `$config_str` when one is given.
/// Keys that are not listed are rejected. Evaluates to
/// `Result<$config_type, MirError>`.
///
/// ```no_run
/// # use mircore::{parsed_config, InitialParameters, MirError};
/// # fn main() -> Result<(), MirError> {
/// # let config_str: Option<&str> = None;
/// let params = parsed_config!(config_str => InitialParameters;
///                             batch_size, buffer_size)?;
/// # let _ = params;
/// # Ok(())
/// # }
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let overlay = |text: Option<&str>| -> Result<$config_type, $crate::MirError> {
            let mut config = <$config_type>::default();
            let mut table = match text {
                Some(text) => text.parse::<toml::Table>()?,
                None => return Ok(config),
            };
            $(
                if let Some(value) = table.remove(stringify!($field)) {
                    config.$field = value.try_into()?;
                }
            )+
            match table.keys().next() {
                Some(key) => Err($crate::MirError::msg(format!(
                    "invalid field name '{}' in config",
                    key,
                ))),
                None => Ok(config),
            }
        };
        overlay($config_str)
    }};
}
