//! tracing setup.
//!
//! the default filter comes from `logging.level`; `RUST_LOG`, when set,
//! replaces it entirely.

use tracing_subscriber::EnvFilter;

/// filter used when `RUST_LOG` is absent. a bare level applies to this crate
/// only so that rumqttc/reqwest chatter stays at warn.
pub fn default_directive(level: &str) -> String {
    let level = level.trim();
    if level.contains('=') || level.contains(',') {
        level.to_string()
    } else {
        format!("warn,thermowatch={level}")
    }
}

pub fn init(level: &str) -> anyhow::Result<()> {
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::try_new(directives)?,
        _ => EnvFilter::try_new(default_directive(level))?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_level_is_scoped_to_the_crate() {
        assert_eq!(default_directive("debug"), "warn,thermowatch=debug");
        assert_eq!(default_directive("info,rumqttc=debug"), "info,rumqttc=debug");
    }
}
