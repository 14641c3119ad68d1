//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

use crate::{config::LoggingConfig, Error, Result};

/// Install a global fmt subscriber.
///
/// `RUST_LOG` takes precedence over `config.filter`. A subscriber that is
/// already installed (e.g. by the embedding process or another test) is left
/// in place.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.filter).map_err(|e| {
            Error::invalid_config(format!("invalid log filter '{}': {e}", config.filter))
        })?,
    };

    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(config.ansi)
        .with_target(true)
        .try_init()
        .is_err()
    {
        tracing::debug!("tracing subscriber already installed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_not_an_error() -> Result<()> {
        let config = LoggingConfig {
            filter: "debug".into(),
            ansi: false,
        };
        init_tracing(&config)?;
        init_tracing(&config)
    }
}
