use thiserror::Error;

use crate::config::ConfigError;

/// Fatal startup error, returned by `run()` in `src/bin/shepherd.rs` and
/// mapped to exit code 1 (spec.md §6, §7: config and control-socket
/// errors are fatal at boot; everything else is handled inside the
/// reactor and never reaches this boundary).
#[derive(Error, Debug)]
pub enum ShepherdError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("no daemons configured: pass --config or --exec")]
    NoDaemonsConfigured,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
