use thiserror::Error;

/// Failures surfaced by the binary's own composition layer (settings
/// loading, socket setup) on top of the errors [`beacon_reactor`] and
/// [`beacon_writer`] already define for their own operations.
#[derive(Debug, Error)]
pub enum BeaconError {
    #[error("failed to read settings file {path}: {source}")]
    SettingsRead { path: String, #[source] source: std::io::Error },

    #[error("failed to parse settings file {path}: {source}")]
    SettingsParse { path: String, #[source] source: serde_json::Error },

    #[error("could not resolve downstream address {addr}: {source}")]
    Resolve { addr: String, #[source] source: std::io::Error },

    #[error(transparent)]
    Reactor(#[from] beacon_reactor::ReactorError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
