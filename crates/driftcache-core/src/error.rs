use thiserror::Error;

/// Failures surfaced to the coordinator's callers. Everything else in the
/// engine recovers locally (strategy fallback, queue retention, discarded
/// corrupt storage) and is logged rather than raised.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("service workers are not supported in this environment")]
    Unsupported,

    #[error("no worker is registered")]
    NotRegistered,
}
