use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("unknown entity kind: {0}")]
    UnknownEntityKind(String),

    #[error("unknown fetch status: {0}")]
    UnknownFetchStatus(String),

    #[error("unknown ruleset: {0}")]
    UnknownRuleset(String),

    #[error("config error: {0}")]
    Config(String),
}
