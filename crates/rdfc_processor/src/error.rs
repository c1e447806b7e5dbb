use thiserror::Error;

/// Structural problems in an IR stage description.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IRError {
    #[error("stage `{stage}` is missing required argument `{parameter}`")]
    MissingArgument { stage: String, parameter: String },

    #[error("stage `{stage}` argument `{parameter}` takes a single value, got {count}")]
    TooManyValues {
        stage: String,
        parameter: String,
        count: usize,
    },

    #[error("stage `{stage}` sets `{argument}`, which processor `{processor}` does not declare")]
    UnknownArgument {
        stage: String,
        processor: String,
        argument: String,
    },

    #[error("stage `{stage}` argument `{parameter}` expected a {expected} value")]
    KindMismatch {
        stage: String,
        parameter: String,
        expected: &'static str,
    },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel `{0}` is closed")]
    Closed(String),

    #[error("channel `{uri}`: {reason}")]
    Delivery { uri: String, reason: String },

    #[error("cannot bind channel `{uri}`: {reason}")]
    Bind { uri: String, reason: String },
}

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("no processor registered for `{0}`")]
    UnknownProcessor(String),

    #[error("missing argument `{0}`")]
    MissingArgument(String),

    #[error("invalid argument `{name}`: {reason}")]
    InvalidArgument { name: String, reason: String },

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    IR(#[from] IRError),
}
