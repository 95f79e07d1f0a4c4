use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("consensus init error: {0}")]
    ConsensusInit(String),

    #[error("apply error: {0}")]
    Apply(String),

    #[error("snapshot apply error: {0}")]
    SnapshotApply(String),

    #[error("store IO error: {0}")]
    StoreIo(String),

    #[error("not leader (leader: {})", leader.as_deref().unwrap_or("unknown"))]
    NotLeader { leader: Option<String> },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("handler already registered: {0}")]
    AlreadyRegistered(&'static str),

    #[error("state machine closed")]
    Closed,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Startup failures the orchestrator treats as fatal.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::InvalidConfig(_) | Error::ConsensusInit(_) | Error::StoreIo(_) | Error::Io(_)
        )
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::StoreIo(err.to_string())
    }
}

impl From<prost::DecodeError> for Error {
    fn from(err: prost::DecodeError) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        match &err {
            Error::NotLeader { .. } => tonic::Status::failed_precondition(err.to_string()),
            Error::NotFound(_) => tonic::Status::not_found(err.to_string()),
            Error::AlreadyExists(_) => tonic::Status::already_exists(err.to_string()),
            Error::InvalidConfig(_) | Error::InvalidArgument(_) => {
                tonic::Status::invalid_argument(err.to_string())
            }
            Error::Apply(_) => tonic::Status::aborted(err.to_string()),
            _ => tonic::Status::internal(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
