use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config Error - {0}")]
    Config(String),

    #[error("Init Error - {0}")]
    Init(String),

    #[error("Source Error - {0}")]
    Source(String),

    #[error("Store Error - {0}")]
    Store(String),

    #[error("Task Error - {0}")]
    Task(String),

    #[error("Metrics Error - {0}")]
    Metrics(String),
}

impl From<sinker_kafka::Error> for Error {
    fn from(value: sinker_kafka::Error) -> Self {
        Error::Source(value.to_string())
    }
}

impl From<sinker_clickhouse::Error> for Error {
    fn from(value: sinker_clickhouse::Error) -> Self {
        Error::Store(value.to_string())
    }
}
