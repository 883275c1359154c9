pub mod config;
pub use config::{Config, FilterEncoding, FilterScope, FilteringConfig, LoggingConfig};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DynamicFilterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
    #[error("Config error: {0}")]
    Config(String),
    #[error("invalid dynamic filter channels: {0}")]
    InvalidChannels(String),
    #[error("unsupported dynamic filter type: {0}")]
    UnsupportedType(arrow::datatypes::DataType),
    #[error("add_input() may not be called after finish()")]
    InputAfterFinish,
    #[error("operator factory is already closed")]
    FactoryClosed,
    #[error("state store error: {0}")]
    StateStore(String),
    #[error("bloom filter decode error: {0}")]
    BloomDecode(String),
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, DynamicFilterError>;
