use thiserror::Error;

#[derive(Error, Debug)]
pub enum DchatError {
    #[error("Invalid configuration: {0}")]
    Config(String),
}
