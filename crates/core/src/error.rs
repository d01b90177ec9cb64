#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Invalid value for {var}: {value:?}")]
    Config { var: &'static str, value: String },

    #[error("Unknown job status: {0:?}")]
    UnknownStatus(String),
}
