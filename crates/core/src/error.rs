use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Input image is missing or does not exist: {0:?}")]
    MissingInputImage(Option<PathBuf>),

    #[error("Unsupported input image type '{extension}', expected one of: {expected}")]
    UnsupportedInputImage {
        extension: String,
        expected: &'static str,
    },

    #[error("No image input node found in workflow")]
    NoImageInputNode,

    #[error("Template error ({path}): {message}")]
    Template { path: PathBuf, message: String },
}
