use thiserror::Error;

/// Errors surfaced by the public build API.
///
/// Candidate rejections and resolution failures are not errors; they are part
/// of normal backtracking and are reported through the diagnostic sink. This
/// enum only covers conditions that abort an API call.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BuildError {
    /// The build was cancelled while the caller was blocked on it.
    #[error("build cancelled")]
    Cancelled,
}
