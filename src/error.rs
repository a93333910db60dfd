//! Errors surfaced by the sampling library.
//!
//! None of these are retried: once a stochastic trajectory has diverged
//! there is no cheap way to resume it.

/// The error type shared by the schedule, the models, the guidance and the
/// sampler.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Invalid schedule parameters, malformed guidance windows, missing files
    /// or inconsistent task payloads. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A non-finite value showed up in the reverse chain.
    #[error("non-finite values in {what} at timestep {timestep}")]
    NumericalInstability { timestep: usize, what: &'static str },

    /// Stored parameters do not match the expected model.
    #[error("model load error: {0}")]
    ModelLoad(String),

    /// A model or a guidance function returned something the sampler cannot
    /// use, e.g. a wrong channel count.
    #[error("invalid output: {0}")]
    InvalidOutput(String),

    #[error(transparent)]
    Torch(#[from] tch::TchError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn config<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    pub(crate) fn invalid_output<S: Into<String>>(msg: S) -> Self {
        Self::InvalidOutput(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
