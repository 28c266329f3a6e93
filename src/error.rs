use std::{error, fmt};

// -------------------------------------------------------------------------------------------------

/// Provides an enumeration of all possible errors reported by grainplay.
#[derive(Debug)]
pub enum Error {
    ParameterError(String),
    BufferLoadError(Box<dyn error::Error + Send + Sync>),
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ParameterError(str) => write!(f, "Invalid parameter: {str}"),
            Self::BufferLoadError(err) => err.fmt(f),
        }
    }
}

#[cfg(feature = "wav")]
impl From<hound::Error> for Error {
    fn from(err: hound::Error) -> Self {
        Error::BufferLoadError(Box::new(err))
    }
}
