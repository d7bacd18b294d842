use std::path::PathBuf;

/// Errors surfaced by the diagnostic tools.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("cannot load model from {path:?}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: candle::Error,
    },

    #[error("filesystem error on {path:?}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot decode image {path:?}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("profiling failed: {0}")]
    Profiling(#[source] candle::Error),

    #[error("invalid configuration {path:?}: {msg}")]
    Config { path: PathBuf, msg: String },

    #[error(transparent)]
    Candle(#[from] candle::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn load<P: Into<PathBuf>>(path: P, source: candle::Error) -> Self {
        Self::Load {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn filesystem<P: Into<PathBuf>>(path: P, source: std::io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
