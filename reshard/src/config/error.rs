use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error on \"{0}\": {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("toml parse error: {0}")]
    Parse(#[from] toml::de::Error),
}
