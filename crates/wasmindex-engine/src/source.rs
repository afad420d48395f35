//! Line-oriented event stream sources.

use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncBufRead, BufReader};

/// Where the WASM event stream comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WasmSource {
    /// A file of one JSON record per line.
    File(PathBuf),
    /// Standard input (configured as `"-"`).
    Stdin,
}

impl WasmSource {
    pub fn from_path(path: &Path) -> Self {
        if path.as_os_str() == "-" {
            Self::Stdin
        } else {
            Self::File(path.to_path_buf())
        }
    }

    /// Open the source as a buffered async reader.
    pub async fn open(&self) -> std::io::Result<Box<dyn AsyncBufRead + Unpin + Send>> {
        Ok(match self {
            Self::File(path) => Box::new(BufReader::new(File::open(path).await?)),
            Self::Stdin => Box::new(BufReader::new(tokio::io::stdin())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dash_means_stdin() {
        assert_eq!(WasmSource::from_path(Path::new("-")), WasmSource::Stdin);
        assert!(matches!(
            WasmSource::from_path(Path::new("/tmp/events.ndjson")),
            WasmSource::File(_)
        ));
    }
}
