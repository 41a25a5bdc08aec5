use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// path to an existing `.torrent` file, checked while the arguments are parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetainfoFilePath(PathBuf);

impl MetainfoFilePath {
    pub fn new(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path: PathBuf = path.into();

        let is_torrent = path
            .extension()
            .is_some_and(|extension| extension == OsStr::new("torrent"));
        if !is_torrent {
            anyhow::bail!("{} is not a .torrent file", path.display());
        }
        if !path.is_file() {
            anyhow::bail!("could not find torrent file at {}", path.display());
        }

        Ok(Self(path))
    }
}

impl FromStr for MetainfoFilePath {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<Path> for MetainfoFilePath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}
