//! Received files land under one directory.

use std::io;
use std::path::{Component, Path, PathBuf};

use radiolink_core::Storage;

pub struct DirStorage {
    root: PathBuf,
}

impl DirStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Map a remote filename to a path under the root. Absolute paths and `..` are refused.
    pub fn resolve(&self, name: &str) -> io::Result<PathBuf> {
        let rel = Path::new(name);
        let plain = rel.components().all(|c| matches!(c, Component::Normal(_)));
        if name.is_empty() || !plain {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("refusing to write outside storage dir: {name:?}"),
            ));
        }
        Ok(self.root.join(rel))
    }
}

impl Storage for DirStorage {
    fn write_file(&mut self, path: &str, bytes: &[u8]) -> io::Result<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut tmp = target.clone().into_os_string();
        tmp.push(".part");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &target)?;
        tracing::info!(path = %target.display(), len = bytes.len(), "file stored");
        Ok(())
    }
}
