use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Resolve the data directory from, in order of priority:
    /// 1. An explicit path (from --data-dir)
    /// 2. The FOLIOSCAN_DATA_DIR environment variable
    /// 3. The XDG data directory (~/.local/share/folioscan/)
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let root = if let Some(path) = explicit {
            path.to_path_buf()
        } else if let Ok(val) = std::env::var("FOLIOSCAN_DATA_DIR") {
            PathBuf::from(val)
        } else {
            xdg::BaseDirectories::with_prefix("folioscan")
                .get_data_home()
                .ok_or_else(|| {
                    Error::Config(
                        "could not determine XDG data home directory".into(),
                    )
                })?
        };

        std::fs::create_dir_all(&root)
            .map_err(|_| Error::DataDir(root.clone()))?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn catalog_db(&self) -> PathBuf {
        self.root.join("catalog.redb")
    }

    /// Directory owned by the index engine. Nothing else writes here.
    pub fn index_dir(&self) -> Result<PathBuf> {
        self.ensure("index")
    }

    /// Stored copies of uploaded documents, served as `/pdf/{filename}`.
    pub fn documents_dir(&self) -> Result<PathBuf> {
        self.ensure("documents")
    }

    pub fn audit_log(&self) -> Result<PathBuf> {
        Ok(self.ensure("logs")?.join("audit.log"))
    }

    fn ensure(&self, name: &str) -> Result<PathBuf> {
        let path = self.root.join(name);
        std::fs::create_dir_all(&path)
            .map_err(|_| Error::DataDir(path.clone()))?;
        Ok(path)
    }
}
