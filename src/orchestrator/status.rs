//! Writes the externally observable `status.json` snapshot after every
//! loop iteration, using the same temp-file-plus-rename atomic write
//! pattern as `state.json`, for a file meant to be tailed by a human or
//! dashboard rather than parsed back in by Autonoma itself.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use crate::model::StatusFile;

pub struct StatusWriter {
    path: PathBuf,
}

impl StatusWriter {
    pub fn new(working_dir: &Path) -> Self {
        Self {
            path: working_dir.join(".autonoma").join("status.json"),
        }
    }

    pub fn write(&self, status: &StatusFile) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("json.tmp");
        let text = serde_json::to_string_pretty(status)?;
        {
            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(text.as_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)
    }
}
