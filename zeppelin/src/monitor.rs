use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use log::{error, info};

use crate::config::ServiceConfig;

struct WatchedFile {
    path: PathBuf,
    size: u64,
    modified: Option<SystemTime>,
}

impl WatchedFile {
    fn new(path: PathBuf) -> Self {
        let mut file = WatchedFile {
            path,
            size: 0,
            modified: None,
        };
        file.stat();
        file
    }

    fn stat(&mut self) -> bool {
        match fs::metadata(&self.path) {
            Ok(metadata) => {
                self.size = metadata.len();
                self.modified = metadata.modified().ok();
                true
            }
            Err(e) => {
                error!("unable to stat {}: {e}", self.path.display());
                false
            }
        }
    }

    fn is_modified(&mut self) -> bool {
        let size = self.size;
        let modified = self.modified;
        self.stat();

        if size != self.size || modified != self.modified {
            info!("file({}) modification detected", self.path.display());
            return true;
        }

        false
    }
}

/// Watches a set of files by size and modification time. Polled by the
/// supervisor; a change means "stop everything and rebuild from disk".
#[derive(Default)]
pub struct ConfigManager {
    files: Vec<WatchedFile>,
}

impl ConfigManager {
    pub fn new() -> Self {
        ConfigManager::default()
    }

    pub fn add(&mut self, path: &Path) {
        info!("watching file({})", path.display());
        self.files.push(WatchedFile::new(path.to_owned()));
    }

    /// Re-stat every watched file; true when any of them changed since the
    /// last check.
    pub fn is_modified(&mut self) -> bool {
        let mut modified = false;
        for file in &mut self.files {
            if file.is_modified() {
                modified = true;
            }
        }
        modified
    }
}

/// The files whose changes should restart the pipelines: the main config
/// plus every schema and processor config a pipeline references.
pub fn monitored_files(config_path: &Path) -> Vec<PathBuf> {
    let mut files = vec![config_path.to_owned()];

    let config = match ServiceConfig::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("unable to enumerate monitored files: {e:#}");
            return files;
        }
    };

    for pipeline in config.pipelines() {
        if let Some(schema) = pipeline.json_schema.as_deref().filter(|s| !s.is_empty()) {
            files.push(PathBuf::from(schema));
        }
        if let Some(extra) = pipeline.config.as_deref().filter(|s| !s.is_empty()) {
            files.push(PathBuf::from(extra));
        }
    }

    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn detects_size_changes() {
        let mut file = tempfile::NamedTempFile::new().expect("Unable to create temp file");
        file.write_all(b"{}").unwrap();
        file.flush().unwrap();

        let mut manager = ConfigManager::new();
        manager.add(file.path());
        assert!(!manager.is_modified());

        file.write_all(b" \n").unwrap();
        file.flush().unwrap();
        assert!(manager.is_modified());
        assert!(!manager.is_modified());
    }

    #[test]
    fn missing_files_do_not_report_changes() {
        let mut manager = ConfigManager::new();
        manager.add(Path::new("/nonexistent/zeppelin.json"));
        assert!(!manager.is_modified());
    }
}
