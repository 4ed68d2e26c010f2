//! Access to the Telegraf classes, one file per class in a directory.

use std::{fs, path::PathBuf};

use tracing::info;

use crate::error::{Error, Result};

/// Source of class data, looked up by class name.
pub trait ClassDataSource: Send + Sync {
    fn get_data(&self, class_name: &str) -> Result<String>;
}

/// Reads classes from a directory, usually a mounted secret. Files are read on
/// every lookup so that updates to the mount are picked up without a restart.
#[derive(Debug, Clone)]
pub struct ClassDataHandler {
    pub classes_directory: PathBuf,
}

impl ClassDataHandler {
    pub fn new(classes_directory: impl Into<PathBuf>) -> Self {
        Self {
            classes_directory: classes_directory.into(),
        }
    }

    /// Checks that at least one class exists and that every class is valid TOML.
    pub fn validate_class_data(&self) -> Result<()> {
        info!(
            "validating class data from directory {}",
            self.classes_directory.display()
        );

        let entries = fs::read_dir(&self.classes_directory).map_err(|err| {
            Error::ClassData(format!(
                "unable to retrieve class data from directory {}: {}",
                self.classes_directory.display(),
                err
            ))
        })?;

        let mut class_data_valid = true;
        let mut files_available = false;

        for entry in entries.flatten() {
            let path = entry.path();
            // fs::metadata follows symlinks, so classes mounted through `..data` count.
            let is_file = fs::metadata(&path).map(|m| m.is_file()).unwrap_or(false);
            let name = entry.file_name();
            if !is_file || name.to_string_lossy().starts_with("..") {
                continue;
            }

            match fs::read_to_string(&path) {
                Ok(data) => {
                    files_available = true;
                    if let Err(err) = toml::from_str::<toml::Table>(&data) {
                        info!("unable to parse class data {}: {}", path.display(), err);
                        class_data_valid = false;
                    }
                }
                Err(err) => info!(
                    "unable to retrieve class data from file {}: {}",
                    path.display(),
                    err
                ),
            }
        }

        if !class_data_valid {
            return Err(Error::ClassData(
                "class data contains errors ; unable to continue".to_string(),
            ));
        }

        if !files_available {
            return Err(Error::ClassData(
                "no class data found ; unable to continue".to_string(),
            ));
        }

        Ok(())
    }
}

impl ClassDataSource for ClassDataHandler {
    fn get_data(&self, class_name: &str) -> Result<String> {
        // Class names come from pod annotations, never let them escape the directory.
        if class_name.is_empty() || class_name.contains('/') || class_name.starts_with('.') {
            return Err(Error::ClassNotFound {
                class: class_name.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "invalid class name",
                ),
            });
        }

        fs::read_to_string(self.classes_directory.join(class_name)).map_err(|source| {
            info!("unable to get class data for {}: {}", class_name, source);
            Error::ClassNotFound {
                class: class_name.to_string(),
                source,
            }
        })
    }
}
