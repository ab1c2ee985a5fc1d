use std::path::{Path, PathBuf};

use indexmap::IndexMap;

use super::{resolve, ConfigError, DaemonSpec, RawConfig};

/// Loads and resolves the YAML roster file. Grounded on
/// `config/loader.rs::SuperAgentConfigLoaderFile` in the codebase this
/// crate is grounded on, generalized from a single hard-coded config
/// struct to the `defaults` + `daemons` roster shape of spec.md §6.
pub struct ConfigLoader {
    file_path: PathBuf,
}

impl ConfigLoader {
    pub fn new(file_path: &Path) -> Self {
        Self {
            file_path: file_path.to_path_buf(),
        }
    }

    pub fn load(&self) -> Result<IndexMap<String, DaemonSpec>, ConfigError> {
        let contents =
            std::fs::read_to_string(&self.file_path).map_err(|source| ConfigError::Io {
                path: self.file_path.clone(),
                source,
            })?;
        let raw: RawConfig = serde_yaml::from_str(&contents)?;
        resolve(raw)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn load_roster_from_file() {
        let mut tmp_file = NamedTempFile::new().unwrap();
        write!(
            tmp_file,
            r#"
daemons:
  messenger:
    start_command: "/usr/bin/messenger --foreground"
    restart: [0, 0, 5]
"#
        )
        .unwrap();

        let roster = ConfigLoader::new(tmp_file.path()).load().unwrap();
        assert!(roster.contains_key("messenger"));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let result = ConfigLoader::new(Path::new("/nonexistent/shepherd.yaml")).load();
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
