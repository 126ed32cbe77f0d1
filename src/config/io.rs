use std::env::current_exe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use directories_next::ProjectDirs;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use serde_json;
use fd_lock::{RwLock, RwLockWriteGuard};
use log::{debug, info, warn};
use std::fs::OpenOptions;
use std::str;

use crate::config::types::LinkConfig;
use crate::error::ConfigError;

// toylink.json next to the executable, so that a portable install keeps its own config
fn get_portable_config_path() -> Option<PathBuf> {
    match current_exe() {
        Ok(mut path) => {
            if !path.set_extension("json") {
                warn!("current exe has no filename: {}", path.to_string_lossy());
                return None
            }

            Some(path)
        },
        Err(err) => {
            warn!("failed to get current exe path: {:?}", err);
            None
        },
    }
}

// toylink.json in an os dependent standard directory, such as ~/.config/toylink on linux
fn get_local_config_path() -> Option<PathBuf> {
    ProjectDirs::from("io", "toylink", "toylink").map(|dirs| {
        dirs.config_dir().join("toylink.json")
    })
}

fn get_config_path() -> Result<PathBuf, ConfigError> {
    if let Some(path) = get_portable_config_path() {
        match std::fs::metadata(&path) {
            Ok(attr) if attr.is_file() => return Ok(path),
            Ok(_) => {},
            Err(err) => {
                debug!("No portable config at {} ({})", path.to_string_lossy(), err);
            },
        }
    }

    get_local_config_path().ok_or(ConfigError::NoConfigPath)
}

pub struct ConfigIOLocker {
    rw_lock: RwLock<std::fs::File>,
}

impl ConfigIOLocker {
    /// Exclusive lock on the config file; fails if another instance holds it.
    pub fn lock(&mut self) -> Result<RwLockWriteGuard<std::fs::File>, ConfigError> {
        self.rw_lock.try_write().map_err(|source| ConfigError::CanNotLock { source })
    }
}

struct ConfigIOInner {
    file: std::fs::File,
}

#[derive(Clone)]
pub struct ConfigIO {
    inner: Arc<Mutex<ConfigIOInner>>,
}

impl ConfigIO {
    /// Open (creating if needed) the config file at `path`, or at the default location.
    pub fn new_sync(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => get_config_path()?,
        };
        info!("Using config file {}", path.to_string_lossy());

        if let Some(directory) = path.parent() {
            if !directory.as_os_str().is_empty() {
                std::fs::create_dir_all(directory)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .truncate(false)
            .create(true)
            .open(&path)?;

        let inner = ConfigIOInner { file };
        Ok(ConfigIO { inner: Arc::new(Mutex::new(inner)) })
    }

    pub fn locker(&self) -> Result<ConfigIOLocker, ConfigError> {
        let inner = self.inner.lock().expect("Failed to lock ConfigIO inner");

        Ok(ConfigIOLocker {
            rw_lock: RwLock::new(inner.file.try_clone()?),
        })
    }

    fn get_file(&self) -> Result<File, ConfigError> {
        let inner = self.inner.lock().expect("Failed to lock ConfigIO inner");
        let file = inner.file.try_clone()?;
        Ok(File::from_std(file))
    }

    pub async fn read(&self) -> Result<LinkConfig, ConfigError> {
        let mut file = self.get_file()?;
        debug!("Reading config file");

        let mut content = vec![];
        file.rewind().await?;
        file.read_to_end(&mut content).await?;

        if content.is_empty() {
            return Ok(LinkConfig::default());
        }

        let content = str::from_utf8(&content)?;
        Ok(serde_json::from_str(content)?)
    }

    pub async fn save(&self, config: &LinkConfig) -> Result<(), ConfigError> {
        let mut file = self.get_file()?;
        debug!("Saving config");

        let content = serde_json::to_string_pretty(config)?;
        file.rewind().await?;
        file.set_len(0).await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config_path(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("toylink-test-{}-{}.json", name, std::process::id()));
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn empty_file_reads_defaults() {
        let path = temp_config_path("empty");
        let config_io = ConfigIO::new_sync(Some(&path)).unwrap();

        assert_eq!(config_io.read().await.unwrap(), LinkConfig::default());
        // opening creates the file
        assert!(path.exists());

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn save_then_read() {
        let path = temp_config_path("save");
        let config_io = ConfigIO::new_sync(Some(&path)).unwrap();

        let mut config = LinkConfig::default();
        config.remember_device("aa:bb:cc:dd:ee:ff", "LVS-Max");
        config.auto_connect = false;
        config_io.save(&config).await.unwrap();

        // a shorter document must not leave trailing bytes of the previous one
        let mut shorter = config.clone();
        shorter.last_connected_name = None;
        config_io.save(&shorter).await.unwrap();

        assert_eq!(config_io.read().await.unwrap(), shorter);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn invalid_json_is_reported() {
        let path = temp_config_path("invalid");
        std::fs::write(&path, "{ not json").unwrap();
        let config_io = ConfigIO::new_sync(Some(&path)).unwrap();

        match config_io.read().await {
            Err(ConfigError::JsonError { .. }) => {},
            other => panic!("unexpected result: {:?}", other),
        }

        let _ = std::fs::remove_file(&path);
    }
}
