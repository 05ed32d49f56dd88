//! Stable device identity

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub hostname: String,
}

impl DeviceIdentity {
    /// Read the device id at `path`, generating and persisting one on first
    /// use. An existing id is never rewritten.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        let existing = match fs::read_to_string(path) {
            Ok(content) => Some(content.trim().to_string()).filter(|id| !id.is_empty()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(e).context(format!("Failed to read device id: {:?}", path));
            }
        };

        let device_id = match existing {
            Some(id) => id,
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)
                        .context(format!("Failed to create directory: {:?}", parent))?;
                }
                fs::write(path, &id).context(format!("Failed to write device id: {:?}", path))?;
                info!("Generated device id {}", id);
                id
            }
        };

        Ok(Self {
            device_id,
            hostname: local_hostname(),
        })
    }
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_device_id_is_stable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("device_id");

        let first = DeviceIdentity::load_or_create(&path).unwrap();
        let second = DeviceIdentity::load_or_create(&path).unwrap();

        assert_eq!(first.device_id, second.device_id);
        assert!(uuid::Uuid::parse_str(&first.device_id).is_ok());
        assert!(!first.hostname.is_empty());
    }

    #[test]
    fn test_existing_id_is_kept() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("device_id");
        fs::write(&path, "my-laptop-id\n").unwrap();

        let identity = DeviceIdentity::load_or_create(&path).unwrap();
        assert_eq!(identity.device_id, "my-laptop-id");
        assert_eq!(fs::read_to_string(&path).unwrap(), "my-laptop-id\n");
    }
}
