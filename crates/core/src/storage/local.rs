//! Filesystem-backed object store for development and tests.
//!
//! Objects live at `<root>/<key>`. Content type and tags are kept in a JSON sidecar
//! under `<root>/.meta/<key>.json`.

use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ObjectBackend, ObjectMetadata, PresignMethod, StorageError, Tags};

const META_DIR_NAME: &str = ".meta";

#[derive(Debug, Default, Serialize, Deserialize)]
struct Sidecar {
    content_type: Option<String>,
    #[serde(default)]
    tags: Tags,
}

#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: &Path) -> Result<Self, StorageError> {
        fs::create_dir_all(root).map_err(|error| StorageError::local_io(root, error))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = validate_key(key)?;
        Ok(self.root.join(relative))
    }

    fn sidecar_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = validate_key(key)?;
        let mut path = self.root.join(META_DIR_NAME).join(relative);
        let file_name = format!(
            "{}.json",
            path.file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default()
        );
        path.set_file_name(file_name);
        Ok(path)
    }

    fn read_sidecar(&self, key: &str) -> Result<Sidecar, StorageError> {
        let path = self.sidecar_path(key)?;
        match fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw).map_err(|error| {
                StorageError::local_io(&path, std::io::Error::new(ErrorKind::InvalidData, error))
            }),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(Sidecar::default()),
            Err(error) => Err(StorageError::local_io(&path, error)),
        }
    }

    fn write_sidecar(&self, key: &str, sidecar: &Sidecar) -> Result<(), StorageError> {
        let path = self.sidecar_path(key)?;
        ensure_parent(&path)?;
        let encoded = serde_json::to_vec_pretty(sidecar).map_err(|error| {
            StorageError::local_io(&path, std::io::Error::new(ErrorKind::InvalidData, error))
        })?;
        fs::write(&path, encoded).map_err(|error| StorageError::local_io(&path, error))
    }

    fn require_object(&self, key: &str) -> Result<PathBuf, StorageError> {
        let path = self.object_path(key)?;
        if path.is_file() {
            Ok(path)
        } else {
            Err(StorageError::NotFound {
                key: key.to_string(),
            })
        }
    }

    fn metadata_for(&self, key: &str, path: &Path) -> Result<ObjectMetadata, StorageError> {
        let stat = fs::metadata(path).map_err(|error| map_io(key, path, error))?;
        let sidecar = self.read_sidecar(key)?;
        Ok(ObjectMetadata {
            key: key.to_string(),
            size_bytes: stat.len(),
            last_modified: stat.modified().ok().map(DateTime::<Utc>::from),
            etag: None,
            content_type: sidecar.content_type,
            metadata: Default::default(),
        })
    }

    fn collect_keys(&self, dir: &Path, keys: &mut Vec<String>) -> Result<(), StorageError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(()),
            Err(error) => return Err(StorageError::local_io(dir, error)),
        };

        for entry in entries {
            let entry = entry.map_err(|error| StorageError::local_io(dir, error))?;
            let path = entry.path();
            if dir == self.root && entry.file_name() == META_DIR_NAME {
                continue;
            }
            if path.is_dir() {
                self.collect_keys(&path, keys)?;
            } else if let Ok(relative) = path.strip_prefix(&self.root) {
                let key = relative
                    .components()
                    .map(|component| component.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                keys.push(key);
            }
        }
        Ok(())
    }
}

impl ObjectBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    fn put_file(&self, path: &Path, key: &str, content_type: &str) -> Result<(), StorageError> {
        let dest = self.object_path(key)?;
        ensure_parent(&dest)?;
        fs::copy(path, &dest).map_err(|error| StorageError::local_io(path, error))?;

        let mut sidecar = self.read_sidecar(key)?;
        sidecar.content_type = Some(content_type.to_string());
        self.write_sidecar(key, &sidecar)
    }

    fn get_to_file(&self, key: &str, dest: &Path) -> Result<(), StorageError> {
        let source = self.require_object(key)?;
        ensure_parent(dest)?;
        fs::copy(&source, dest)
            .map(|_| ())
            .map_err(|error| map_io(key, &source, error))
    }

    fn head(&self, key: &str) -> Result<ObjectMetadata, StorageError> {
        let path = self.require_object(key)?;
        self.metadata_for(key, &path)
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.object_path(key)?;
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => return Err(StorageError::local_io(&path, error)),
        }

        let sidecar = self.sidecar_path(key)?;
        match fs::remove_file(&sidecar) {
            Err(error) if error.kind() != ErrorKind::NotFound => {
                Err(StorageError::local_io(&sidecar, error))
            }
            _ => Ok(()),
        }
    }

    fn copy(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let source = self.require_object(from)?;
        let dest = self.object_path(to)?;
        ensure_parent(&dest)?;
        fs::copy(&source, &dest).map_err(|error| map_io(from, &source, error))?;

        let sidecar = self.read_sidecar(from)?;
        self.write_sidecar(to, &sidecar)
    }

    fn list(
        &self,
        prefix: Option<&str>,
        max_keys: usize,
    ) -> Result<Vec<ObjectMetadata>, StorageError> {
        let mut keys = Vec::new();
        self.collect_keys(&self.root, &mut keys)?;
        keys.sort();

        keys.into_iter()
            .filter(|key| prefix.map_or(true, |prefix| key.starts_with(prefix)))
            .take(max_keys)
            .map(|key| {
                let path = self.object_path(&key)?;
                self.metadata_for(&key, &path)
            })
            .collect()
    }

    fn get_tags(&self, key: &str) -> Result<Tags, StorageError> {
        self.require_object(key)?;
        Ok(self.read_sidecar(key)?.tags)
    }

    fn put_tags(&self, key: &str, tags: &Tags) -> Result<(), StorageError> {
        self.require_object(key)?;
        let mut sidecar = self.read_sidecar(key)?;
        sidecar.tags = tags.clone();
        self.write_sidecar(key, &sidecar)
    }

    fn presign(
        &self,
        _method: PresignMethod,
        _key: &str,
        _expires_in: Duration,
    ) -> Result<String, StorageError> {
        Err(StorageError::Unsupported {
            operation: "presign",
            backend: "local",
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!("file://{}", self.root.join(key).display())
    }
}

fn validate_key(key: &str) -> Result<PathBuf, StorageError> {
    let invalid = |reason: &str| StorageError::InvalidKey {
        key: key.to_string(),
        reason: reason.to_string(),
    };

    if key.trim().is_empty() {
        return Err(invalid("key is empty"));
    }

    let relative = PathBuf::from(key);
    for component in relative.components() {
        match component {
            Component::Normal(_) => {}
            Component::CurDir => {}
            _ => return Err(invalid("key must be a relative path without '..'")),
        }
    }
    if relative
        .components()
        .next()
        .is_some_and(|first| first.as_os_str() == META_DIR_NAME)
    {
        return Err(invalid("key uses a reserved prefix"));
    }
    Ok(relative)
}

fn ensure_parent(path: &Path) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|error| StorageError::local_io(parent, error))?;
    }
    Ok(())
}

fn map_io(key: &str, path: &Path, error: std::io::Error) -> StorageError {
    if error.kind() == ErrorKind::NotFound {
        StorageError::NotFound {
            key: key.to_string(),
        }
    } else {
        StorageError::local_io(path, error)
    }
}
