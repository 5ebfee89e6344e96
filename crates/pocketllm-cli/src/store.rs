//! On-disk model storage.
//!
//! Layout: `<cache_dir>/<model id with '/' replaced by "__">/<file>.gguf`.
//! A model identifier may also be a direct path to a `.gguf` file.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

/// First four bytes of every GGUF file.
pub const GGUF_MAGIC: &[u8; 4] = b"GGUF";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Model not found in store: {0}")]
    NotFound(String),

    #[error("No .gguf file for '{id}' in {dir}")]
    NoWeights { id: String, dir: PathBuf },

    #[error("Not a GGUF file: {0}")]
    InvalidGguf(PathBuf),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One model found in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredModel {
    pub id: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ModelStore {
    root: PathBuf,
}

impl ModelStore {
    /// Create a store rooted at the given directory, creating it if needed.
    pub fn new(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The directory holding the weights of `id`.
    pub fn model_dir(&self, id: &str) -> PathBuf {
        self.root.join(id.replace('/', "__"))
    }

    /// Resolve `id` to a validated `.gguf` path.
    ///
    /// Direct file paths are accepted as-is. A stored model with several
    /// weight files resolves to the first in lexical order.
    pub fn resolve(&self, id: &str) -> StoreResult<PathBuf> {
        let direct = Path::new(id);
        if direct.is_file() {
            validate_gguf(direct)?;
            return Ok(direct.to_path_buf());
        }

        let dir = self.model_dir(id);
        if !dir.is_dir() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        let path = gguf_files(&dir)?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::NoWeights { id: id.to_string(), dir: dir.clone() })?;
        validate_gguf(&path)?;
        debug!(id, path = %path.display(), "Resolved model");
        Ok(path)
    }

    /// Every stored model with at least one `.gguf` file, sorted by id.
    pub fn list(&self) -> StoreResult<Vec<StoredModel>> {
        let mut models = Vec::new();
        if !self.root.exists() {
            return Ok(models);
        }
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().replace("__", "/");
            for path in gguf_files(&dir)? {
                let size_bytes = std::fs::metadata(&path)?.len();
                models.push(StoredModel { id: id.clone(), path, size_bytes });
            }
        }
        models.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.path.cmp(&b.path)));
        Ok(models)
    }
}

fn gguf_files(dir: &Path) -> StoreResult<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("gguf")))
        .collect();
    files.sort();
    Ok(files)
}

/// Check the GGUF magic before the file reaches a runtime.
pub fn validate_gguf(path: &Path) -> StoreResult<()> {
    let mut magic = [0u8; 4];
    let mut file = File::open(path)?;
    match file.read_exact(&mut magic) {
        Ok(()) if &magic == GGUF_MAGIC => Ok(()),
        Ok(()) => Err(StoreError::InvalidGguf(path.to_path_buf())),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(StoreError::InvalidGguf(path.to_path_buf()))
        }
        Err(e) => Err(StoreError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_gguf(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut bytes = GGUF_MAGIC.to_vec();
        bytes.extend_from_slice(&[3, 0, 0, 0]);
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_model_dir_encodes_slash() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ModelStore::new(tmp.path()).unwrap();
        let dir = store.model_dir("owner/repo");
        assert!(dir.ends_with("owner__repo"));
    }

    #[test]
    fn test_resolve_stored_model() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ModelStore::new(tmp.path()).unwrap();
        let weights = store.model_dir("qwen/tiny").join("tiny-q4.gguf");
        write_gguf(&weights);
        assert_eq!(store.resolve("qwen/tiny").unwrap(), weights);
    }

    #[test]
    fn test_resolve_picks_first_file_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ModelStore::new(tmp.path()).unwrap();
        let dir = store.model_dir("m");
        write_gguf(&dir.join("b.gguf"));
        write_gguf(&dir.join("a.gguf"));
        assert_eq!(store.resolve("m").unwrap(), dir.join("a.gguf"));
    }

    #[test]
    fn test_resolve_direct_path() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ModelStore::new(tmp.path().join("cache")).unwrap();
        let file = tmp.path().join("loose.gguf");
        write_gguf(&file);
        let id = file.to_string_lossy().to_string();
        assert_eq!(store.resolve(&id).unwrap(), file);
    }

    #[test]
    fn test_unknown_model_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ModelStore::new(tmp.path()).unwrap();
        assert!(matches!(store.resolve("nope/none"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_directory_without_weights() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ModelStore::new(tmp.path()).unwrap();
        let dir = store.model_dir("empty");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("README.md"), "hi").unwrap();
        assert!(matches!(store.resolve("empty"), Err(StoreError::NoWeights { .. })));
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ModelStore::new(tmp.path()).unwrap();
        let path = store.model_dir("fake").join("fake.gguf");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"PK\x03\x04zip").unwrap();
        assert!(matches!(store.resolve("fake"), Err(StoreError::InvalidGguf(_))));
    }

    #[test]
    fn test_truncated_file_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("short.gguf");
        std::fs::write(&path, b"GG").unwrap();
        assert!(matches!(validate_gguf(&path), Err(StoreError::InvalidGguf(_))));
    }

    #[test]
    fn test_list_models() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ModelStore::new(tmp.path()).unwrap();
        assert!(store.list().unwrap().is_empty(), "fresh store should have no models");

        write_gguf(&store.model_dir("org/b").join("b.gguf"));
        write_gguf(&store.model_dir("org/a").join("a.gguf"));
        std::fs::create_dir_all(store.model_dir("org/empty")).unwrap();

        let models = store.list().unwrap();
        let ids: Vec<&str> = models.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["org/a", "org/b"]);
        assert_eq!(models[0].size_bytes, 8);
    }
}
