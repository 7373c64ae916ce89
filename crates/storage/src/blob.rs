use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use snafu::{ResultExt, ensure};
use uuid::Uuid;

use super::error::{BlobExistsSnafu, BlobKeyInvalidSnafu, BlobWriteSnafu, StorageResult};
use super::types::BlobPath;

/// Attachment bytes live here; messages only ever keep the resulting URL.
pub trait BlobStore: Send + Sync {
    fn upload(&self, key: &str, bytes: &[u8]) -> StorageResult<BlobPath>;
    fn public_url(&self, path: &BlobPath) -> String;
}

/// Blob store backed by a local directory and served under `public_base_url`.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
    public_base_url: String,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into().trim().trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl BlobStore for FsBlobStore {
    fn upload(&self, key: &str, bytes: &[u8]) -> StorageResult<BlobPath> {
        validate_blob_key(key, "blob-upload-validate-key")?;

        std::fs::create_dir_all(&self.root).context(BlobWriteSnafu {
            stage: "blob-upload-create-root",
            path: self.root.display().to_string(),
        })?;

        let target = self.root.join(key);
        let temp_path = self
            .root
            .join(format!(".{key}.{}.partial", Uuid::now_v7().simple()));
        std::fs::write(&temp_path, bytes).context(BlobWriteSnafu {
            stage: "blob-upload-write-temporary",
            path: temp_path.display().to_string(),
        })?;

        // Linking never replaces an existing object, unlike rename.
        let published = std::fs::hard_link(&temp_path, &target);
        if let Err(error) = std::fs::remove_file(&temp_path) {
            tracing::warn!(path = %temp_path.display(), error = %error, "failed to remove blob temp file");
        }
        match published {
            Ok(()) => {}
            Err(error) if error.kind() == ErrorKind::AlreadyExists => {
                return BlobExistsSnafu {
                    stage: "blob-upload-link",
                    key: key.to_string(),
                }
                .fail();
            }
            Err(error) => {
                return Err(error).context(BlobWriteSnafu {
                    stage: "blob-upload-link",
                    path: target.display().to_string(),
                });
            }
        }

        tracing::debug!(key, size_bytes = bytes.len(), "blob uploaded");
        Ok(BlobPath(key.to_string()))
    }

    fn public_url(&self, path: &BlobPath) -> String {
        format!("{}/{}", self.public_base_url, path.as_str())
    }
}

fn validate_blob_key(key: &str, stage: &'static str) -> StorageResult<()> {
    let is_plain_name = !key.trim().is_empty()
        && !key.contains(['/', '\\'])
        && key != "."
        && key != ".."
        && !key.starts_with('.');
    ensure!(
        is_plain_name,
        BlobKeyInvalidSnafu {
            stage,
            key: key.to_string(),
        }
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StorageError;

    #[test]
    fn upload_writes_bytes_and_maps_to_public_url() {
        let directory = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(directory.path().join("attachments"), "https://cdn.test/files/");

        let path = store.upload("1700000000000-photo.png", b"png-bytes").unwrap();

        assert_eq!(
            std::fs::read(store.root().join("1700000000000-photo.png")).unwrap(),
            b"png-bytes"
        );
        assert_eq!(
            store.public_url(&path),
            "https://cdn.test/files/1700000000000-photo.png"
        );
    }

    #[test]
    fn upload_never_replaces_an_existing_object() {
        let directory = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(directory.path(), "https://cdn.test");
        store.upload("1700000000000-note.txt", b"first").unwrap();

        let error = store.upload("1700000000000-note.txt", b"second").unwrap_err();

        assert!(matches!(error, StorageError::BlobExists { .. }));
        assert_eq!(
            std::fs::read(store.root().join("1700000000000-note.txt")).unwrap(),
            b"first"
        );
        let leftovers = std::fs::read_dir(store.root())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".partial"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn traversal_keys_are_rejected() {
        let directory = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(directory.path(), "https://cdn.test");

        for key in ["", "..", "../escape", "nested/file", ".hidden"] {
            let error = store.upload(key, b"x").unwrap_err();
            assert!(
                matches!(error, StorageError::BlobKeyInvalid { .. }),
                "key {key:?} should be rejected"
            );
        }
    }
}
