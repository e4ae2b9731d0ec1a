//! Local model store
//!
//! Lists installed models and resolves where a model should be loaded from,
//! downloading it into the models directory when needed.

use crate::inference::model::is_gguf_file;
use crate::storage::StorageError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Used when a URL has no usable last path segment
pub const FALLBACK_MODEL_NAME: &str = "model.gguf";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

const HASH_BUFFER_SIZE: usize = 1024 * 1024;

/// A model file found on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelFile {
    /// Full path to the model file
    pub path: PathBuf,
    /// Filename of the model
    pub filename: String,
    /// File size in bytes
    pub size_bytes: u64,
    /// Last modification time
    pub last_modified: SystemTime,
    /// Whether the GGUF header checks out
    pub valid_header: bool,
}

impl ModelFile {
    fn from_path(path: PathBuf) -> Result<Self, std::io::Error> {
        let metadata = fs::metadata(&path)?;
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();

        Ok(Self {
            valid_header: is_gguf_file(&path),
            path,
            filename,
            size_bytes: metadata.len(),
            last_modified: metadata.modified()?,
        })
    }

    /// Get a human-readable size string
    pub fn size_string(&self) -> String {
        const UNITS: [&str; 3] = ["KB", "MB", "GB"];

        let mut size = self.size_bytes as f64;
        if size < 1024.0 {
            return format!("{} B", self.size_bytes);
        }
        let mut unit = UNITS[0];
        for candidate in UNITS {
            unit = candidate;
            size /= 1024.0;
            if size < 1024.0 {
                break;
            }
        }
        format!("{:.2} {}", size, unit)
    }
}

fn has_gguf_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case("gguf"))
        .unwrap_or(false)
}

/// Lists the `.gguf` files in `directory`, sorted by name.
///
/// A missing directory is an empty store, not an error.
pub fn scan_models_directory(directory: &Path) -> Result<Vec<ModelFile>, StorageError> {
    if !directory.is_dir() {
        tracing::warn!("Models directory does not exist: {}", directory.display());
        return Ok(vec![]);
    }

    let mut models = vec![];
    for entry in fs::read_dir(directory)? {
        let path = entry?.path();
        if !path.is_file() || !has_gguf_extension(&path) {
            continue;
        }
        match ModelFile::from_path(path.clone()) {
            Ok(model) => {
                tracing::debug!("Found model: {}", model.filename);
                models.push(model);
            }
            Err(e) => tracing::warn!("Failed to read model file {:?}: {}", path, e),
        }
    }

    models.sort_by(|a, b| a.filename.cmp(&b.filename));
    tracing::info!("Found {} model(s) in {}", models.len(), directory.display());
    Ok(models)
}

/// A name that stays inside the directory it is joined to
fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\', ':'])
}

/// Last path segment of `url`, or [`FALLBACK_MODEL_NAME`] when that segment
/// is missing or would escape the models directory.
pub fn file_name_from_url(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let name = match path.rsplit_once('/') {
        Some((_, name)) => name,
        None => path,
    };
    if is_plain_file_name(name) {
        name.to_string()
    } else {
        FALLBACK_MODEL_NAME.to_string()
    }
}

/// Lowercase hex SHA-256 of the file at `path`
pub async fn sha256_file(path: &Path) -> Result<String, StorageError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Hex digests compare case-insensitively
pub fn digest_matches(expected: &str, actual: &str) -> bool {
    expected.trim().eq_ignore_ascii_case(actual.trim())
}

fn checksum_mismatch(path: &Path, expected: &str, actual: String) -> StorageError {
    StorageError::ChecksumMismatch {
        path: path.to_path_buf(),
        expected: expected.trim().to_ascii_lowercase(),
        actual,
    }
}

/// Candidate locations of a model, tried in field order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSource {
    /// Explicit path; used only if it names an existing file
    pub path: Option<PathBuf>,
    /// Name of a file already in the models directory
    pub file_name: Option<String>,
    /// Downloaded into the models directory unless already present
    pub remote_url: Option<String>,
    /// Hex SHA-256 the resolved file must have
    #[serde(default)]
    pub expected_sha256: Option<String>,
}

impl ModelSource {
    pub fn from_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Resolution without the network; `None` means a download is needed
    /// (or nothing matched).
    pub fn resolve_local(&self, models_dir: &Path) -> Option<PathBuf> {
        if let Some(path) = self.path.as_ref().filter(|p| p.is_file()) {
            return Some(path.clone());
        }
        if let Some(name) = &self.file_name {
            let candidate = models_dir.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        let url = self.remote_url.as_deref()?;
        let candidate = models_dir.join(file_name_from_url(url));
        candidate.is_file().then_some(candidate)
    }
}

/// Finds or fetches the model described by `source`.
///
/// With `expected_sha256` set, a local file must match it. A mismatching file
/// inside the models directory is deleted and fetched again when a URL is
/// known; a mismatching file elsewhere is rejected but left alone.
pub async fn resolve_model(source: &ModelSource, models_dir: &Path) -> Result<PathBuf, StorageError> {
    let expected = source.expected_sha256.as_deref().filter(|s| !s.trim().is_empty());

    if let Some(path) = source.resolve_local(models_dir) {
        let Some(expected) = expected else {
            tracing::info!("Using model at {}", path.display());
            return Ok(path);
        };

        let actual = sha256_file(&path).await?;
        if digest_matches(expected, &actual) {
            tracing::info!("Using verified model at {}", path.display());
            return Ok(path);
        }
        tracing::warn!("Checksum mismatch for {}", path.display());

        if !path.starts_with(models_dir) {
            return Err(checksum_mismatch(&path, expected, actual));
        }
        tokio::fs::remove_file(&path).await?;
        if source.remote_url.is_none() {
            return Err(checksum_mismatch(&path, expected, actual));
        }
    }

    match &source.remote_url {
        Some(url) => download_model(url, models_dir, expected).await,
        None => Err(StorageError::ModelNotFound(format!("{:?}", source))),
    }
}

/// Streams `url` into `models_dir`.
///
/// Data goes to a `.part` file that is renamed once complete, so an
/// interrupted or corrupt download never looks like a finished model. The
/// digest is computed while streaming and checked before the rename.
pub async fn download_model(
    url: &str,
    models_dir: &Path,
    expected_sha256: Option<&str>,
) -> Result<PathBuf, StorageError> {
    tokio::fs::create_dir_all(models_dir).await?;
    let target = models_dir.join(file_name_from_url(url));
    let partial = target.with_file_name(format!(
        "{}.part",
        target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| FALLBACK_MODEL_NAME.to_string())
    ));

    tracing::info!("Downloading {} to {}", url, target.display());

    let client = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()?;
    let mut response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(StorageError::Download(format!("HTTP {}", response.status())));
    }

    let mut file = tokio::fs::File::create(&partial).await?;
    let mut hasher = Sha256::new();
    let mut written: u64 = 0;
    let streamed = async {
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            hasher.update(&chunk);
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok::<(), StorageError>(())
    }
    .await;

    if let Err(e) = streamed {
        tracing::warn!("Download of {} failed after {} bytes: {}", url, written, e);
        drop(file);
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(e);
    }
    drop(file);

    if let Some(expected) = expected_sha256 {
        let actual = format!("{:x}", hasher.finalize());
        if !digest_matches(expected, &actual) {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(checksum_mismatch(&target, expected, actual));
        }
    }

    tokio::fs::rename(&partial, &target).await?;
    tracing::info!("Downloaded {} bytes to {}", written, target.display());
    Ok(target)
}
