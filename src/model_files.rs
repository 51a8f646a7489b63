use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use thiserror::Error;

use crate::backend::EngineError;
use crate::errors::{BridgeError, CreationReason};

pub const MAX_MODEL_SIZE_BYTES: u64 = 10 * 1024 * 1024 * 1024;
const BYTES_PER_MB: u64 = 1024 * 1024;
const TFLITE_IDENTIFIER: &[u8; 4] = b"TFL3";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFormat {
    Task,
    TfLite,
    Unknown,
}

impl ModelFormat {
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("task") => ModelFormat::Task,
            Some("tflite") => ModelFormat::TfLite,
            _ => ModelFormat::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ModelFormat::Task => "task",
            ModelFormat::TfLite => "tflite",
            ModelFormat::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelFileInfo {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub format: ModelFormat,
    pub recommendations: Vec<String>,
}

impl ModelFileInfo {
    pub fn size_mb(&self) -> u64 {
        self.size_bytes / BYTES_PER_MB
    }
}

#[derive(Debug, Error)]
pub enum ModelFileError {
    #[error("Model file does not exist: {}", .0.display())]
    Missing(PathBuf),

    #[error("Model file is not readable: {}: {}", .path.display(), .source)]
    Unreadable { path: PathBuf, source: io::Error },

    #[error("Model file is empty: {}", .0.display())]
    Empty(PathBuf),

    #[error("Model file too large: {size_mb} MB (max: {max_mb} MB)")]
    TooLarge { size_mb: u64, max_mb: u64 },

    #[error("Invalid {} file format: {}", .format.as_str(), .path.display())]
    BadMagic { format: ModelFormat, path: PathBuf },

    #[error("Unsafe asset name '{0}': only plain file names are allowed")]
    UnsafeName(String),

    #[error("Unsupported model URI '{0}': only file:// references can be resolved")]
    UnsupportedUri(String),

    #[error("Failed to copy {}: {}", .path.display(), .source)]
    Copy { path: PathBuf, source: io::Error },
}

impl ModelFileError {
    pub fn reason(&self) -> CreationReason {
        match self {
            ModelFileError::Missing(_)
            | ModelFileError::Unreadable { .. }
            | ModelFileError::UnsafeName(_)
            | ModelFileError::UnsupportedUri(_) => CreationReason::NotFound,
            ModelFileError::Empty(_) | ModelFileError::BadMagic { .. } => {
                CreationReason::UnsupportedFormat
            }
            ModelFileError::TooLarge { .. } => CreationReason::OutOfMemory,
            ModelFileError::Copy { .. } => CreationReason::Unknown,
        }
    }
}

impl From<ModelFileError> for EngineError {
    fn from(err: ModelFileError) -> Self {
        EngineError::new(err.reason(), err.to_string())
    }
}

impl From<ModelFileError> for BridgeError {
    fn from(err: ModelFileError) -> Self {
        BridgeError::creation(err.reason(), err.to_string())
    }
}

/// Checks that a model file exists, is readable, non-empty, within the hard
/// size ceiling and, for `.tflite`, carries the flatbuffer identifier.
pub fn validate_model(path: &Path) -> Result<ModelFileInfo, ModelFileError> {
    let meta = match fs::metadata(path) {
        Ok(meta) if meta.is_file() => meta,
        Ok(_) => return Err(ModelFileError::Missing(path.to_path_buf())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(ModelFileError::Missing(path.to_path_buf()))
        }
        Err(e) => {
            return Err(ModelFileError::Unreadable {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    let size_bytes = meta.len();
    if size_bytes == 0 {
        return Err(ModelFileError::Empty(path.to_path_buf()));
    }
    if size_bytes > MAX_MODEL_SIZE_BYTES {
        return Err(ModelFileError::TooLarge {
            size_mb: size_bytes / BYTES_PER_MB,
            max_mb: MAX_MODEL_SIZE_BYTES / BYTES_PER_MB,
        });
    }

    let mut header = [0u8; 8];
    let read = File::open(path)
        .and_then(|mut f| read_prefix(&mut f, &mut header))
        .map_err(|e| ModelFileError::Unreadable {
            path: path.to_path_buf(),
            source: e,
        })?;

    let format = ModelFormat::from_path(path);
    if format == ModelFormat::TfLite && !has_tflite_identifier(&header[..read]) {
        return Err(ModelFileError::BadMagic {
            format,
            path: path.to_path_buf(),
        });
    }

    let info = ModelFileInfo {
        path: path.to_path_buf(),
        size_bytes,
        format,
        recommendations: file_recommendations(size_bytes / BYTES_PER_MB, format),
    };
    Ok(info)
}

fn read_prefix(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

// The flatbuffer file identifier sits at offset 4; some exporters write it at
// the very start instead.
fn has_tflite_identifier(header: &[u8]) -> bool {
    let at = |offset: usize| {
        header
            .get(offset..offset + 4)
            .map(|b| b == TFLITE_IDENTIFIER)
            .unwrap_or(false)
    };
    at(4) || at(0)
}

fn file_recommendations(size_mb: u64, format: ModelFormat) -> Vec<String> {
    let mut out = Vec::new();
    if size_mb > 2000 {
        out.push(format!(
            "Very large model ({}MB) - ensure device has sufficient memory",
            size_mb
        ));
        out.push("Consider using a smaller model for better performance".to_string());
    } else if size_mb > 1000 {
        out.push(format!(
            "Large model ({}MB) - monitor memory usage during inference",
            size_mb
        ));
    } else if size_mb < 10 {
        out.push(format!(
            "Small model ({}MB) - may have limited capabilities",
            size_mb
        ));
    }

    match format {
        ModelFormat::Task => {
            out.push("Task bundle detected - tokenizer and weights load together".to_string())
        }
        ModelFormat::TfLite => out.push("TensorFlow Lite model detected".to_string()),
        ModelFormat::Unknown => {
            out.push("Unknown file format - ensure it is a valid MediaPipe model".to_string())
        }
    }
    out
}

/// Bundled assets and the writable directory models are materialised into.
#[derive(Debug, Clone)]
pub struct ModelStorage {
    assets_dir: PathBuf,
    files_dir: PathBuf,
}

impl ModelStorage {
    pub fn new(assets_dir: impl Into<PathBuf>, files_dir: impl Into<PathBuf>) -> Self {
        Self {
            assets_dir: assets_dir.into(),
            files_dir: files_dir.into(),
        }
    }

    pub fn files_dir(&self) -> &Path {
        &self.files_dir
    }

    /// Copies `name` from the assets dir into the files dir, reusing an
    /// existing copy.
    pub fn copy_asset(&self, name: &str) -> Result<PathBuf, ModelFileError> {
        let clean = name.trim();
        if !is_plain_file_name(clean) {
            return Err(ModelFileError::UnsafeName(name.to_string()));
        }

        let target = self.files_dir.join(clean);
        if target.is_file() {
            tracing::debug!(asset = clean, path = %target.display(), "asset already materialised");
            return Ok(target);
        }

        let source = self.assets_dir.join(clean);
        let mut input = File::open(&source).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                ModelFileError::Missing(source.clone())
            } else {
                ModelFileError::Unreadable {
                    path: source.clone(),
                    source: e,
                }
            }
        })?;

        fs::create_dir_all(&self.files_dir).map_err(|e| ModelFileError::Copy {
            path: self.files_dir.clone(),
            source: e,
        })?;

        persist_copy(&self.files_dir, clean, &mut input).map_err(|e| ModelFileError::Copy {
            path: target.clone(),
            source: e,
        })?;

        tracing::info!(asset = clean, path = %target.display(), "copied bundled asset to storage");
        Ok(target)
    }

    /// Accepts a plain path or a `file://` reference.
    pub fn resolve_reference(&self, reference: &str) -> Result<PathBuf, ModelFileError> {
        let raw = reference.trim();
        if let Some(rest) = raw.strip_prefix("file://") {
            return Ok(PathBuf::from(rest));
        }
        if raw.contains("://") {
            return Err(ModelFileError::UnsupportedUri(raw.to_string()));
        }
        Ok(PathBuf::from(raw))
    }
}

fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

fn tmp_name(file_name: &str) -> String {
    format!(
        "{}.{}.{}.tmp",
        file_name,
        std::process::id(),
        TMP_SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

/// Removes temp files of `file_name` left behind by other processes.
/// Temp files of this process belong to copies that may still be running.
fn sweep_stale_tmp(base_dir: &Path, file_name: &str) {
    let Ok(entries) = fs::read_dir(base_dir) else {
        return;
    };
    let pid = std::process::id().to_string();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(rest) = name
            .to_str()
            .and_then(|n| n.strip_prefix(file_name))
            .and_then(|n| n.strip_prefix('.'))
        else {
            continue;
        };
        let stale = match rest.split('.').collect::<Vec<_>>().as_slice() {
            ["tmp"] => true,
            [owner, seq, "tmp"] => {
                is_digits(owner) && is_digits(seq) && *owner != pid.as_str()
            }
            _ => false,
        };
        if stale && fs::remove_file(entry.path()).is_ok() {
            tracing::debug!(path = %entry.path().display(), "removed stale temp copy");
        }
    }
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// tmp + fsync + rename, so a crash never leaves a truncated model behind.
/// Every copy writes its own temp file; when several copies of the same
/// asset race, the first rename wins and the others reuse its result.
fn persist_copy(base_dir: &Path, file_name: &str, input: &mut impl Read) -> io::Result<PathBuf> {
    sweep_stale_tmp(base_dir, file_name);

    let tmp_path = base_dir.join(tmp_name(file_name));
    let final_path = base_dir.join(file_name);

    let mut tmp_file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&tmp_path)?;

    if let Err(e) = io::copy(input, &mut tmp_file) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }

    if let Err(e) = tmp_file.flush().and_then(|_| tmp_file.sync_all()) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }

    drop(tmp_file);

    if let Err(e) = fs::rename(&tmp_path, &final_path) {
        let _ = fs::remove_file(&tmp_path);
        if final_path.is_file() {
            return Ok(final_path);
        }
        return Err(e);
    }

    Ok(final_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn scratch_dir(tag: &str) -> PathBuf {
        let now_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let dir = std::env::temp_dir().join(format!("mpllm_{}_{}", tag, now_ns));
        fs::create_dir_all(&dir).expect("create scratch dir");
        dir
    }

    #[test]
    fn missing_file_is_classified_not_found() {
        let err = validate_model(Path::new("/bad/path/model.task")).expect_err("must fail");
        assert!(matches!(err, ModelFileError::Missing(_)));
        assert_eq!(err.reason(), CreationReason::NotFound);
    }

    #[test]
    fn empty_file_is_rejected_as_unsupported() {
        let dir = scratch_dir("empty");
        let path = dir.join("empty.task");
        fs::write(&path, b"").expect("write");

        let err = validate_model(&path).expect_err("empty must fail");
        assert_eq!(err.reason(), CreationReason::UnsupportedFormat);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn tflite_requires_flatbuffer_identifier() {
        let dir = scratch_dir("tflite");
        let good = dir.join("good.tflite");
        fs::write(&good, b"\x1c\x00\x00\x00TFL3rest-of-model").expect("write good");
        let bad = dir.join("bad.tflite");
        fs::write(&bad, b"GGUFnot-a-tflite").expect("write bad");

        let info = validate_model(&good).expect("good tflite");
        assert_eq!(info.format, ModelFormat::TfLite);
        assert_eq!(info.size_bytes, 21);
        assert!(info.recommendations.iter().any(|r| r.contains("Small model")));

        let err = validate_model(&bad).expect_err("bad tflite");
        assert!(matches!(err, ModelFileError::BadMagic { .. }));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn copy_asset_materialises_once_and_cleans_tmp() {
        let assets = scratch_dir("assets");
        let files = assets.join("files");
        fs::write(assets.join("gemma.task"), b"weights").expect("write asset");

        let storage = ModelStorage::new(&assets, &files);
        let copied = storage.copy_asset("gemma.task").expect("copy asset");
        assert_eq!(copied, files.join("gemma.task"));
        assert_eq!(fs::read(&copied).expect("read copy"), b"weights");
        assert!(tmp_files(&files).is_empty());

        // A second call reuses the copy even if the asset changed.
        fs::write(assets.join("gemma.task"), b"changed").expect("rewrite asset");
        let again = storage.copy_asset("gemma.task").expect("reuse");
        assert_eq!(fs::read(again).expect("read"), b"weights");

        let _ = fs::remove_dir_all(assets);
    }

    fn tmp_files(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .expect("read files dir")
            .flatten()
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .filter(|n| n.ends_with(".tmp"))
            .collect()
    }

    #[test]
    fn concurrent_copies_of_one_asset_all_succeed() {
        let assets = scratch_dir("assets_race");
        let files = assets.join("files");
        fs::write(assets.join("big.task"), vec![7u8; 256 * 1024]).expect("write asset");

        let storage = std::sync::Arc::new(ModelStorage::new(&assets, &files));
        let barrier = std::sync::Arc::new(std::sync::Barrier::new(4));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let storage = std::sync::Arc::clone(&storage);
                let barrier = std::sync::Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    storage.copy_asset("big.task").map_err(|e| e.to_string())
                })
            })
            .collect();

        for worker in workers {
            let copied = worker.join().expect("copy thread").expect("copy succeeds");
            assert_eq!(copied, files.join("big.task"));
        }
        assert_eq!(fs::read(files.join("big.task")).expect("read copy").len(), 256 * 1024);
        assert!(tmp_files(&files).is_empty());

        let _ = fs::remove_dir_all(assets);
    }

    #[test]
    fn leftover_tmp_from_a_crash_does_not_block_copies() {
        let assets = scratch_dir("assets_stale");
        let files = assets.join("files");
        fs::create_dir_all(&files).expect("files dir");
        fs::write(assets.join("gemma.task"), b"weights").expect("write asset");
        fs::write(files.join("gemma.task.tmp"), b"trunc").expect("legacy tmp");
        fs::write(files.join("gemma.task.999999999.0.tmp"), b"trunc").expect("crashed tmp");

        let storage = ModelStorage::new(&assets, &files);
        let copied = storage.copy_asset("gemma.task").expect("copy despite stale tmp");
        assert_eq!(fs::read(copied).expect("read copy"), b"weights");
        assert!(tmp_files(&files).is_empty());

        let _ = fs::remove_dir_all(assets);
    }

    #[test]
    fn copy_asset_rejects_traversal_and_missing_assets() {
        let assets = scratch_dir("assets_bad");
        let storage = ModelStorage::new(&assets, assets.join("files"));

        assert!(matches!(
            storage.copy_asset("../etc/passwd"),
            Err(ModelFileError::UnsafeName(_))
        ));
        assert!(matches!(
            storage.copy_asset("/abs.task"),
            Err(ModelFileError::UnsafeName(_))
        ));
        assert!(matches!(
            storage.copy_asset("nope.task"),
            Err(ModelFileError::Missing(_))
        ));
        let _ = fs::remove_dir_all(assets);
    }

    #[test]
    fn resolve_reference_handles_paths_and_uris() {
        let storage = ModelStorage::new("assets", "files");
        assert_eq!(
            storage.resolve_reference("file:///data/m.task").expect("file uri"),
            PathBuf::from("/data/m.task")
        );
        assert_eq!(
            storage.resolve_reference("models/m.task").expect("plain path"),
            PathBuf::from("models/m.task")
        );
        assert!(matches!(
            storage.resolve_reference("content://media/42"),
            Err(ModelFileError::UnsupportedUri(_))
        ));
    }
}
