//! Intake directory watcher.
//!
//! Polls a configured directory for new document files and feeds them into
//! the pipeline. Successfully ingested files are deleted (the content now
//! lives in the content store). Failed files are moved to a `failed/`
//! subdirectory so they don't wedge the scan loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ServiceError, ServiceResult};
use crate::service::PipelineService;

/// Supported file extensions for intake
const SUPPORTED_EXTENSIONS: &[&str] = &["pdf", "png", "jpg", "jpeg", "gif", "webp", "bmp", "tif", "tiff"];

/// Directory to skip when scanning (case-insensitive)
const FAILED_DIRECTORY: &str = "failed";

/// Interval between directory scans (in seconds)
const POLL_INTERVAL_SECS: u64 = 10;

/// Start the intake worker.
///
/// Called once on startup when `storage.intake_dir` is configured. The
/// worker polls the directory for new files and processes them one at a
/// time.
pub fn start_intake_worker(
    service: Arc<PipelineService>,
    intake_dir: PathBuf,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        info!(path = %intake_dir.display(), "Intake worker started");

        if let Err(e) = std::fs::create_dir_all(intake_dir.join(FAILED_DIRECTORY)) {
            error!(error = %e, "Failed to create intake failed directory, worker stopping");
            return;
        }

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match scan_and_process_one(&service, &intake_dir).await {
                Ok(Some(filename)) => {
                    info!(file = %filename, "Intake processed file");
                    continue;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(POLL_INTERVAL_SECS)) => {}
                    }
                }
                Err(e) => {
                    error!(error = %e, "Intake scan error");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(POLL_INTERVAL_SECS)) => {}
                    }
                }
            }
        }
        info!("Intake worker stopped");
    });
}

/// Scan the directory and process one file (sorted by path for determinism).
async fn scan_and_process_one(
    service: &PipelineService,
    intake_dir: &Path,
) -> ServiceResult<Option<String>> {
    let mut files = Vec::new();
    collect_files(intake_dir, &mut files).map_err(|e| ServiceError::Internal {
        message: format!("intake scan failed: {e}"),
    })?;

    if files.is_empty() {
        return Ok(None);
    }
    files.sort();

    let file_path = &files[0];
    let display_path = file_path
        .strip_prefix(intake_dir)
        .unwrap_or(file_path)
        .display()
        .to_string();
    debug!(file = %display_path, "Processing intake file");

    match process_file(service, file_path).await {
        Ok(()) => {
            if let Err(e) = std::fs::remove_file(file_path) {
                warn!(file = %display_path, error = %e, "Failed to delete ingested file");
            }
            Ok(Some(display_path))
        }
        Err(ServiceError::DuplicateDocument { document_id }) => {
            info!(
                file = %display_path,
                existing_doc_id = %document_id,
                "Skipped duplicate file (deleted)"
            );
            if let Err(e) = std::fs::remove_file(file_path) {
                warn!(file = %display_path, error = %e, "Failed to delete duplicate file");
            }
            Ok(Some(display_path))
        }
        Err(e) => {
            error!(file = %display_path, error = %e, "Intake failed");
            move_to_failed(file_path, intake_dir);
            Ok(Some(display_path))
        }
    }
}

/// Collect supported files from the intake directory, skipping failed/.
fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)?.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.is_dir() {
            if let Some(name) = path.file_name().and_then(|n| n.to_str())
                && name.eq_ignore_ascii_case(FAILED_DIRECTORY)
            {
                continue;
            }
            collect_files(&path, files)?;
        } else if path.is_file() && is_supported_format(&path) {
            files.push(path);
        }
    }
    Ok(())
}

/// Move a file to the failed/ directory.
fn move_to_failed(file_path: &Path, base_dir: &Path) {
    let Some(filename) = file_path.file_name() else {
        return;
    };
    let dest = base_dir.join(FAILED_DIRECTORY).join(filename);

    if let Err(e) = std::fs::rename(file_path, &dest) {
        warn!(
            file = %file_path.display(),
            dest = %dest.display(),
            error = %e,
            "Failed to move file to failed/, leaving in place"
        );
    }
}

/// Check if a file has a supported extension.
fn is_supported_format(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| SUPPORTED_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Declared content type derived from the file extension, if known.
fn declared_type_for(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    let mime = match ext.as_str() {
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        _ => return None,
    };
    Some(mime.to_string())
}

/// Ingest a single file.
async fn process_file(service: &PipelineService, file_path: &Path) -> ServiceResult<()> {
    let filename = file_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("document");

    let content = std::fs::read(file_path).map_err(|e| ServiceError::Internal {
        message: format!("failed to read intake file: {e}"),
    })?;

    // Derive the title from the filename (without extension).
    let title = file_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename)
        .to_string();

    let record = service
        .create_document(&title, filename, declared_type_for(file_path), &content)
        .await?;

    info!(
        doc_id = %record.id,
        title = %title,
        "Intake document queued for extraction"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supported_formats_match_extraction_capabilities() {
        assert!(is_supported_format(&PathBuf::from("scan.pdf")));
        assert!(is_supported_format(&PathBuf::from("scan.PDF")));
        assert!(is_supported_format(&PathBuf::from("page.png")));
        assert!(is_supported_format(&PathBuf::from("photo.jpeg")));
        assert!(is_supported_format(&PathBuf::from("fax.tiff")));

        assert!(!is_supported_format(&PathBuf::from("notes.txt")));
        assert!(!is_supported_format(&PathBuf::from("book.epub")));
        assert!(!is_supported_format(&PathBuf::from("no_extension")));
    }

    #[test]
    fn declared_types_follow_extensions() {
        assert_eq!(
            declared_type_for(&PathBuf::from("a.pdf")).as_deref(),
            Some("application/pdf")
        );
        assert_eq!(
            declared_type_for(&PathBuf::from("a.JPG")).as_deref(),
            Some("image/jpeg")
        );
        assert_eq!(declared_type_for(&PathBuf::from("a.xyz")), None);
    }
}
