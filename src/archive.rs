//! Download-once cache for zipped datasets.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use zip::ZipArchive;

use crate::errors::{AppError, AppResult};
use crate::sources::ensure_success;

/// Returns the first file under `dir` with `extension`, downloading and
/// unpacking `url` into `dir` when none is there yet.
pub async fn ensure_dataset(
    http: &reqwest::Client,
    url: &str,
    dir: &Path,
    extension: &str,
    timeout: Duration,
) -> AppResult<PathBuf> {
    if let Some(found) = find_with_extension(dir, extension)? {
        debug!(path = %found.display(), "using cached dataset");
        return Ok(found);
    }

    tokio::fs::create_dir_all(dir).await?;
    let zip_path = dir.join("download.zip");
    let partial = dir.join("download.zip.part");
    info!(url, target = %dir.display(), "downloading dataset");
    let bytes = download(http, url, &partial, timeout).await?;
    tokio::fs::rename(&partial, &zip_path).await?;
    info!(bytes, "dataset downloaded; extracting");

    let archive = zip_path.clone();
    let target = dir.to_path_buf();
    tokio::task::spawn_blocking(move || extract_zip(&archive, &target))
        .await
        .map_err(|err| AppError::Io(io::Error::other(err.to_string())))??;
    tokio::fs::remove_file(&zip_path).await?;

    find_with_extension(dir, extension)?.ok_or_else(|| {
        AppError::Path(format!(
            "archive from {url} contained no .{extension} file"
        ))
    })
}

async fn download(
    http: &reqwest::Client,
    url: &str,
    destination: &Path,
    timeout: Duration,
) -> AppResult<u64> {
    let response = http.get(url).timeout(timeout).send().await?;
    let response = ensure_success("dataset download", response).await?;
    let mut file = tokio::fs::File::create(destination).await?;
    let mut stream = response.bytes_stream();
    let mut written = 0_u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        written += chunk.len() as u64;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(written)
}

pub fn extract_zip(zip_path: &Path, target_dir: &Path) -> AppResult<()> {
    let file = fs::File::open(zip_path)?;
    let mut archive = ZipArchive::new(file)?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => target_dir.join(path),
            None => {
                return Err(AppError::Path(
                    "zip entry path traversal detected".to_string(),
                ));
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&entry_path)?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut outfile = fs::File::create(&entry_path)?;
        io::copy(&mut entry, &mut outfile)?;
    }
    Ok(())
}

/// Depth-first search, entries visited in name order so the result is stable.
pub fn find_with_extension(dir: &Path, extension: &str) -> AppResult<Option<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let mut paths = entries
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()?;
    paths.sort();

    for path in &paths {
        let matches = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(extension));
        if path.is_file() && matches {
            return Ok(Some(path.clone()));
        }
    }
    for path in paths.iter().filter(|path| path.is_dir()) {
        if let Some(found) = find_with_extension(path, extension)? {
            return Ok(Some(found));
        }
    }
    Ok(None)
}
