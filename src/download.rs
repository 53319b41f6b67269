use crate::error::{Error, Result};
use crate::opamp::spec::DownloadableFile;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};

/// Directory under the temporary path that receives a verified archive
pub const EXTRACT_FOLDER: &str = "latest";

/// Fetches the archives offered in a packages-available message.
#[async_trait]
pub trait DownloadableFileManager: Send + Sync {
    /// Downloads `file`, verifies its content hash and stages it for the updater
    async fn fetch_and_extract_archive(&self, file: &DownloadableFile) -> Result<()>;
    /// Removes everything a failed or finished install left behind
    fn cleanup_artifacts(&self);
}

/// Joins `file` onto `dir`, refusing names that would land outside of `dir`
pub fn sanitize_archive_path(dir: &Path, file: &str) -> Result<PathBuf> {
    let mut depth = 0usize;
    for component in Path::new(file).components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir if depth > 0 => depth -= 1,
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::TaintedPath(PathBuf::from(file)))
            }
        }
    }
    Ok(dir.join(file))
}

/// Path the archive at `download_url` is saved to: `base` joined with the last URL path segment
pub fn output_file_path(base: &Path, download_url: &str) -> Result<PathBuf> {
    let url = url::Url::parse(download_url)
        .map_err(|e| Error::Download(format!("cannot parse url: {}", e)))?;
    let name = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| Error::Download("input url must have path".to_string()))?;
    sanitize_archive_path(base, name)
}

/// Constant time comparison of the SHA-256 of `contents` against `expected`
pub fn verify_content_hash(contents: &[u8], expected: &[u8]) -> Result<()> {
    let actual = Sha256::digest(contents);
    if actual.len() != expected.len() {
        return Err(Error::HashMismatch);
    }
    let diff = actual
        .iter()
        .zip(expected)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b));
    if diff != 0 {
        return Err(Error::HashMismatch);
    }
    Ok(())
}

#[cfg(feature = "http")]
pub use self::http::HttpDownloadableFileManager;

#[cfg(feature = "http")]
mod http {
    use super::*;
    use tokio::io::AsyncWriteExt;

    /// Downloads archives over HTTP(S) into a temporary directory.
    pub struct HttpDownloadableFileManager {
        tmp_path: PathBuf,
        client: reqwest::Client,
    }

    impl HttpDownloadableFileManager {
        pub fn new<P: Into<PathBuf>>(tmp_path: P) -> HttpDownloadableFileManager {
            HttpDownloadableFileManager {
                tmp_path: tmp_path.into(),
                client: reqwest::Client::new(),
            }
        }

        async fn download_file(&self, download_url: &str, out_path: &Path) -> Result<()> {
            let mut response = self.client.get(download_url).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(Error::Download(format!(
                    "got non-200 status code ({})",
                    status.as_u16()
                )));
            }

            let mut file = tokio::fs::File::create(out_path).await?;
            while let Some(chunk) = response.chunk().await? {
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            Ok(())
        }
    }

    #[async_trait]
    impl DownloadableFileManager for HttpDownloadableFileManager {
        async fn fetch_and_extract_archive(&self, file: &DownloadableFile) -> Result<()> {
            tokio::fs::create_dir_all(&self.tmp_path).await?;
            let archive_path = output_file_path(&self.tmp_path, &file.download_url)?;
            log::debug!(
                "downloading archive url={} path={}",
                file.download_url,
                archive_path.display()
            );
            self.download_file(&file.download_url, &archive_path).await?;

            let contents = tokio::fs::read(&archive_path).await?;
            verify_content_hash(&contents, &file.content_hash)?;

            let extract_path = self.tmp_path.join(EXTRACT_FOLDER);
            if tokio::fs::metadata(&extract_path).await.is_ok() {
                tokio::fs::remove_dir_all(&extract_path).await?;
            }
            tokio::fs::create_dir_all(&extract_path).await?;

            let file_name = archive_path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default();
            let staged = sanitize_archive_path(&extract_path, &file_name)?;
            tokio::fs::copy(&archive_path, &staged).await?;
            log::info!("archive verified and staged path={}", staged.display());
            Ok(())
        }

        fn cleanup_artifacts(&self) {
            if let Err(e) = std::fs::remove_dir_all(&self.tmp_path) {
                log::error!(
                    "failed to remove temporary directory path={} error={}",
                    self.tmp_path.display(),
                    e
                );
            }
        }
    }
}
