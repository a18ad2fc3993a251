use crate::config::StorageConfig;
use crate::error::Result;
use crate::models::ImageId;
use crate::utils::upload_extension;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use url::Url;
use zip::write::FileOptions;

/// Writes upscaled pages of one page session under
/// `<output_path>/<host>_<path>/`.
#[derive(Debug, Clone)]
pub struct StorageManager {
    config: StorageConfig,
    session_dir: PathBuf,
}

impl StorageManager {
    pub fn new(config: &StorageConfig, page_url: &Url) -> Self {
        let label = format!("{}{}", page_url.host_str().unwrap_or("page"), page_url.path());
        let session_dir = Path::new(&config.output_path).join(sanitize_filename(&label));
        Self {
            config: config.clone(),
            session_dir,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.save_upscaled
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    /// Saves one upscaled image; `sequence` keeps files in reading order.
    pub async fn save_upscaled(&self, sequence: u32, id: ImageId, data: &[u8]) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.session_dir).await?;
        let filename = format!("page_{:03}_{}.{}", sequence, id, upload_extension(data));
        let path = self.session_dir.join(filename);
        tokio::fs::write(&path, data).await?;
        debug!("[STORAGE] wrote {} bytes to {:?}", data.len(), path);
        Ok(path)
    }

    /// Zips every saved page of the session. `None` when nothing was saved.
    pub async fn create_archive(&self) -> Result<Option<PathBuf>> {
        if !tokio::fs::try_exists(&self.session_dir).await? {
            return Ok(None);
        }

        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.session_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_file() && path.extension().map_or(false, |e| e != "zip") {
                files.push(path);
            }
        }
        if files.is_empty() {
            return Ok(None);
        }
        files.sort();

        let zip_path = self.session_dir.join("upscaled.zip");
        info!("[STORAGE] creating archive {:?} with {} pages", zip_path, files.len());

        let file = std::fs::File::create(&zip_path)?;
        let mut zip = zip::ZipWriter::new(file);
        for path in &files {
            let name = match path.file_name() {
                Some(name) => name.to_string_lossy().into_owned(),
                None => continue,
            };
            zip.start_file(name, FileOptions::default())?;
            let content = tokio::fs::read(path).await?;
            zip.write_all(&content)?;
        }
        zip.finish()?;

        Ok(Some(zip_path))
    }
}

pub fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect::<String>()
        .trim_matches(|c| c == '.' || c == ' ' || c == '_')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;

    fn storage(dir: &TempDir) -> StorageManager {
        let config = StorageConfig {
            output_path: dir.path().to_string_lossy().into_owned(),
            save_upscaled: true,
            archive: true,
        };
        StorageManager::new(&config, &Url::parse("https://reader.example/manga/one/chapter-3").unwrap())
    }

    #[test]
    fn sanitizes_path_separators() {
        assert_eq!(sanitize_filename("reader.example/manga/one"), "reader.example_manga_one");
        assert_eq!(sanitize_filename("a:b?c*"), "a_b_c");
    }

    #[tokio::test]
    async fn saves_pages_in_session_directory() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        let id = ImageId::from_url("https://cdn.example/1.jpg");

        let path = tokio_test::assert_ok!(storage.save_upscaled(1, id, b"\x89PNG\r\n\x1a\n....").await);
        assert!(path.starts_with(dir.path().join("reader.example_manga_one_chapter-3")));
        assert_eq!(path.extension().unwrap(), "png");
        assert_eq!(std::fs::read(&path).unwrap(), b"\x89PNG\r\n\x1a\n....");
    }

    #[tokio::test]
    async fn archive_contains_saved_pages_in_order() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        assert!(storage.create_archive().await.unwrap().is_none());

        storage.save_upscaled(2, ImageId::from_url("b"), b"second").await.unwrap();
        storage.save_upscaled(1, ImageId::from_url("a"), b"first").await.unwrap();

        let zip_path = storage.create_archive().await.unwrap().unwrap();
        let mut archive = zip::ZipArchive::new(std::fs::File::open(zip_path).unwrap()).unwrap();
        assert_eq!(archive.len(), 2);
        let mut first = String::new();
        archive.by_index(0).unwrap().read_to_string(&mut first).unwrap();
        assert_eq!(first, "first");
    }
}
