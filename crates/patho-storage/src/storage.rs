//! 影像存储管理

use patho_core::{PathoError, Result};
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// 原始切片图片所在的子目录
pub const ORIGIN_IMAGES_DIR: &str = "origin";
/// 区域图所在的子目录
pub const REGION_IMAGES_DIR: &str = "region";

/// 已写入的文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    /// 相对存储根目录的路径，使用 `/` 分隔
    pub relative_path: String,
    pub checksum: String,
    pub size: u64,
}

/// 正在写入的上传文件，边写边计算 SHA-256
///
/// 调用 `finish` 得到 [`StoredFile`]，放弃时调用 `abort` 删除已写入的部分。
pub struct UploadWriter {
    file: File,
    full_path: PathBuf,
    relative_path: String,
    hasher: Sha256,
    size: u64,
}

impl UploadWriter {
    pub fn relative_path(&self) -> &str {
        &self.relative_path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.file.write_all(chunk).await?;
        self.hasher.update(chunk);
        self.size += chunk.len() as u64;
        Ok(())
    }

    pub async fn finish(mut self) -> Result<StoredFile> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        tracing::debug!(path = %self.relative_path, size = self.size, "Stored upload");
        Ok(StoredFile {
            relative_path: self.relative_path,
            checksum: format!("{:x}", self.hasher.finalize()),
            size: self.size,
        })
    }

    pub async fn abort(self) -> Result<()> {
        drop(self.file);
        match tokio::fs::remove_file(&self.full_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// 只保留文件名中的安全字符
fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}

/// 存储管理器
#[derive(Debug, Clone)]
pub struct StorageManager {
    base_path: PathBuf,
}

impl StorageManager {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// 把相对路径解析为绝对路径，拒绝越出根目录的路径
    pub fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let candidate = Path::new(relative);
        let safe = candidate
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if relative.is_empty() || !safe {
            return Err(PathoError::Storage(format!("invalid storage path '{}'", relative)));
        }
        Ok(self.base_path.join(candidate))
    }

    /// 开始写入一个上传文件，每次上传得到独立的路径
    pub async fn begin_upload(&self, dir: &str, original_name: &str) -> Result<UploadWriter> {
        let relative_path = format!(
            "{}/{}_{}",
            dir,
            Uuid::new_v4().simple(),
            sanitize_file_name(original_name)
        );
        let full_path = self.resolve(&relative_path)?;
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = File::create(&full_path).await?;

        Ok(UploadWriter {
            file,
            full_path,
            relative_path,
            hasher: Sha256::new(),
            size: 0,
        })
    }

    /// 一次性存储已在内存中的上传内容
    pub async fn store_upload(&self, dir: &str, original_name: &str, data: &[u8]) -> Result<StoredFile> {
        let mut writer = self.begin_upload(dir, original_name).await?;
        if let Err(e) = writer.write_chunk(data).await {
            writer.abort().await?;
            return Err(e);
        }
        writer.finish().await
    }

    /// 写入文件
    pub async fn store_file(&self, data: &[u8], relative: &str) -> Result<PathBuf> {
        let full_path = self.resolve(relative)?;
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tokio::fs::write(&full_path, data).await?;
        Ok(full_path)
    }

    /// 获取文件
    pub async fn get_file(&self, relative: &str) -> Result<Vec<u8>> {
        let full_path = self.resolve(relative)?;
        match tokio::fs::read(&full_path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(PathoError::Storage(
                format!("stored file '{}' is missing", relative),
            )),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists(&self, relative: &str) -> Result<bool> {
        let full_path = self.resolve(relative)?;
        Ok(tokio::fs::try_exists(full_path).await?)
    }

    /// 删除文件，文件不存在不算错误
    pub async fn remove_file(&self, relative: &str) -> Result<()> {
        let full_path = self.resolve(relative)?;
        match tokio::fs::remove_file(&full_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// 删除目录树，目录不存在不算错误
    pub async fn remove_dir(&self, relative: &str) -> Result<()> {
        let full_path = self.resolve(relative)?;
        match tokio::fs::remove_dir_all(&full_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sha256_hex(data: &[u8]) -> String {
        format!("{:x}", Sha256::digest(data))
    }

    #[tokio::test]
    async fn test_upload_checksum_is_hex_sha256() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageManager::new(dir.path());
        let mut writer = storage.begin_upload(ORIGIN_IMAGES_DIR, "abc.txt").await.unwrap();
        writer.write_chunk(b"a").await.unwrap();
        writer.write_chunk(b"bc").await.unwrap();
        let stored = writer.finish().await.unwrap();
        assert_eq!(
            stored.checksum,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("slide 01.tif"), "slide_01.tif");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\scans\\a.svs"), "a.svs");
        assert_eq!(sanitize_file_name(".."), "upload");
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        let storage = StorageManager::new("/media");
        assert_eq!(
            storage.resolve("origin/a.tif").unwrap(),
            PathBuf::from("/media/origin/a.tif")
        );
        assert!(storage.resolve("../secret").is_err());
        assert!(storage.resolve("/etc/passwd").is_err());
        assert!(storage.resolve("").is_err());
    }

    #[tokio::test]
    async fn test_store_and_read_upload() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageManager::new(dir.path());

        let stored = storage
            .store_upload(ORIGIN_IMAGES_DIR, "HE slide.png", b"pixels")
            .await
            .unwrap();
        assert!(stored.relative_path.starts_with("origin/"));
        assert!(stored.relative_path.ends_with("_HE_slide.png"));
        assert_eq!(stored.size, 6);
        assert_eq!(stored.checksum, sha256_hex(b"pixels"));

        let again = storage
            .store_upload(ORIGIN_IMAGES_DIR, "HE slide.png", b"pixels")
            .await
            .unwrap();
        assert_ne!(again.relative_path, stored.relative_path);

        assert_eq!(storage.get_file(&stored.relative_path).await.unwrap(), b"pixels");
        assert!(storage.exists(&stored.relative_path).await.unwrap());

        storage.remove_file(&stored.relative_path).await.unwrap();
        storage.remove_file(&stored.relative_path).await.unwrap();
        assert!(matches!(
            storage.get_file(&stored.relative_path).await,
            Err(PathoError::Storage(_))
        ));
    }

    #[tokio::test]
    async fn test_streamed_upload() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageManager::new(dir.path());

        let mut writer = storage
            .begin_upload(ORIGIN_IMAGES_DIR, "big.tif")
            .await
            .unwrap();
        let chunk = vec![7u8; 64 * 1024];
        for _ in 0..16 {
            writer.write_chunk(&chunk).await.unwrap();
        }
        assert_eq!(writer.size(), 16 * 64 * 1024);
        let stored = writer.finish().await.unwrap();

        let content = storage.get_file(&stored.relative_path).await.unwrap();
        assert_eq!(content.len(), 16 * 64 * 1024);
        assert_eq!(stored.size, content.len() as u64);
        assert_eq!(stored.checksum, sha256_hex(&content));
    }

    #[tokio::test]
    async fn test_aborted_upload_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageManager::new(dir.path());

        let mut writer = storage
            .begin_upload(ORIGIN_IMAGES_DIR, "partial.tif")
            .await
            .unwrap();
        writer.write_chunk(b"half a slide").await.unwrap();
        let relative = writer.relative_path().to_string();
        assert!(storage.exists(&relative).await.unwrap());

        writer.abort().await.unwrap();
        assert!(!storage.exists(&relative).await.unwrap());
    }
}
