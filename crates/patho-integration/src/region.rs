//! 感兴趣区域裁剪

use async_trait::async_trait;
use image::{DynamicImage, ImageDecoder, ImageFormat, ImageReader};
use patho_core::{PathoError, Result, ValidationErrors};
use patho_storage::{StorageManager, REGION_IMAGES_DIR};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// 以原图像素为单位的矩形
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionRect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl RegionRect {
    /// 检查矩形非空且落在图像内
    pub fn check_within(&self, width: u32, height: u32) -> Result<()> {
        let mut errors = ValidationErrors::new();
        if self.w == 0 {
            errors.add("w", "must be positive");
        }
        if self.h == 0 {
            errors.add("h", "must be positive");
        }
        if u64::from(self.x) + u64::from(self.w) > u64::from(width) {
            errors.add("x", format!("region exceeds image width {}", width));
        }
        if u64::from(self.y) + u64::from(self.h) > u64::from(height) {
            errors.add("y", format!("region exceeds image height {}", height));
        }
        errors.into_result()
    }
}

/// 从切片中裁剪区域并保存，返回存储中的相对路径
#[async_trait]
pub trait RegionCropper: Send + Sync {
    async fn crop(&self, source_file: &str, rect: RegionRect) -> Result<String>;
}

/// 解码原图时默认允许的像素缓冲上限
pub const DEFAULT_MAX_DECODE_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// 基于 `image` 的裁剪实现，输出 PNG
///
/// 原图需要整张解码，像素缓冲超过 `max_decode_bytes` 时拒绝裁剪。
#[derive(Debug, Clone)]
pub struct ImageRegionCropper {
    storage: StorageManager,
    max_decode_bytes: u64,
}

impl ImageRegionCropper {
    pub fn new(storage: StorageManager) -> Self {
        Self {
            storage,
            max_decode_bytes: DEFAULT_MAX_DECODE_BYTES,
        }
    }

    pub fn with_max_decode_bytes(mut self, max_decode_bytes: u64) -> Self {
        self.max_decode_bytes = max_decode_bytes;
        self
    }

    fn region_path(source_file: &str, rect: RegionRect) -> String {
        let stem = crate::deepzoom::output_base_for(source_file);
        let name = stem.rsplit('/').next().unwrap_or(&stem).to_string();
        format!(
            "{}/{}_{}_{}_{}_{}.png",
            REGION_IMAGES_DIR, name, rect.x, rect.y, rect.w, rect.h
        )
    }
}

fn image_error(e: impl std::fmt::Display) -> PathoError {
    PathoError::Image(e.to_string())
}

fn crop_png(data: &[u8], rect: RegionRect, max_decode_bytes: u64) -> Result<Vec<u8>> {
    let mut reader = ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .map_err(image_error)?;
    // 像素缓冲由下面的显式上限约束
    reader.no_limits();

    // 先用图像头校验区域，再决定是否解码
    let decoder = reader.into_decoder().map_err(image_error)?;
    let (width, height) = decoder.dimensions();
    rect.check_within(width, height)?;
    let needed = decoder.total_bytes();
    if needed > max_decode_bytes {
        return Err(PathoError::invalid(
            "picture",
            format!(
                "{}x{} image needs {} bytes to decode, limit is {}",
                width, height, needed, max_decode_bytes
            ),
        ));
    }

    let img = DynamicImage::from_decoder(decoder).map_err(image_error)?;
    let region = img.crop_imm(rect.x, rect.y, rect.w, rect.h);
    let mut buf = Vec::new();
    region
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .map_err(image_error)?;
    Ok(buf)
}

#[async_trait]
impl RegionCropper for ImageRegionCropper {
    async fn crop(&self, source_file: &str, rect: RegionRect) -> Result<String> {
        let data = self.storage.get_file(source_file).await?;
        let max_decode_bytes = self.max_decode_bytes;
        let png = tokio::task::spawn_blocking(move || crop_png(&data, rect, max_decode_bytes))
            .await
            .map_err(|e| PathoError::Internal(format!("crop task failed: {}", e)))??;

        let relative = Self::region_path(source_file, rect);
        self.storage.store_file(&png, &relative).await?;
        tracing::info!("Cropped region {:?} from {} into {}", rect, source_file, relative);
        Ok(relative)
    }
}
