//! Deep Zoom 元数据
//!
//! 切图产物与原图同目录：`<stem>.dzi` 描述文件和 `<stem>_files/` 瓦片目录。

use patho_core::{PathoError, Result};
use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

pub const DEEPZOOM_XMLNS: &str = "http://schemas.microsoft.com/deepzoom/2009";

/// 拆出父目录和去掉扩展名的文件名
fn split_stem(file: &str) -> (Option<&str>, &str) {
    let (parent, name) = match file.rsplit_once('/') {
        Some((parent, name)) => (Some(parent), name),
        None => (None, file),
    };
    let stem = match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    };
    (parent, stem)
}

fn sibling(file: &str, suffix: &str) -> String {
    match split_stem(file) {
        (Some(parent), stem) => format!("{}/{}{}", parent, stem, suffix),
        (None, stem) => format!("{}{}", stem, suffix),
    }
}

/// 切图输出的基础路径（不带扩展名）
pub fn output_base_for(file: &str) -> String {
    sibling(file, "")
}

pub fn dzi_path_for(file: &str) -> String {
    sibling(file, ".dzi")
}

pub fn tiles_dir_for(file: &str) -> String {
    sibling(file, "_files")
}

fn image_tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<Image\b([^>]*)>").expect("valid regex"))
}

fn size_tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<Size\b([^>]*)/?>").expect("valid regex"))
}

fn attribute_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(\w+)\s*=\s*"([^"]*)""#).expect("valid regex"))
}

fn attribute<'a>(attrs: &'a str, name: &str) -> Option<&'a str> {
    attribute_regex()
        .captures_iter(attrs)
        .find(|c| &c[1] == name)
        .and_then(|c| c.get(2))
        .map(|m| m.as_str())
}

fn numeric<T: std::str::FromStr>(attrs: &str, name: &str) -> Result<T> {
    let raw = attribute(attrs, name)
        .ok_or_else(|| PathoError::Tiling(format!("dzi is missing attribute {}", name)))?;
    raw.trim()
        .parse()
        .map_err(|_| PathoError::Tiling(format!("dzi attribute {} is not a number: '{}'", name, raw)))
}

/// `.dzi` 描述文件内容
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeepZoomDescriptor {
    pub tile_size: u32,
    pub overlap: u32,
    pub format: String,
    pub width: u64,
    pub height: u64,
}

impl DeepZoomDescriptor {
    pub fn parse(xml: &str) -> Result<Self> {
        let image = image_tag_regex()
            .captures(xml)
            .and_then(|c| c.get(1))
            .ok_or_else(|| PathoError::Tiling("dzi has no Image element".to_string()))?
            .as_str();
        let size = size_tag_regex()
            .captures(xml)
            .and_then(|c| c.get(1))
            .ok_or_else(|| PathoError::Tiling("dzi has no Size element".to_string()))?
            .as_str();

        let format = attribute(image, "Format")
            .ok_or_else(|| PathoError::Tiling("dzi is missing attribute Format".to_string()))?
            .to_string();

        Ok(Self {
            tile_size: numeric(image, "TileSize")?,
            overlap: numeric(image, "Overlap")?,
            format,
            width: numeric(size, "Width")?,
            height: numeric(size, "Height")?,
        })
    }

    pub fn to_xml(&self) -> String {
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
             <Image xmlns=\"{}\" Format=\"{}\" Overlap=\"{}\" TileSize=\"{}\">\
             <Size Height=\"{}\" Width=\"{}\"/></Image>\n",
            DEEPZOOM_XMLNS, self.format, self.overlap, self.tile_size, self.height, self.width
        )
    }

    /// 供前端查看器使用的 JSON 视图，`tiles_url` 指向瓦片目录
    pub fn to_view(&self, tiles_url: &str) -> DeepZoomView {
        let url = if tiles_url.ends_with('/') {
            tiles_url.to_string()
        } else {
            format!("{}/", tiles_url)
        };
        DeepZoomView {
            image: DeepZoomImage {
                xmlns: DEEPZOOM_XMLNS.to_string(),
                url,
                overlap: self.overlap,
                tile_size: self.tile_size,
                format: self.format.clone(),
                size: DeepZoomSize {
                    height: self.height,
                    width: self.width,
                },
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeepZoomView {
    #[serde(rename = "Image")]
    pub image: DeepZoomImage,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeepZoomImage {
    #[serde(rename = "xmlns")]
    pub xmlns: String,
    pub url: String,
    pub overlap: u32,
    pub tile_size: u32,
    pub format: String,
    pub size: DeepZoomSize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeepZoomSize {
    pub height: u64,
    pub width: u64,
}
