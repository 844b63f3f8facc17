//! Word 模板渲染
//!
//! 模板是普通的 docx 包，正文、页眉和页脚中的 `{{ name }}` 占位符被替换为
//! 上下文中的值。文本值先转义再写入，图片值作为新的媒体部件和关系内嵌。

use crate::escape::text_to_wordml;
use crate::projection::{InlineImage, ReportContext, ReportValue};
use patho_core::{PathoError, Result};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Cursor, Read, Write};
use std::path::Path;
use std::sync::OnceLock;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const DOCUMENT_PART: &str = "word/document.xml";
const CONTENT_TYPES_PART: &str = "[Content_Types].xml";
const RELATIONSHIPS_NS: &str = "http://schemas.openxmlformats.org/package/2006/relationships";
const IMAGE_REL_TYPE: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/image";
const EMU_PER_MM: f64 = 36_000.0;

fn zip_error(e: zip::result::ZipError) -> PathoError {
    PathoError::Template(format!("invalid docx package: {}", e))
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{([^{}]*)\}\}").expect("valid regex"))
}

fn is_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// 正文、页眉和页脚参与替换
fn is_templated_part(name: &str) -> bool {
    if name == DOCUMENT_PART {
        return true;
    }
    match name.strip_prefix("word/") {
        Some(rest) => {
            !rest.contains('/')
                && rest.ends_with(".xml")
                && (rest.starts_with("header") || rest.starts_with("footer"))
        }
        None => false,
    }
}

/// `word/document.xml` → `word/_rels/document.xml.rels`
fn rels_path_for(part_name: &str) -> String {
    match part_name.rsplit_once('/') {
        Some((dir, file)) => format!("{}/_rels/{}.rels", dir, file),
        None => format!("_rels/{}.rels", part_name),
    }
}

fn mm_to_emu(mm: f64) -> i64 {
    (mm * EMU_PER_MM).round() as i64
}

/// 合并被 Word 拆到多个 run 中的占位符
///
/// 从 `{{` 到 `}}` 之间的标签全部去掉，占位符文本落到第一个 run 里。
pub(crate) fn collapse_placeholders(xml: &str) -> Result<String> {
    let mut text: Vec<(usize, char)> = Vec::new();
    let mut in_tag = false;
    for (i, c) in xml.char_indices() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            c if !in_tag => text.push((i, c)),
            _ => {}
        }
    }

    let opens_at = |k: usize| text[k].1 == '{' && text.get(k + 1).map(|t| t.1) == Some('{');
    let closes_at = |k: usize| text[k].1 == '}' && text.get(k + 1).map(|t| t.1) == Some('}');

    let mut out = String::with_capacity(xml.len());
    let mut last = 0;
    let mut i = 0;
    while i < text.len() {
        if !opens_at(i) {
            i += 1;
            continue;
        }

        let mut j = i + 2;
        let end = loop {
            if j >= text.len() {
                return Err(PathoError::Template(
                    "unclosed placeholder in template".to_string(),
                ));
            }
            if closes_at(j) {
                break j + 1;
            }
            if opens_at(j) {
                return Err(PathoError::Template(
                    "nested placeholder in template".to_string(),
                ));
            }
            j += 1;
        };

        out.push_str(&xml[last..text[i].0]);
        out.extend(text[i..=end].iter().map(|(_, c)| *c));
        last = text[end].0 + 1;
        i = end + 1;
    }
    out.push_str(&xml[last..]);
    Ok(out)
}

/// 渲染过程中新加入的图片
#[derive(Default)]
struct Embedder {
    count: usize,
    media: Vec<(String, Vec<u8>)>,
    relationships: BTreeMap<String, Vec<(String, String)>>,
    content_types: BTreeMap<&'static str, &'static str>,
}

impl Embedder {
    fn embed(&mut self, part_name: &str, image: &InlineImage) -> String {
        self.count += 1;
        let n = self.count;
        let file_name = format!("patho_image{}.{}", n, image.extension);
        let rel_id = format!("rIdPatho{}", n);

        let media_path = match part_name.rsplit_once('/') {
            Some((dir, _)) => format!("{}/media/{}", dir, file_name),
            None => format!("media/{}", file_name),
        };
        self.media.push((media_path, image.bytes.clone()));
        self.relationships
            .entry(rels_path_for(part_name))
            .or_default()
            .push((rel_id.clone(), format!("media/{}", file_name)));
        self.content_types.insert(image.extension, image.content_type);

        drawing_xml(&rel_id, n, image)
    }
}

fn drawing_xml(rel_id: &str, n: usize, image: &InlineImage) -> String {
    let cx = mm_to_emu(image.width_mm);
    let cy = mm_to_emu(image.height_mm);
    let doc_pr_id = 1000 + n;
    format!(
        concat!(
            "<w:drawing>",
            "<wp:inline xmlns:wp=\"http://schemas.openxmlformats.org/drawingml/2006/wordprocessingDrawing\" distT=\"0\" distB=\"0\" distL=\"0\" distR=\"0\">",
            "<wp:extent cx=\"{cx}\" cy=\"{cy}\"/>",
            "<wp:docPr id=\"{id}\" name=\"Picture {id}\"/>",
            "<wp:cNvGraphicFramePr>",
            "<a:graphicFrameLocks xmlns:a=\"http://schemas.openxmlformats.org/drawingml/2006/main\" noChangeAspect=\"1\"/>",
            "</wp:cNvGraphicFramePr>",
            "<a:graphic xmlns:a=\"http://schemas.openxmlformats.org/drawingml/2006/main\">",
            "<a:graphicData uri=\"http://schemas.openxmlformats.org/drawingml/2006/picture\">",
            "<pic:pic xmlns:pic=\"http://schemas.openxmlformats.org/drawingml/2006/picture\">",
            "<pic:nvPicPr><pic:cNvPr id=\"0\" name=\"patho_image{n}.{ext}\"/><pic:cNvPicPr/></pic:nvPicPr>",
            "<pic:blipFill>",
            "<a:blip xmlns:r=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships\" r:embed=\"{rel}\"/>",
            "<a:stretch><a:fillRect/></a:stretch>",
            "</pic:blipFill>",
            "<pic:spPr>",
            "<a:xfrm><a:off x=\"0\" y=\"0\"/><a:ext cx=\"{cx}\" cy=\"{cy}\"/></a:xfrm>",
            "<a:prstGeom prst=\"rect\"><a:avLst/></a:prstGeom>",
            "</pic:spPr>",
            "</pic:pic>",
            "</a:graphicData>",
            "</a:graphic>",
            "</wp:inline>",
            "</w:drawing>"
        ),
        cx = cx,
        cy = cy,
        id = doc_pr_id,
        n = n,
        ext = image.extension,
        rel = rel_id,
    )
}

fn substitute(
    xml: &str,
    part_name: &str,
    context: &ReportContext,
    embedder: &mut Embedder,
) -> Result<String> {
    let mut out = String::with_capacity(xml.len());
    let mut last = 0;
    for caps in placeholder_regex().captures_iter(xml) {
        let (Some(whole), Some(inner)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let key = inner.as_str().trim();
        if !is_identifier(key) {
            return Err(PathoError::Template(format!(
                "malformed placeholder '{}'",
                whole.as_str()
            )));
        }

        out.push_str(&xml[last..whole.start()]);
        match context.get(key) {
            Some(ReportValue::Text(text)) => out.push_str(&text_to_wordml(text)),
            Some(ReportValue::Image(image)) => {
                // 图片不能放在 <w:t> 里，先关闭文本再重新打开
                out.push_str("</w:t>");
                out.push_str(&embedder.embed(part_name, image));
                out.push_str("<w:t xml:space=\"preserve\">");
            }
            None => {
                return Err(PathoError::Template(format!(
                    "unknown placeholder '{}' in {}",
                    key, part_name
                )))
            }
        }
        last = whole.end();
    }
    out.push_str(&xml[last..]);
    Ok(out)
}

fn add_relationships(existing: Option<&str>, entries: &[(String, String)]) -> Result<String> {
    let mut additions = String::new();
    for (id, target) in entries {
        additions.push_str(&format!(
            "<Relationship Id=\"{}\" Type=\"{}\" Target=\"{}\"/>",
            id, IMAGE_REL_TYPE, target
        ));
    }

    match existing {
        None => Ok(format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n<Relationships xmlns=\"{}\">{}</Relationships>",
            RELATIONSHIPS_NS, additions
        )),
        Some(xml) => {
            let pos = xml.rfind("</Relationships>").ok_or_else(|| {
                PathoError::Template("relationships part is malformed".to_string())
            })?;
            Ok(format!("{}{}{}", &xml[..pos], additions, &xml[pos..]))
        }
    }
}

fn add_default_content_types(
    xml: &str,
    content_types: &BTreeMap<&'static str, &'static str>,
) -> Result<String> {
    let lowered = xml.to_ascii_lowercase();
    let mut additions = String::new();
    for (extension, content_type) in content_types {
        if !lowered.contains(&format!("extension=\"{}\"", extension)) {
            additions.push_str(&format!(
                "<Default Extension=\"{}\" ContentType=\"{}\"/>",
                extension, content_type
            ));
        }
    }
    let pos = xml
        .rfind("</Types>")
        .ok_or_else(|| PathoError::Template(format!("{} is malformed", CONTENT_TYPES_PART)))?;
    Ok(format!("{}{}{}", &xml[..pos], additions, &xml[pos..]))
}

fn utf8_part<'a>(name: &str, data: &'a [u8]) -> Result<&'a str> {
    std::str::from_utf8(data)
        .map_err(|_| PathoError::Template(format!("{} is not valid UTF-8", name)))
}

#[derive(Debug, Clone)]
struct Part {
    name: String,
    data: Vec<u8>,
    is_dir: bool,
}

/// 已加载的 docx 模板
#[derive(Debug, Clone)]
pub struct DocxTemplate {
    parts: Vec<Part>,
}

impl DocxTemplate {
    pub async fn open(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            PathoError::Template(format!("cannot read template {}: {}", path.display(), e))
        })?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(zip_error)?;
        let mut parts = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            let mut file = archive.by_index(i).map_err(zip_error)?;
            let name = file.name().to_string();
            let is_dir = file.is_dir();
            let mut data = Vec::new();
            file.read_to_end(&mut data)?;
            parts.push(Part { name, data, is_dir });
        }

        for required in [DOCUMENT_PART, CONTENT_TYPES_PART] {
            if !parts.iter().any(|p| p.name == required) {
                return Err(PathoError::Template(format!("template has no {}", required)));
            }
        }
        Ok(Self { parts })
    }

    /// 模板中出现的全部占位符名
    pub fn placeholders(&self) -> Result<BTreeSet<String>> {
        let mut keys = BTreeSet::new();
        for part in self.parts.iter().filter(|p| is_templated_part(&p.name)) {
            let collapsed = collapse_placeholders(utf8_part(&part.name, &part.data)?)?;
            for caps in placeholder_regex().captures_iter(&collapsed) {
                if let Some(inner) = caps.get(1) {
                    keys.insert(inner.as_str().trim().to_string());
                }
            }
        }
        Ok(keys)
    }

    /// 渲染为完整的 docx 字节；任何占位符出错都不会产生输出
    pub fn render(&self, context: &ReportContext) -> Result<Vec<u8>> {
        let mut parts = self.parts.clone();
        let mut embedder = Embedder::default();

        for part in parts.iter_mut().filter(|p| is_templated_part(&p.name)) {
            let collapsed = collapse_placeholders(utf8_part(&part.name, &part.data)?)?;
            let rendered = substitute(&collapsed, &part.name, context, &mut embedder)?;
            part.data = rendered.into_bytes();
        }

        for (rels_path, entries) in &embedder.relationships {
            match parts.iter_mut().find(|p| &p.name == rels_path) {
                Some(part) => {
                    let updated = add_relationships(Some(utf8_part(&part.name, &part.data)?), entries)?;
                    part.data = updated.into_bytes();
                }
                None => parts.push(Part {
                    name: rels_path.clone(),
                    data: add_relationships(None, entries)?.into_bytes(),
                    is_dir: false,
                }),
            }
        }

        if !embedder.content_types.is_empty() {
            if let Some(part) = parts.iter_mut().find(|p| p.name == CONTENT_TYPES_PART) {
                let updated = add_default_content_types(
                    utf8_part(&part.name, &part.data)?,
                    &embedder.content_types,
                )?;
                part.data = updated.into_bytes();
            }
        }

        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
        for part in &parts {
            if part.is_dir {
                writer.add_directory(part.name.as_str(), options).map_err(zip_error)?;
            } else {
                writer.start_file(part.name.as_str(), options).map_err(zip_error)?;
                writer.write_all(&part.data)?;
            }
        }
        for (path, data) in &embedder.media {
            writer.start_file(path.as_str(), options).map_err(zip_error)?;
            writer.write_all(data)?;
        }

        let cursor = writer.finish().map_err(zip_error)?;
        tracing::debug!(images = embedder.count, "Rendered docx template");
        Ok(cursor.into_inner())
    }
}
