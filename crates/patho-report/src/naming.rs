//! 下载文件名

pub const DOCX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

/// 报告文件名：患者姓名加后缀
pub fn report_filename(patient_name: &str, suffix: &str) -> String {
    format!("{}{}", patient_name.trim(), suffix)
}

/// 按 URI 路径规则转义
///
/// 字母数字和 `/:@&+$,-_.!~*'()` 原样保留，其余字节按 UTF-8 百分号编码。
pub fn escape_uri_path(path: &str) -> String {
    const SAFE: &[u8] = b"/:@&+$,-_.!~*'()";
    let mut out = String::with_capacity(path.len() * 3);
    for &byte in path.as_bytes() {
        if byte.is_ascii_alphanumeric() || SAFE.contains(&byte) {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

pub fn content_disposition(filename: &str) -> String {
    format!("attachment; filename={}", escape_uri_path(filename))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_filename() {
        assert_eq!(report_filename("张三", "诊断报告.docx"), "张三诊断报告.docx");
        assert_eq!(report_filename(" Li Si ", ".docx"), "Li Si.docx");
    }

    #[test]
    fn test_escape_uri_path() {
        assert_eq!(
            escape_uri_path("张三诊断报告.docx"),
            "%E5%BC%A0%E4%B8%89%E8%AF%8A%E6%96%AD%E6%8A%A5%E5%91%8A.docx"
        );
        assert_eq!(escape_uri_path("a b;c\"d"), "a%20b%3Bc%22d");
        assert_eq!(escape_uri_path("/x:y@z&(1)~*"), "/x:y@z&(1)~*");
    }

    #[test]
    fn test_content_disposition() {
        assert_eq!(
            content_disposition("Li Si.docx"),
            "attachment; filename=Li%20Si.docx"
        );
    }
}
