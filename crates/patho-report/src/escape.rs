//! 文本转义
//!
//! 所有写进 `<w:t>` 的文本都必须经过这里，模板本身不做自动转义。

const RUN_BREAK: &str = "</w:t><w:br/><w:t xml:space=\"preserve\">";
const RUN_TAB: &str = "</w:t><w:tab/><w:t xml:space=\"preserve\">";

/// 转义 XML 特殊字符，丢弃 XML 1.0 不允许的控制字符
pub fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            '\t' | '\n' | '\r' => out.push(c),
            c if (c as u32) < 0x20 => {}
            c => out.push(c),
        }
    }
    out
}

/// 把多行文本转成可以放在 `<w:t>` 内部的 WordprocessingML 片段
///
/// 换行变成 `<w:br/>`，制表符变成 `<w:tab/>`。
pub fn text_to_wordml(text: &str) -> String {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::with_capacity(normalized.len());
    for (i, line) in normalized.split('\n').enumerate() {
        if i > 0 {
            out.push_str(RUN_BREAK);
        }
        for (j, segment) in line.split('\t').enumerate() {
            if j > 0 {
                out.push_str(RUN_TAB);
            }
            out.push_str(&escape_xml(segment));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_markup() {
        assert_eq!(
            escape_xml("<script>alert('x')</script> & \"more\""),
            "&lt;script&gt;alert(&apos;x&apos;)&lt;/script&gt; &amp; &quot;more&quot;"
        );
        assert_eq!(escape_xml("鳞状上皮内高度病变"), "鳞状上皮内高度病变");
    }

    #[test]
    fn test_escape_drops_control_chars() {
        assert_eq!(escape_xml("a\u{0}b\u{1b}c"), "abc");
    }

    #[test]
    fn test_line_breaks() {
        assert_eq!(
            text_to_wordml("第一行\r\n<b>第二行</b>"),
            format!("第一行{}&lt;b&gt;第二行&lt;/b&gt;", RUN_BREAK)
        );
        assert_eq!(text_to_wordml("a\tb"), format!("a{}b", RUN_TAB));
        assert_eq!(text_to_wordml(""), "");
    }
}
