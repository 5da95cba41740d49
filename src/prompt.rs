use sonic_rs::{JsonContainerTrait, JsonValueTrait, Value};

/// 把标准化后的消息列表拼成上游期望的单段 prompt。
///
/// 相邻同角色消息用空行合并；assistant 段包在
/// `<｜Assistant｜>…<｜end▁of▁sentence｜>` 里，后续 user/system 段
/// 以 `<｜User｜>` 开头（首段不加前缀）。
pub fn messages_prepare(messages: &[Value]) -> String {
    struct Block {
        role: String,
        text: String,
    }

    let mut processed: Vec<Block> = Vec::with_capacity(messages.len());
    for m in messages {
        let role = m
            .get("role")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let text = normalize_content(m.get("content").unwrap_or(&Value::default()));
        processed.push(Block { role, text });
    }
    if processed.is_empty() {
        return String::new();
    }

    let mut merged: Vec<Block> = Vec::with_capacity(processed.len());
    for block in processed {
        if let Some(last) = merged.last_mut()
            && last.role == block.role
        {
            last.text.push_str("\n\n");
            last.text.push_str(&block.text);
            continue;
        }
        merged.push(block);
    }

    let mut out = String::new();
    for (i, m) in merged.iter().enumerate() {
        match m.role.as_str() {
            "assistant" => {
                out.push_str("<｜Assistant｜>");
                out.push_str(&m.text);
                out.push_str("<｜end▁of▁sentence｜>");
            }
            "user" | "system" => {
                if i > 0 {
                    out.push_str("<｜User｜>");
                }
                out.push_str(&m.text);
            }
            _ => out.push_str(&m.text),
        }
    }
    strip_markdown_image_bang(&out)
}

/// 提取消息 content 的纯文本：
/// - string 原样
/// - array 取 text/input_text/output_text 项，按换行连接
/// - 其余类型序列化为 JSON
pub fn normalize_content(v: &Value) -> String {
    if v.is_null() {
        return String::new();
    }
    if let Some(s) = v.as_str() {
        return s.to_string();
    }
    if let Some(arr) = v.as_array() {
        let mut parts: Vec<String> = Vec::with_capacity(arr.len());
        for item in arr.iter() {
            if !item.is_object() {
                continue;
            }
            let type_str = item
                .get("type")
                .and_then(|t| t.as_str())
                .unwrap_or("")
                .trim()
                .to_lowercase();
            if type_str != "text" && type_str != "output_text" && type_str != "input_text" {
                continue;
            }
            if let Some(text) = item.get("text").and_then(|t| t.as_str()) {
                parts.push(text.to_string());
                continue;
            }
            if let Some(text) = item.get("content").and_then(|t| t.as_str()) {
                parts.push(text.to_string());
            }
        }
        return parts.join("\n");
    }
    sonic_rs::to_string(v).unwrap_or_default()
}

/// 上游会把 `![alt](url)` 渲染成附件，去掉叹号降级为普通链接。
fn strip_markdown_image_bang(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'!'
            && i + 1 < bytes.len()
            && bytes[i + 1] == b'['
            && is_markdown_link_ahead(text, i + 1)
        {
            i += 1;
            continue;
        }
        let ch_len = utf8_len(bytes[i]);
        out.push_str(&text[i..i + ch_len]);
        i += ch_len;
    }
    out
}

fn is_markdown_link_ahead(text: &str, open_bracket: usize) -> bool {
    let rest = &text[open_bracket..];
    let Some(close) = rest.find(']') else {
        return false;
    };
    let after = &rest[close + 1..];
    if !after.starts_with('(') {
        return false;
    }
    after.contains(')')
}

fn utf8_len(first_byte: u8) -> usize {
    match first_byte {
        b if b < 0x80 => 1,
        b if b >> 5 == 0b110 => 2,
        b if b >> 4 == 0b1110 => 3,
        _ => 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msgs(raw: &str) -> Vec<Value> {
        let v: Value = sonic_rs::from_str(raw).unwrap();
        v.as_array().unwrap().iter().cloned().collect()
    }

    #[test]
    fn single_user_message_is_bare() {
        let got = messages_prepare(&msgs(r#"[{"role":"user","content":"Hello"}]"#));
        assert_eq!(got, "Hello");
    }

    #[test]
    fn roles_get_markers() {
        let got = messages_prepare(&msgs(
            r#"[
                {"role":"system","content":"You are helper"},
                {"role":"user","content":"Hi"},
                {"role":"assistant","content":"Hello"},
                {"role":"user","content":"How are you"}
            ]"#,
        ));
        assert!(got.contains("<｜Assistant｜>"));
        assert!(got.contains("<｜User｜>"));
        assert!(got.contains("<｜end▁of▁sentence｜>"));
        assert!(got.starts_with("You are helper"));
    }

    #[test]
    fn adjacent_same_role_merged_with_blank_line() {
        let got = messages_prepare(&msgs(
            r#"[
                {"role":"user","content":"one"},
                {"role":"user","content":"two"}
            ]"#,
        ));
        assert_eq!(got, "one\n\ntwo");
    }

    #[test]
    fn object_content_serialized() {
        let got = messages_prepare(&msgs(
            r#"[{"role":"user","content":{"temp":18,"ok":true}}]"#,
        ));
        assert!(got.contains(r#""temp":18"#));
        assert!(got.contains(r#""ok":true"#));
    }

    #[test]
    fn array_text_variants_joined() {
        let got = messages_prepare(&msgs(
            r#"[{"role":"user","content":[
                {"type":"output_text","text":"line1"},
                {"type":"input_text","text":"line2"},
                {"type":"image_url","image_url":"https://example.com/a.png"}
            ]}]"#,
        ));
        assert_eq!(got, "line1\nline2");
    }

    #[test]
    fn markdown_image_downgraded_to_link() {
        let got = messages_prepare(&msgs(
            r#"[{"role":"user","content":"see ![img](http://x/a.png) ok"}]"#,
        ));
        assert_eq!(got, "see [img](http://x/a.png) ok");
    }

    #[test]
    fn lone_bang_is_preserved() {
        let got = messages_prepare(&msgs(r#"[{"role":"user","content":"hi! [a] (b)"}]"#));
        assert_eq!(got, "hi! [a] (b)");
    }
}
