/// 估算文本的 token 数。
///
/// ASCII（英文、代码等）按 ~4 字符/token 计；非 ASCII（中日韩等）按
/// ~1.3 字符/token 计，更接近 BPE 分词器对 CJK 的实际表现。
/// 非空文本至少计 1 个 token。
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    let mut ascii = 0usize;
    let mut non_ascii = 0usize;
    for c in text.chars() {
        if c.is_ascii() {
            ascii += 1;
        } else {
            non_ascii += 1;
        }
    }
    let n = ascii / 4 + (non_ascii * 10 + 7) / 13;
    n.max(1)
}
