//! 磁盘固件回放：fixtures/sse_chunks/* 逐行喂给解析器，
//! 结果与 fixtures/expected/sse_* 逐字段比对。

use ds2api::sse::{PartType, parse_content_line};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize)]
struct Fixture {
    thinking_enabled: bool,
    initial_type: String,
    lines: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Expected {
    parts: Vec<ExpectedPart>,
    finished: bool,
    final_type: String,
}

#[derive(Debug, Deserialize)]
struct ExpectedPart {
    text: String,
    r#type: String,
}

fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
}

fn part_type_from(s: &str) -> PartType {
    match s {
        "thinking" => PartType::Thinking,
        _ => PartType::Text,
    }
}

#[test]
fn sse_fixture_corpus_matches_expected_outputs() {
    let chunks_dir = fixtures_dir().join("sse_chunks");
    let expected_dir = fixtures_dir().join("expected");

    let mut fixture_files: Vec<PathBuf> = std::fs::read_dir(&chunks_dir)
        .expect("fixtures/sse_chunks 必须存在")
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().map(|x| x == "json").unwrap_or(false))
        .collect();
    fixture_files.sort();
    assert!(!fixture_files.is_empty(), "固件目录不能为空");

    for path in fixture_files {
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        // 001_text_only.json → sse_001.json
        let number = name.split('_').next().unwrap_or("");
        let expected_path = expected_dir.join(format!("sse_{number}.json"));

        let fixture: Fixture = sonic_rs::from_str(
            &std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("读取 {name} 失败: {e}")),
        )
        .unwrap_or_else(|e| panic!("解析固件 {name} 失败: {e}"));
        let expected: Expected = sonic_rs::from_str(
            &std::fs::read_to_string(&expected_path)
                .unwrap_or_else(|e| panic!("读取 {expected_path:?} 失败: {e}")),
        )
        .unwrap_or_else(|e| panic!("解析期望 {expected_path:?} 失败: {e}"));

        let mut current = part_type_from(&fixture.initial_type);
        let mut parts: Vec<(String, PartType)> = Vec::new();
        let mut finished = false;

        for line in &fixture.lines {
            let result = parse_content_line(line.as_bytes(), fixture.thinking_enabled, current);
            if !result.parsed {
                continue;
            }
            current = result.next_type;
            for p in &result.parts {
                parts.push((p.text.clone(), p.part_type));
            }
            if result.stop {
                finished = true;
                break;
            }
        }

        assert_eq!(finished, expected.finished, "固件 {name}: finished 不一致");
        assert_eq!(
            current,
            part_type_from(&expected.final_type),
            "固件 {name}: 最终类型不一致"
        );
        assert_eq!(
            parts.len(),
            expected.parts.len(),
            "固件 {name}: 片段数量不一致，实际 {parts:?}"
        );
        for (i, (got, want)) in parts.iter().zip(expected.parts.iter()).enumerate() {
            assert_eq!(got.0, want.text, "固件 {name} 第 {i} 段文本不一致");
            assert_eq!(
                got.1,
                part_type_from(&want.r#type),
                "固件 {name} 第 {i} 段类型不一致"
            );
        }
    }
}
