pub mod parser;
pub mod pump;

pub use parser::{ContentPart, LineResult, PartType, is_citation, parse_content_line};
pub use pump::{CollectedStream, collect_stream, spawn_parsed_line_pump};
