pub mod engine;

pub use engine::{ConsumeConfig, ParsedDecision, StopReason, StreamHooks, consume_sse};
