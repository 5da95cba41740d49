pub mod client;
pub mod constants;
pub mod pow;

pub use client::{DeepSeekClient, UpstreamError};
pub use pow::{PowChallenge, PowSolver, build_pow_header};
