pub mod embeddings;
pub mod handler;
pub mod normalize;
pub mod responses;
pub mod store;
pub mod stream;
pub mod types;
