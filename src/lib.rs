pub mod api;
pub mod config;
pub mod device;
pub mod error;
pub mod generation;
pub mod host;
pub mod logits;
pub mod model;
pub mod tokenizer;
pub mod worker;
