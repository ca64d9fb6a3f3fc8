// src/consumers/mod.rs
pub mod sample;

pub use sample::SampleConsumer;
