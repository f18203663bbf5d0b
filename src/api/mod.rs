//! 对外入口

pub mod worker;

pub use worker::ChunkWorker;
