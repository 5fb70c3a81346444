pub mod engine;
pub mod listener;
pub mod slot;
pub mod stream;
