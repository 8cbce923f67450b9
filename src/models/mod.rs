pub mod message;
pub mod module;
pub mod tab;
pub mod task;
