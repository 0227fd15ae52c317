pub mod decoder;
pub mod import;
pub mod projector;
pub mod source;
pub mod types;
