pub mod merge;
pub mod parser;
pub mod types;
