pub mod dates;
pub mod models;
pub mod response_parser;
pub mod task_extractor;
