pub mod assistant;
pub mod bootstrap;
pub mod chat_session;
pub mod commands;
pub mod quotes;
pub mod task_feed;
pub mod task_repository;
