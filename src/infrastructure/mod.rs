pub mod alarm_scheduler;
pub mod chat_client;
pub mod config;
pub mod credential_store;
pub mod error;
pub mod message_storage;
pub mod storage;
pub mod task_store;
