pub mod config;
pub mod crontab;
pub mod dlq;
pub mod send;
pub mod stream;
