pub mod database;
pub mod health;
pub mod memory;
pub mod rbmq;
pub mod sms;
pub mod smtp;
pub mod store;
pub mod webhook;
