pub mod dead_letter;
pub mod health;
pub mod job;
pub mod message;
pub mod notification;
pub mod outbox;
pub mod response;
pub mod retry;
pub mod schedule;
pub mod status;
pub mod validation;
