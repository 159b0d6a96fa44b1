mod common;

mod consumer_tests;
mod dead_letter_tests;
mod outbox_tests;
mod pool_tests;
mod sender_tests;
