//! Common utilities shared by the gateway workspace crates.

pub mod timer_queue;

pub use timer_queue::TimerQueue;
