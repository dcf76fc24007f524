pub mod cancellation;
pub mod engine;
pub mod event_log;
pub mod expression;
pub mod gateway;
pub mod manager;
pub mod team;
