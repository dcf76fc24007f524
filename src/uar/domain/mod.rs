pub mod events;
pub mod runs;
pub mod session;
pub mod steps;
pub mod tasks;
