pub mod clock;
pub mod dead_letter;
pub mod engine;
pub mod filter;
pub mod message;
pub mod queue;
pub mod topic;

pub use engine::Broker;
