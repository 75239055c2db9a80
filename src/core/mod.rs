pub mod assembler;
pub mod bundler;
pub mod engine;
pub mod error;
pub mod events;
pub mod model;
pub mod planner;
pub mod store;
pub mod worker;

#[cfg(test)]
pub mod test_support;
