pub mod builtin;
pub mod catalog;
pub mod registry;
pub mod scheduler;
pub mod shutdown;
