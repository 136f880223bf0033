pub mod completion_reactor;
pub mod completion_registry;
pub mod completion_unary;
