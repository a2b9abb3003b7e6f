pub mod core;
pub mod services;
pub mod tasks;

pub use self::core::Application;
