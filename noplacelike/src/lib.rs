pub mod cli;
pub mod platform;

pub use platform::Platform;
