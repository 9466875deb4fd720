pub mod dispatch;
pub mod events;
pub mod network;
pub mod platform;
pub mod plugins;
pub mod resources;
