pub mod commands;
pub mod config;
pub mod data;
pub mod handlers;
pub mod logging;
pub mod platform;
pub mod tasks;
pub mod tickets;

pub const BOT_NAME: &str = "ticket_warden";
pub const COMMAND_TARGET: &str = "ticket_warden::command";
pub const ERROR_TARGET: &str = "ticket_warden::error";
pub const EVENT_TARGET: &str = "ticket_warden::handlers";
pub const CONSOLE_TARGET: &str = "ticket_warden";

pub use data::{Data, DataInner};
pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Context<'a> = poise::Context<'a, Data, Error>;
