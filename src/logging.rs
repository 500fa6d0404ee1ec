use crate::{COMMAND_TARGET, CONSOLE_TARGET, Data, ERROR_TARGET, Error};
use poise::{Context, FrameworkError};
use std::path::Path;
use std::time::Instant;
use tracing::{error, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::tickets::TicketError;

/// Command log file name
pub const COMMAND_LOG_FILE: &str = "commands";
/// Ticket engine log file name
pub const TICKET_LOG_FILE: &str = "tickets";

/// Initialize the logging system with console and file outputs
///
/// # Errors
/// Returns an error if the log directory cannot be created.
pub fn init(log_dir: &Path) -> Result<(), Error> {
    if !log_dir.exists() {
        std::fs::create_dir_all(log_dir)?;
    }

    // Daily rotated files
    let command_file = RollingFileAppender::new(Rotation::DAILY, log_dir, COMMAND_LOG_FILE);
    let ticket_file = RollingFileAppender::new(Rotation::DAILY, log_dir, TICKET_LOG_FILE);

    // Human-readable console output
    let console_layer = fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_ansi(true);

    // JSON command log
    let command_layer = fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_ansi(false)
        .json()
        .with_writer(command_file)
        .with_filter(tracing_subscriber::filter::filter_fn(|meta| {
            meta.target() == COMMAND_TARGET || meta.target() == ERROR_TARGET
        }));

    // JSON log of everything the ticket engine does
    let ticket_layer = fmt::layer()
        .with_target(true)
        .with_ansi(false)
        .json()
        .with_writer(ticket_file)
        .with_filter(tracing_subscriber::filter::filter_fn(|meta| {
            meta.target().starts_with(crate::BOT_NAME)
        }));

    // Default to INFO, and keep serenity quiet unless something is wrong
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,serenity=error"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(command_layer)
        .with(ticket_layer)
        .init();

    info!(log_dir = %log_dir.display(), "Logging system initialized");
    Ok(())
}

// Command start time, set by the pre-command hook
thread_local! {
    static COMMAND_START_TIME: std::cell::RefCell<Option<Instant>> = const { std::cell::RefCell::new(None) };
}

fn guild_label(ctx: Context<'_, Data, Error>) -> String {
    ctx.guild_id()
        .map_or_else(|| "DM".to_string(), |id| id.get().to_string())
}

/// Log the start of a command execution (pre-command hook)
pub fn log_command_start(ctx: Context<'_, Data, Error>) {
    COMMAND_START_TIME.with(|cell| {
        *cell.borrow_mut() = Some(Instant::now());
    });

    let args = if ctx.command().parameters.is_empty() {
        String::new()
    } else {
        format!("{:?}", ctx.invocation_string())
    };

    info!(
        target: COMMAND_TARGET,
        command = %ctx.command().qualified_name,
        guild_id = %guild_label(ctx),
        user_id = %ctx.author().id.get(),
        arguments = %args,
        event = "start",
        "Command execution started"
    );
}

/// Log the end of a command execution (post-command hook)
pub fn log_command_end(ctx: Context<'_, Data, Error>) {
    let duration =
        COMMAND_START_TIME.with(|cell| cell.borrow_mut().take().map(|start| start.elapsed()));
    let duration_ms = u64::try_from(duration.map_or(0, |d| d.as_millis())).unwrap_or_default();

    info!(
        target: COMMAND_TARGET,
        command = %ctx.command().qualified_name,
        guild_id = %guild_label(ctx),
        user_id = %ctx.author().id.get(),
        duration_ms = duration_ms,
        event = "end",
        "Command execution completed"
    );
}

/// Whether a command error is the caller's fault rather than ours
fn is_user_error(error: &Error) -> bool {
    error.downcast_ref::<TicketError>().is_some_and(|e| {
        matches!(
            e,
            TicketError::NotFound(_)
                | TicketError::Invalid(_)
                | TicketError::Conflict(_)
                | TicketError::GuildNotRegistered(_)
        )
    })
}

/// Log errors that occur during command execution
pub fn log_command_error(error: &FrameworkError<'_, Data, Error>) {
    match error {
        FrameworkError::Command { error, ctx, .. } => {
            if is_user_error(error) {
                warn!(
                    target: ERROR_TARGET,
                    command = %ctx.command().qualified_name,
                    guild_id = %guild_label(*ctx),
                    user_id = %ctx.author().id.get(),
                    error = %error,
                    "Command rejected"
                );
            } else {
                error!(
                    target: ERROR_TARGET,
                    command = %ctx.command().qualified_name,
                    guild_id = %guild_label(*ctx),
                    user_id = %ctx.author().id.get(),
                    error = %error,
                    "Command error"
                );
            }
        }
        FrameworkError::CommandCheckFailed { error, ctx, .. } => {
            let error_msg = error
                .as_ref()
                .map_or_else(|| "Check failed".to_string(), ToString::to_string);

            error!(
                target: ERROR_TARGET,
                command = %ctx.command().qualified_name,
                guild_id = %guild_label(*ctx),
                user_id = %ctx.author().id.get(),
                error = %error_msg,
                "Command check failed"
            );
        }
        err => {
            error!(
                target: ERROR_TARGET,
                error = ?err,
                "Other framework error"
            );
        }
    }
}

/// Log a command error and tell the caller what went wrong
pub async fn on_error(error: FrameworkError<'_, Data, Error>) {
    log_command_error(&error);
    if let FrameworkError::Command { error, ctx, .. } = &error {
        let reply = if is_user_error(error) {
            error.to_string()
        } else {
            "Something went wrong while running that command.".to_string()
        };
        if let Err(e) = ctx.say(reply).await {
            warn!(target: ERROR_TARGET, error = %e, "Failed to report command error");
        }
    } else if let Err(e) = poise::builtins::on_error(error).await {
        warn!(target: ERROR_TARGET, error = %e, "Failed to report framework error");
    }
}

pub fn log_console(message: &str) {
    info!(
        target: CONSOLE_TARGET,
        message = %message,
        event = "console",
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_errors() {
        let not_found: Error = Box::new(TicketError::NotFound("ticket #4".to_string()));
        assert!(is_user_error(&not_found));
        let storage: Error = Box::new(TicketError::Storage("disk full".to_string()));
        assert!(!is_user_error(&storage));
        let other: Error = "plain".into();
        assert!(!is_user_error(&other));
    }
}
