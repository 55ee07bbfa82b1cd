//! `ClassChat` command-line client.
//!
//! Lists threads, creates threads and runs an interactive line-based chat
//! against a hub. Configuration via CLI flags, environment variables, or
//! config file (`~/.config/classchat/config.toml`).
//!
//! ```bash
//! # Inbox
//! cargo run --bin classchat -- --hub-url ws://127.0.0.1:9000/ws \
//!     --user-id teacher-7 threads
//!
//! # New thread with two parents
//! cargo run --bin classchat -- --user-id teacher-7 \
//!     new --subject "Field trip" --with parent-1,parent-2
//!
//! # Chat
//! CLASSCHAT_HUB_URL=ws://127.0.0.1:9000/ws CLASSCHAT_USER_ID=parent-1 \
//!     cargo run --bin classchat -- chat --thread <id>
//! ```

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use classchat_proto::message::{DeliveryStatus, ThreadId, UserId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;

use classchat::config::{CliArgs, ClientConfig, Command, Session};
use classchat::connection::{ConnectionMonitor, ConnectionState};
use classchat::display;
use classchat::realtime::RealtimeError;
use classchat::realtime::ws::{WsConnector, WsRealtime};
use classchat::threads::{self, ThreadError, ThreadEvent, ThreadTracker};
use classchat::typing::TypingIndicator;

/// Errors that end a subcommand.
#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("hub url and user id are required (--hub-url, --user-id or [hub] in the config file)")]
    NoSession,

    #[error("no command given; try `classchat threads`")]
    NoCommand,

    #[error(transparent)]
    Realtime(#[from] RealtimeError),

    #[error(transparent)]
    Thread(#[from] ThreadError),

    #[error("failed to encode json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("stdin: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    // Logs go to a file; stdout carries the chat.
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!("classchat starting");

    if let Err(e) = run(&config, cli.command).await {
        tracing::error!(err = %e, "classchat failed");
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
    tracing::info!("classchat exiting");
}

/// Initialize file-based logging.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown so buffered
/// entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("classchat.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

async fn run(config: &ClientConfig, command: Option<Command>) -> Result<(), CliError> {
    let command = command.ok_or(CliError::NoCommand)?;
    let session = config.session().ok_or(CliError::NoSession)?;

    match command {
        Command::Threads { json } => {
            let conn = connect(config, &session).await?;
            let rows = threads::thread_summaries(&conn).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if rows.is_empty() {
                println!("no threads");
            } else {
                for row in &rows {
                    println!("{}", display::summary_line(row, &config.timestamp_format));
                }
            }
            conn.close().await;
        }
        Command::New { subject, with } => {
            let conn = connect(config, &session).await?;
            let participants = with.into_iter().map(UserId::new).collect();
            let thread_id = threads::create_thread(&conn, &subject, participants).await?;
            println!("{thread_id}");
            conn.close().await;
        }
        Command::Chat { thread } => chat(config, &session, thread).await?,
    }
    Ok(())
}

async fn connect(config: &ClientConfig, session: &Session) -> Result<WsRealtime, RealtimeError> {
    WsRealtime::connect_with(
        &session.hub_url,
        session.user_id.clone(),
        config.ws_timeouts(),
    )
    .await
}

/// Interactive chat on one thread.
///
/// Each stdin line is sent as a message. Commands: `/typing` (announce
/// typing), `/read`, `/resend`, `/retry`, `/foreground`, `/quit`.
async fn chat(config: &ClientConfig, session: &Session, thread: ThreadId) -> Result<(), CliError> {
    let fmt = config.timestamp_format.as_str();
    let connector = WsConnector::new(
        session.hub_url.clone(),
        session.user_id.clone(),
        config.ws_timeouts(),
    );
    let handle = Arc::new(ConnectionMonitor::spawn(connector, config.reconnect));

    let status = handle
        .wait_for(|s| matches!(s.state, ConnectionState::Connected | ConnectionState::Offline))
        .await?;
    if status.state == ConnectionState::Offline {
        handle.shutdown();
        return Err(RealtimeError::Unreachable(session.hub_url.clone()).into());
    }

    let mut tracker =
        ThreadTracker::open(Arc::clone(&handle), thread, session.user_name.clone()).await?;
    for view in tracker.messages() {
        println!("{}", display::message_line(view, fmt));
    }
    let typing = TypingIndicator::spawn(
        Arc::clone(&handle),
        thread,
        session.user_name.clone(),
        config.typing,
    )
    .await?;

    let mut typing_rx = typing.changes();
    let mut status_rx = handle.watch_status();
    let mut was_connected = true;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match line.trim() {
                    "" => {}
                    "/quit" => break,
                    "/typing" => typing.set_typing(),
                    "/retry" => handle.retry(),
                    "/foreground" => handle.foreground(),
                    "/read" => match tracker.mark_read().await {
                        Ok(n) => println!("-- marked {n} read"),
                        Err(e) => println!("-- {e}"),
                    },
                    "/resend" => {
                        let failed: Vec<_> = tracker
                            .messages()
                            .iter()
                            .filter(|m| matches!(m.status, DeliveryStatus::Failed(_)))
                            .map(|m| m.id)
                            .collect();
                        for id in failed {
                            if let Err(e) = tracker.resend(id).await {
                                println!("-- resend failed: {e}");
                            }
                        }
                    }
                    body => {
                        typing.clear_typing();
                        match tracker.send(body).await {
                            Ok(id) => print_message(&tracker, id, fmt),
                            Err(e) => println!("-- not sent: {e}"),
                        }
                    }
                }
            }
            events = tracker.next_change() => {
                let events = match events {
                    Ok(events) => events,
                    Err(ThreadError::Closed) => break,
                    Err(e) => return Err(e.into()),
                };
                tracker.flush_delivered().await;
                print_events(&tracker, &events, fmt);
            }
            Ok(()) = typing_rx.changed() => {
                if let Some(text) = typing_rx.borrow_and_update().text.clone() {
                    println!("-- {text}");
                }
            }
            Ok(()) = status_rx.changed() => {
                let status = *status_rx.borrow_and_update();
                println!("-- {}", display::connection_line(&status));
                let connected = status.state == ConnectionState::Connected;
                if connected && !was_connected {
                    match tracker.reload().await {
                        Ok(events) => print_events(&tracker, &events, fmt),
                        Err(e) => tracing::warn!(err = %e, "reload after reconnect failed"),
                    }
                }
                was_connected = connected;
            }
        }
    }

    typing.clear_typing();
    drop(typing);
    if let Err(e) = tracker.close().await {
        tracing::debug!(err = %e, "thread close failed");
    }
    handle.shutdown();
    Ok(())
}

fn print_events<R: classchat::realtime::Realtime>(
    tracker: &ThreadTracker<R>,
    events: &[ThreadEvent],
    fmt: &str,
) {
    for event in events {
        match event {
            ThreadEvent::MessageAdded(id) => print_message(tracker, *id, fmt),
            ThreadEvent::StatusChanged { id, status } => {
                if let Some(view) = tracker.message(*id) {
                    println!("-- \"{}\" {}", view.body, display::status_symbol(status));
                }
            }
        }
    }
}

fn print_message<R: classchat::realtime::Realtime>(
    tracker: &ThreadTracker<R>,
    id: classchat_proto::message::MessageId,
    fmt: &str,
) {
    if let Some(view) = tracker.message(id) {
        println!("{}", display::message_line(view, fmt));
    }
}
