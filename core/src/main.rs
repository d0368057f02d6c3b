/// LeaseChat terminal client - Main entry point
///
/// Input lines:
///   @<participant> <text>   send a message
///   /open <participant>     print a conversation
///   /list                   print the conversation list
///   /reconnect              retry the live channel after a failure
///   /quit                   tear down and exit
use leasechat_core::{Config, SendOutcome, SessionController, SessionSignal};
use std::env;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn print_conversation(controller: &SessionController, participant: &str) {
    for message in controller.conversation(participant) {
        let status = if message.is_confirmed() { "" } else { " (unconfirmed)" };
        println!("  {}{}", message, status);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    // Parse configuration
    let args: Vec<String> = env::args().collect();
    let config = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let controller = SessionController::from_config(&config)
        .map_err(|e| anyhow::anyhow!("Session error: {}", e))?;
    info!("Starting LeaseChat session");
    info!("   User ID: {}", controller.user_id());
    info!("   Live channel: {}", config.server_addr);

    // Print connection status changes
    let mut signals = controller.signals();
    let signal_task = tokio::spawn(async move {
        while let Ok(signal) = signals.recv().await {
            match signal {
                SessionSignal::Joined => println!("* connected"),
                SessionSignal::Reconnecting => println!("* connection lost, reconnecting..."),
                SessionSignal::ConnectFailed { reason } => {
                    println!("* connection failed: {} (type /reconnect to retry)", reason)
                }
                SessionSignal::Closed => break,
            }
        }
    });

    // Print inbound messages
    let mut updates = controller.updates();
    let local_user = config.user_id.clone();
    let update_task = tokio::spawn(async move {
        while let Ok(message) = updates.recv().await {
            if message.sender_id() != local_user {
                println!("{}", message);
            }
        }
    });

    let activation = controller.activate().await;
    if let Err(e) = &activation.connection {
        warn!("Starting without live channel: {}", e);
    }
    for summary in &activation.conversations {
        println!("- {}: {}", summary.participant_id, summary.last_message_preview);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if line == "/quit" {
            break;
        } else if line == "/list" {
            for summary in controller.conversations() {
                println!("- {}: {}", summary.participant_id, summary.last_message_preview);
            }
        } else if line == "/reconnect" {
            if let Err(e) = controller.reconnect().await {
                println!("! {}", e);
            }
        } else if let Some(participant) = line.strip_prefix("/open ") {
            let participant = participant.trim();
            match controller.open_conversation(participant).await {
                Ok(_) => print_conversation(&controller, participant),
                Err(e) => println!("! {}", e),
            }
        } else if let Some(rest) = line.strip_prefix('@') {
            let Some((participant, text)) = rest.split_once(' ') else {
                println!("! usage: @<participant> <text>");
                continue;
            };
            match controller.send_message(participant, text).await {
                Ok(SendOutcome::Confirmed(_)) => {}
                Ok(SendOutcome::Unconfirmed) => println!("! not delivered yet (offline)"),
                Err(e) => println!("! {}", e),
            }
        } else {
            println!("! unknown input; use @<participant> <text>, /open, /list, /reconnect, /quit");
        }
    }

    controller.teardown().await;
    let _ = signal_task.await;
    update_task.abort();
    info!("Session stopped");
    Ok(())
}
