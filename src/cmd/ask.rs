//! One-shot turn from the terminal: `assistant-gateway ask`.
//!
//! Events go to stdout as JSON lines; logs go to stderr.

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use assistant_gateway::config::GatewayConfig;
use assistant_gateway::orchestrator::{Orchestrator, Turn, TurnStatus, generate_conversation_id};
use assistant_gateway::session::InMemorySessionStore;

pub struct AskArgs {
    pub message: String,
    pub conversation: Option<String>,
    pub model: Option<String>,
    pub resume: Option<String>,
    pub files: Vec<String>,
}

pub async fn cmd_ask(config: GatewayConfig, args: AskArgs) -> Result<()> {
    for warning in config.validate() {
        warn!("config: {}", warning);
    }

    let conversation_id = args.conversation.unwrap_or_else(generate_conversation_id);
    let turn = Turn::new(conversation_id, args.message.trim())
        .with_attachments(args.files)
        .with_model(args.model)
        .with_resume_token(args.resume);
    turn.validate(config.limits.max_input_length)?;

    let orchestrator = Orchestrator::new(Arc::new(config), Arc::new(InMemorySessionStore::new()));
    let mut stream = orchestrator.start_turn(turn);

    let stdout = std::io::stdout();
    loop {
        let event = tokio::select! {
            event = stream.next_event() => event,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; stopping assistant");
                stream.abandon().await?;
                bail!("Interrupted");
            }
        };
        let Some(event) = event else { break };
        let line = serde_json::to_string(&event).context("Failed to serialize event")?;
        let mut out = stdout.lock();
        writeln!(out, "{}", line)?;
        out.flush()?;
    }

    let outcome = stream.finish().await?;
    info!(
        conversation_id = %outcome.conversation_id,
        session = outcome.session_token.as_deref().unwrap_or("-"),
        elapsed = outcome.elapsed_secs(),
        "turn complete"
    );
    match outcome.status {
        TurnStatus::Completed => Ok(()),
        TurnStatus::Failed(message) => bail!("Turn failed: {}", message),
        TurnStatus::Abandoned => bail!("Turn was abandoned"),
    }
}
