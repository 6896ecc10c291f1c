use anyhow::Result;
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error};

use crate::messages::{ClientEnvelope, ClientPayload, MonitorFrame};

#[derive(Parser, Debug)]
#[command(name = "monitor-hub")]
#[command(about = "Session hub for browser-based monitoring dashboards")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Run as server (default behavior if no command specified)
    #[arg(long)]
    pub server: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Send a message over an existing browser session's socket
    Probe {
        /// Hub URL (e.g., ws://localhost:8080)
        #[arg(short, long, default_value = "ws://localhost:8080")]
        url: String,

        /// Browser session key to send as
        #[arg(short, long)]
        browser_session: String,

        /// Message to send
        #[command(subcommand)]
        message: ProbeMessage,
    },
}

#[derive(Subcommand, Debug)]
pub enum ProbeMessage {
    /// Send an evaluator update request
    EvaluatorUpdate {
        /// JSON request body
        #[arg(default_value = "{}")]
        request: String,
    },

    /// Send strategies for application
    ApplyStrategies {
        /// JSON list of strategies
        strategies: String,
    },

    /// Request the monitored session be ended
    EndSession {
        /// JSON request body
        #[arg(default_value = "{}")]
        request: String,
    },

    /// Send a raw JSON payload as-is
    Raw {
        /// Full payload object including its "type" tag
        payload: String,
    },
}

fn parse_json_arg(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).map_err(|e| anyhow::anyhow!("Invalid JSON argument: {}", e))
}

/// Connects to the hub, sends one message as the given browser session, and
/// prints the structured reply.
pub async fn run_probe_client(url: String, browser_session: String, message: ProbeMessage) -> Result<()> {
    let payload = match message {
        ProbeMessage::EvaluatorUpdate { request } => ClientPayload::EvaluatorUpdate {
            request: parse_json_arg(&request)?,
        },
        ProbeMessage::ApplyStrategies { strategies } => ClientPayload::ApplyStrategies {
            strategies: parse_json_arg(&strategies)?,
        },
        ProbeMessage::EndSession { request } => ClientPayload::EndSession {
            request: parse_json_arg(&request)?,
        },
        ProbeMessage::Raw { payload } => serde_json::from_value(parse_json_arg(&payload)?)?,
    };
    let envelope = ClientEnvelope {
        browser_session_key: browser_session.clone(),
        payload,
    };

    let ws_url = format!(
        "{}/ws?browser_session_id={}",
        url.trim_end_matches('/'),
        browser_session
    );
    debug!("Connecting to {}", ws_url);

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&ws_url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("Failed to connect to {}: {}", ws_url, e);
            return Err(anyhow::anyhow!("Connection failed: {}", e));
        }
        Err(_) => {
            error!("Connection timeout after 5 seconds");
            return Err(anyhow::anyhow!("Connection timeout - is the hub running?"));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let text = serde_json::to_string(&envelope)?;
    write.send(Message::Text(text.into())).await?;

    let reply = timeout(Duration::from_secs(10), async {
        while let Some(msg) = read.next().await {
            if let Message::Text(text) = msg? {
                let frame: MonitorFrame = serde_json::from_str(&text)?;
                match frame {
                    MonitorFrame::Response { response } => {
                        return Ok::<_, anyhow::Error>(response)
                    }
                    MonitorFrame::Error { message } => {
                        return Err(anyhow::anyhow!("Hub error: {}", message));
                    }
                    other => {
                        // Backend pushes can interleave with the reply.
                        debug!("Skipping unrelated frame: {:?}", other);
                    }
                }
            }
        }
        Err(anyhow::anyhow!("Connection closed before a reply arrived"))
    })
    .await;

    let response = match reply {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            error!("Timeout waiting for reply after 10 seconds");
            return Err(anyhow::anyhow!("Reply timeout"));
        }
    };

    if response.success {
        println!("success: {}", response.message);
    } else {
        println!("failure: {}", response.message);
        if let Some(info) = response.additional_info {
            println!("details: {}", info);
        }
    }

    write.send(Message::Close(None)).await?;
    Ok(())
}
