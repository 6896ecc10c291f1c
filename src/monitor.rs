use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::messages::{DomainSessionKey, MonitorFrame};
use crate::registry::SessionRegistry;

/// Evaluator name recorded on strategies the hub applies on its own when
/// every attached browser is in auto mode.
pub const AUTO_APPLIED_EVALUATOR: &str = "auto-applied-by-hub";

/// Fire-and-forget calls into the backend monitor module.
///
/// Delivery is over an unbounded channel; the backend's own success or
/// failure is never surfaced synchronously to the browser that triggered
/// the call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorCommand {
    EvaluatorUpdate {
        request: Value,
        key: DomainSessionKey,
    },
    ApplyStrategies {
        strategies: Value,
        evaluator: String,
        key: DomainSessionKey,
    },
    EndSession {
        request: Value,
        key: DomainSessionKey,
    },
}

/// Backend-originated updates addressed to one user's browsers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorEvent {
    pub user_session_key: String,
    pub update: MonitorUpdate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorUpdate {
    SessionUpdate {
        payload: Value,
    },
    /// The backend is asking the monitoring clients to authorize suggested
    /// strategies. If every attached browser is in auto mode the hub replies
    /// with an ApplyStrategies command itself.
    StrategyAuthorization {
        strategies: Value,
        key: DomainSessionKey,
    },
    SessionEnding,
}

pub fn command_channel() -> (
    mpsc::UnboundedSender<MonitorCommand>,
    mpsc::UnboundedReceiver<MonitorCommand>,
) {
    mpsc::unbounded_channel()
}

pub fn event_channel() -> (
    mpsc::UnboundedSender<MonitorEvent>,
    mpsc::UnboundedReceiver<MonitorEvent>,
) {
    mpsc::unbounded_channel()
}

/// Routes backend events to the owning user session's browsers.
///
/// Runs until the event channel closes. A strategy-authorization event whose
/// relay reports that all attached browsers are in auto mode short-circuits
/// into an automatic ApplyStrategies command.
pub async fn run_event_pump(
    registry: Arc<SessionRegistry>,
    mut events: mpsc::UnboundedReceiver<MonitorEvent>,
    commands: mpsc::UnboundedSender<MonitorCommand>,
) {
    while let Some(event) = events.recv().await {
        let Some(user_session) = registry.get_user_session(&event.user_session_key) else {
            warn!(
                user_session_key = %event.user_session_key,
                "Dropping monitor event for unknown user session"
            );
            continue;
        };

        match event.update {
            MonitorUpdate::SessionUpdate { payload } => {
                user_session.relay_monitor_update(&MonitorFrame::SessionUpdate { payload });
            }
            MonitorUpdate::SessionEnding => {
                user_session.relay_monitor_update(&MonitorFrame::SessionEnding);
            }
            MonitorUpdate::StrategyAuthorization { strategies, key } => {
                let all_auto = user_session.relay_monitor_update(&MonitorFrame::StrategyAuthorization {
                    strategies: strategies.clone(),
                });

                if all_auto {
                    debug!(
                        user_session_key = %event.user_session_key,
                        "All attached browsers in auto mode, applying strategies"
                    );
                    if commands
                        .send(MonitorCommand::ApplyStrategies {
                            strategies,
                            evaluator: AUTO_APPLIED_EVALUATOR.to_string(),
                            key,
                        })
                        .is_err()
                    {
                        warn!("Monitor command channel closed, cannot auto-apply strategies");
                    }
                }
            }
        }
    }

    debug!("Monitor event pump stopped");
}

/// Drains monitor commands and logs them.
///
/// Stands in for the bridge to the backend message bus, which lives outside
/// this service.
pub fn spawn_command_logger(mut commands: mpsc::UnboundedReceiver<MonitorCommand>) {
    tokio::spawn(async move {
        while let Some(command) = commands.recv().await {
            match &command {
                MonitorCommand::EvaluatorUpdate { key, .. } => {
                    info!(domain_session_id = key.domain_session_id, "Forwarding evaluator update");
                }
                MonitorCommand::ApplyStrategies { key, evaluator, .. } => {
                    info!(
                        domain_session_id = key.domain_session_id,
                        %evaluator,
                        "Forwarding apply-strategies request"
                    );
                }
                MonitorCommand::EndSession { key, .. } => {
                    info!(domain_session_id = key.domain_session_id, "Forwarding end-session request");
                }
            }
        }
    });
}
