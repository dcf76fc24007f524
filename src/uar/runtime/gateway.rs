//! Subscription protocol over a run's event log.
//!
//! A subscriber always receives a `handshake` frame first. What follows
//! depends on the request:
//!
//! - `start` follows a run from index 0, dispatching it first when the
//!   request names an owner instead of a known run.
//! - `reconnect` on an active run sends `catch_up`, the missed events,
//!   `subscribed`, then live events.
//! - `reconnect` on a terminal run sends `replay` and the whole buffer, for
//!   as long as the log is retained (`runtime.event_retention_secs`).
//!
//! The transport (WebSocket or anything else) only forwards frames.

use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RunFault;
use crate::uar::domain::events::RunEvent;
use crate::uar::domain::runs::{OwnerType, RunStatus};
use crate::uar::runtime::manager::{DispatchMode, DispatchRequest, Dispatched, RunManager};

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscribeAction {
    Start,
    Reconnect,
}

/// First message a client sends.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscribeRequest {
    pub action: SubscribeAction,
    #[serde(default)]
    pub run_id: Option<String>,
    /// Index of the last event the client already holds.
    #[serde(default)]
    pub last_event_index: Option<u64>,
    pub session_id: String,
    #[serde(default)]
    pub owner_type: Option<OwnerType>,
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub additional_data: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    Live,
    CatchUp,
    Replay,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Handshake {
        protocol_version: u32,
    },
    Event {
        #[serde(flatten)]
        event: RunEvent,
        delivery: Delivery,
    },
    CatchUp {
        run_id: String,
        missed_events: u64,
        current_event_count: u64,
        status: RunStatus,
    },
    Subscribed {
        run_id: String,
        current_event_count: u64,
    },
    Replay {
        run_id: String,
        status: RunStatus,
        total_events: u64,
    },
    Error {
        error: String,
    },
}

impl ServerFrame {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
        }
    }

    /// Event index carried by an event frame.
    pub fn event_index(&self) -> Option<u64> {
        match self {
            Self::Event { event, .. } => Some(event.event_index),
            _ => None,
        }
    }
}

fn tagged(events: Vec<RunEvent>, delivery: Delivery) -> impl Iterator<Item = ServerFrame> {
    events
        .into_iter()
        .map(move |event| ServerFrame::Event { event, delivery })
}

#[derive(Debug, Clone)]
pub struct StreamingGateway {
    manager: Arc<RunManager>,
}

impl StreamingGateway {
    pub fn new(manager: Arc<RunManager>) -> Self {
        Self { manager }
    }

    /// Parse a client message; anything malformed becomes an error frame.
    pub fn parse(message: &str) -> Result<SubscribeRequest, ServerFrame> {
        serde_json::from_str(message)
            .map_err(|e| ServerFrame::error(format!("malformed subscribe message: {e}")))
    }

    /// Frames for a request that could not be parsed.
    pub fn reject(frame: ServerFrame) -> BoxStream<'static, ServerFrame> {
        stream::iter([Self::handshake(), frame]).boxed()
    }

    fn handshake() -> ServerFrame {
        ServerFrame::Handshake {
            protocol_version: PROTOCOL_VERSION,
        }
    }

    /// Every frame the subscriber should receive, ending when the run does
    /// or right after an error frame.
    pub async fn subscribe(&self, request: SubscribeRequest) -> BoxStream<'static, ServerFrame> {
        let action = request.action;
        let body = match action {
            SubscribeAction::Start => self.start(request).await,
            SubscribeAction::Reconnect => self.reconnect(request).await,
        };
        match body {
            Ok(frames) => stream::once(async { Self::handshake() })
                .chain(frames)
                .boxed(),
            Err(fault) => {
                tracing::debug!(action = ?action, error = %fault, "Subscription refused");
                Self::reject(ServerFrame::error(fault.to_string()))
            }
        }
    }

    async fn start(
        &self,
        request: SubscribeRequest,
    ) -> Result<BoxStream<'static, ServerFrame>, RunFault> {
        if let Some(run_id) = &request.run_id
            && let Some(subscription) = self.manager.events().subscribe(run_id, 0)
        {
            tracing::debug!(run_id = %run_id, "Following existing run");
            return Ok(live(subscription.into_stream().boxed()));
        }

        let (Some(owner_type), Some(owner_id), Some(input)) =
            (request.owner_type, request.owner_id, request.input)
        else {
            return Err(match request.run_id {
                Some(run_id) => RunFault::NotFound(run_id),
                None => RunFault::Validation(
                    "start needs a run_id or owner_type, owner_id and input".to_string(),
                ),
            });
        };

        let mut dispatch = DispatchRequest::new(owner_type, owner_id, input)
            .mode(DispatchMode::Stream)
            .session_id(request.session_id)
            .additional_data(request.additional_data);
        if let Some(run_id) = request.run_id {
            dispatch = dispatch.run_id(run_id);
        }
        match self.manager.dispatch(dispatch).await? {
            // The subscriber follows the run but does not own it; a dropped
            // socket can reconnect, and only an explicit cancel ends the run.
            Dispatched::Stream(events) => Ok(live(events.detach())),
            other => Err(RunFault::Execution(format!(
                "stream dispatch returned {other:?}"
            ))),
        }
    }

    async fn reconnect(
        &self,
        request: SubscribeRequest,
    ) -> Result<BoxStream<'static, ServerFrame>, RunFault> {
        let run_id = request
            .run_id
            .ok_or_else(|| RunFault::Validation("reconnect needs a run_id".to_string()))?;
        let (snapshot, subscription) = self
            .manager
            .events()
            .snapshot_and_subscribe(&run_id)
            .ok_or_else(|| RunFault::NotFound(run_id.clone()))?;
        let count = snapshot.count();

        if let Some(status) = snapshot.terminal {
            tracing::debug!(run_id = %run_id, total_events = count, "Replaying finished run");
            let header = ServerFrame::Replay {
                run_id,
                status,
                total_events: count,
            };
            return Ok(stream::iter(
                std::iter::once(header).chain(tagged(snapshot.events, Delivery::Replay)),
            )
            .boxed());
        }

        let first_missing = request.last_event_index.map_or(0, |n| n.saturating_add(1));
        let missed: Vec<RunEvent> = snapshot
            .events
            .into_iter()
            .skip(usize::try_from(first_missing).unwrap_or(usize::MAX))
            .collect();
        let status = match self.manager.get_run(&run_id).await {
            Ok(record) => record.map_or(RunStatus::Running, |r| r.status),
            Err(e) => {
                tracing::warn!(run_id = %run_id, error = %e, "Run status unavailable; reporting running");
                RunStatus::Running
            }
        };

        tracing::debug!(
            run_id = %run_id,
            missed_events = missed.len(),
            current_event_count = count,
            "Client caught up"
        );
        let mut frames = vec![ServerFrame::CatchUp {
            run_id: run_id.clone(),
            missed_events: missed.len() as u64,
            current_event_count: count,
            status,
        }];
        frames.extend(tagged(missed, Delivery::CatchUp));
        frames.push(ServerFrame::Subscribed {
            run_id,
            current_event_count: count,
        });

        Ok(stream::iter(frames)
            .chain(live(subscription.into_stream().boxed()))
            .boxed())
    }
}

fn live(events: BoxStream<'static, RunEvent>) -> BoxStream<'static, ServerFrame> {
    events
        .map(|event| ServerFrame::Event {
            event,
            delivery: Delivery::Live,
        })
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_message_is_rejected() {
        let Err(frame) = StreamingGateway::parse("{\"action\":\"jump\"}") else {
            panic!("expected an error frame");
        };
        assert!(matches!(frame, ServerFrame::Error { .. }));
    }

    #[test]
    fn test_reconnect_message_parses() {
        let request = StreamingGateway::parse(
            r#"{"action":"reconnect","run_id":"r1","last_event_index":7,"session_id":"s1"}"#,
        )
        .unwrap();
        assert_eq!(request.action, SubscribeAction::Reconnect);
        assert_eq!(request.last_event_index, Some(7));
        assert_eq!(request.owner_type, None);
    }

    #[test]
    fn test_control_frames_are_tagged_by_type() {
        let frame = ServerFrame::Subscribed {
            run_id: "r1".to_string(),
            current_event_count: 12,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "subscribed");
        assert_eq!(json["current_event_count"], 12);
    }
}
