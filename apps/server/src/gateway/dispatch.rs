//! Translates client envelopes into Hub calls and formats outbound frames.

use std::sync::Arc;

use serde::Deserialize;

use crate::envelope::{clock_prefix, Envelope, EnvelopeKind};
use crate::session::Session;
use crate::AppState;

/// Default page size for `get_messages` when the client sends none.
const DEFAULT_HISTORY_LIMIT: usize = 50;

/// One inbound client envelope: `{ "type": ..., "data": { ... } }`.
#[derive(Debug, Deserialize)]
struct ClientCommand {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: CommandData,
}

#[derive(Debug, Default, Deserialize)]
struct CommandData {
    #[serde(default)]
    name: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    private: bool,
    #[serde(default)]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

/// Parse and dispatch a single text frame. Failures are reported to the
/// client as `Error: ` frames; the session stays connected.
pub async fn handle_frame(state: &AppState, session: &Arc<Session>, text: &str) {
    let command: ClientCommand = match serde_json::from_str(text) {
        Ok(command) => command,
        Err(err) => {
            tracing::debug!(?err, session = %session.name, "unparseable client frame");
            reply(session, "Error: invalid message format").await;
            return;
        }
    };

    let hub = &state.hub;
    let data = command.data;

    match command.kind.as_str() {
        "chat" => {
            let formatted = format!("{} {}: {}", clock_prefix(), session.name, data.content);
            hub.broadcast(Envelope::from_sender(
                EnvelopeKind::Chat,
                formatted,
                session.id.clone(),
            ))
            .await;
        }

        "room_message" => {
            let Some(room) = hub.current_room(&session.id) else {
                reply(session, "Error: you are not in a room").await;
                return;
            };
            let formatted = format!("{} {}: {}", clock_prefix(), session.name, data.content);
            let mut envelope =
                Envelope::from_sender(EnvelopeKind::RoomMessage, formatted, session.id.clone());
            envelope.target = Some(room.name.clone());
            hub.broadcast_to_room(&room, envelope).await;
            reply(session, "Message sent to room").await;
        }

        "create_room" => {
            let capacity = state.config.default_room_capacity;
            match hub
                .create_room(&data.name, data.private, &data.password, capacity)
                .await
            {
                Ok(room) => {
                    // The creating session joins immediately; the first
                    // join also claims creatorship.
                    if let Err(err) = hub.join_room(session, &room, &data.password).await {
                        reply(session, &format!("Error: {err}")).await;
                    }
                }
                Err(err) => reply(session, &format!("Error: {err}")).await,
            }
        }

        "join_room" => match hub.get_room(&data.name) {
            Some(room) => {
                if let Err(err) = hub.join_room(session, &room, &data.password).await {
                    reply(session, &format!("Error: {err}")).await;
                }
            }
            None => reply(session, "Error: room does not exist").await,
        },

        "leave_room" => {
            hub.leave_room(session).await;
        }

        "list_rooms" => {
            let rooms = hub.room_list(&session.id);
            match serde_json::to_string(&rooms) {
                Ok(json) => reply(session, &format!("ROOMS_LIST:{json}")).await,
                Err(err) => {
                    tracing::error!(?err, "failed to encode room list");
                    reply(session, "Error: internal error").await;
                }
            }
        }

        "delete_room" => match hub.delete_room(session, &data.name).await {
            Ok(()) => reply(session, &format!("Room '{}' deleted successfully", data.name)).await,
            Err(err) => reply(session, &format!("Error: {err}")).await,
        },

        "get_messages" => {
            let limit = if data.limit == 0 {
                DEFAULT_HISTORY_LIMIT
            } else {
                data.limit
            };
            match hub.room_history(&data.name, limit, data.offset).await {
                Ok(messages) => match serde_json::to_string(&messages) {
                    Ok(json) => reply(session, &format!("MESSAGES:{json}")).await,
                    Err(err) => {
                        tracing::error!(?err, "failed to encode message history");
                        reply(session, "Error: internal error").await;
                    }
                },
                Err(err) => reply(session, &format!("Error: {err}")).await,
            }
        }

        other => {
            reply(session, &format!("Error: unknown message type: {other}")).await;
        }
    }
}

async fn reply(session: &Arc<Session>, text: &str) {
    if session.send(text).await.is_err() {
        tracing::debug!(session = %session.name, "reply write failed");
    }
}
