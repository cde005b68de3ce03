use crate::{
    auth::view_allows_user,
    error::WebError,
    values::{find_view, view_filter},
    AppState,
};
use actix_web::{web, HttpRequest, HttpResponse};
use actix_ws::{Message as WsMessage, Session};
use devflow_config::ViewSection;
use devflow_core::StorageError;
use devflow_sdk::Value;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Map;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

/// Delta messages are flushed at most this often (4 Hz), coalescing to the
/// latest value per register within each tick.
const FLUSH_INTERVAL: Duration = Duration::from_millis(250);
const WS_SUBSCRIPTION_BUFFER: usize = 512;

#[derive(Debug, Deserialize)]
struct AuthMessage {
    #[serde(rename = "authToken")]
    auth_token: String,
}

#[derive(Debug, Serialize)]
struct ValuesMessage {
    values: Map<String, serde_json::Value>,
}

fn append_value(buffer: &mut Map<String, serde_json::Value>, value: &Value) {
    let device = buffer
        .entry(value.device_name().to_string())
        .or_insert_with(|| serde_json::Value::Object(Map::new()));
    if let serde_json::Value::Object(device) = device {
        device.insert(value.name().to_string(), value.generic_json());
    }
}

async fn send_values(
    session: &mut Session,
    values: Map<String, serde_json::Value>,
) -> Result<(), actix_ws::Closed> {
    let message = ValuesMessage { values };
    match serde_json::to_string(&message) {
        Ok(text) => session.text(text).await,
        Err(e) => {
            warn!(error = %e, "cannot encode ws message");
            Ok(())
        }
    }
}

/// `GET /views/{view}/ws`: authenticates via an `{"authToken": …}` first
/// frame (unless the view is public), then emits the full snapshot followed
/// by coalesced `{"values": {device: {register: value}}}` deltas.
pub(crate) async fn view_ws(
    state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
    req: HttpRequest,
    body: web::Payload,
) -> Result<HttpResponse, actix_web::Error> {
    let view_name = path.into_inner();
    let view = find_view(&state, &view_name)
        .map_err(actix_web::Error::from)?
        .clone();

    let (response, session, msg_stream) = actix_ws::handle(&req, body)?;
    let state: Arc<AppState> = state.get_ref().clone();

    actix_rt::spawn(async move {
        info!(view = %view.name, "ws connection established");
        ws_loop(state, view, session, msg_stream).await;
    });

    Ok(response)
}

async fn ws_loop(
    state: Arc<AppState>,
    view: ViewSection,
    mut session: Session,
    mut msg_stream: actix_ws::MessageStream,
) {
    // authentication: public views skip it, otherwise the first frame must
    // carry a valid token for an allowed user
    if !view.is_public() {
        let authenticated = wait_for_auth(&state, &view, &mut msg_stream).await;
        if !authenticated {
            debug!(view = %view.name, "ws authentication failed");
            let _ = session.close(None).await;
            return;
        }
    }

    let filter = view_filter(&view);
    let cancel = tokio_util::sync::CancellationToken::new();
    let sub = state
        .storage
        .subscribe_with_buffer(cancel.child_token(), filter, WS_SUBSCRIPTION_BUFFER);

    // send all values after the initial connect; the subscription queue is
    // seeded with the snapshot, so drain it for the first frame
    let mut snapshot = Map::new();
    while let Some(value) = sub.try_recv() {
        append_value(&mut snapshot, &value);
    }
    if send_values(&mut session, snapshot).await.is_err() {
        cancel.cancel();
        return;
    }

    let mut pending: Map<String, serde_json::Value> = Map::new();
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            message = msg_stream.next() => {
                match message {
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(WsMessage::Ping(bytes))) => {
                        if session.pong(&bytes).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(view = %view.name, error = %e, "ws stream error");
                        break;
                    }
                }
            }
            received = sub.recv() => {
                match received {
                    Ok(value) => append_value(&mut pending, &value),
                    Err(StorageError::SubscriberOverflow) => {
                        warn!(view = %view.name, "ws subscription overflowed, closing");
                        break;
                    }
                    Err(StorageError::Closed) => break,
                }
            }
            _ = ticker.tick() => {
                if !pending.is_empty() {
                    let values = std::mem::take(&mut pending);
                    if send_values(&mut session, values).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    cancel.cancel();
    let _ = session.close(None).await;
    info!(view = %view.name, "ws connection closed");
}

async fn wait_for_auth(
    state: &AppState,
    view: &ViewSection,
    msg_stream: &mut actix_ws::MessageStream,
) -> bool {
    let Some(auth) = state.auth.as_ref() else {
        return false;
    };
    while let Some(Ok(message)) = msg_stream.next().await {
        match message {
            WsMessage::Text(text) => {
                let Ok(auth_message) = serde_json::from_str::<AuthMessage>(&text) else {
                    continue;
                };
                let Some(user) = auth.check_token(&auth_message.auth_token) else {
                    return false;
                };
                debug!(view = %view.name, user = %user, "ws user authenticated");
                return view_allows_user(view, Some(&user));
            }
            WsMessage::Close(_) => return false,
            _ => continue,
        }
    }
    false
}
