//! Default handlers, one per envelope kind.

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use chatline_core::{ChatMessage, MessageKind, NoticeLevel, Presence, StoreEvent, User, UserId};
use chatline_protocol::{Envelope, EnvelopeKind, Payload};

use super::{RouteContext, RouteOutcome, Router};
use crate::error::ProcessingError;

type HandlerResult = Result<RouteOutcome, ProcessingError>;

pub(super) fn install(router: &mut Router) {
    router.register_handler(EnvelopeKind::Chat, chat);
    router.register_handler(EnvelopeKind::System, system);
    router.register_handler(EnvelopeKind::UserJoin, user_join);
    router.register_handler(EnvelopeKind::UserLeave, user_leave);
    router.register_handler(EnvelopeKind::UserList, user_list);
    router.register_handler(EnvelopeKind::Typing, typing);
    router.register_handler(EnvelopeKind::Status, status);
    router.register_handler(EnvelopeKind::Ack, ack);
    router.register_handler(EnvelopeKind::Error, error);
    router.register_handler(EnvelopeKind::Ping, ping);
    router.register_handler(EnvelopeKind::Pong, pong);
}

fn unexpected(kind: &'static str, envelope: &Envelope) -> ProcessingError {
    ProcessingError::UnexpectedPayload {
        kind,
        found: envelope.payload().type_name().to_string(),
    }
}

fn system_line(ctx: &mut RouteContext<'_>, kind: MessageKind, text: String) {
    ctx.store.add_message(ChatMessage::system(
        Uuid::new_v4().to_string(),
        kind,
        text,
        Utc::now(),
    ));
}

fn chat(envelope: &Envelope, ctx: &mut RouteContext<'_>) -> HandlerResult {
    let Payload::Chat(payload) = envelope.payload() else {
        return Err(unexpected("chat", envelope));
    };
    if let Some(id) = payload.id.as_deref()
        && ctx.store.contains_message(id)
    {
        debug!(id, "Duplicate chat message");
        return Ok(RouteOutcome::Duplicate { id: id.to_string() });
    }

    let handle = payload.handle.trim();
    let wall = Utc::now();
    if ctx
        .store
        .update_user(handle, |user| {
            user.last_activity = wall;
            user.presence = Presence::Online;
        })
        .is_none()
    {
        ctx.store.add_user(User::new(handle, wall));
    }

    let timestamp = payload
        .timestamp
        .or(envelope.received_at())
        .unwrap_or(wall);
    let id = match payload.id.clone() {
        Some(id) => id,
        None if ctx.is_self(handle) => {
            return Ok(RouteOutcome::Echo {
                handle: handle.to_string(),
                text: payload.text.clone(),
                timestamp,
            });
        }
        None => Uuid::new_v4().to_string(),
    };
    ctx.store.add_message(ChatMessage::received(
        id.clone(),
        handle,
        payload.text.clone(),
        timestamp,
    ));
    Ok(RouteOutcome::Stored { id })
}

fn system(envelope: &Envelope, ctx: &mut RouteContext<'_>) -> HandlerResult {
    let Payload::System(payload) = envelope.payload() else {
        return Err(unexpected("system", envelope));
    };
    let id = Uuid::new_v4().to_string();
    let timestamp = payload.timestamp.unwrap_or_else(Utc::now);
    ctx.store.add_message(ChatMessage::system(
        id.clone(),
        MessageKind::System,
        payload.text.clone(),
        timestamp,
    ));
    Ok(RouteOutcome::Stored { id })
}

fn user_join(envelope: &Envelope, ctx: &mut RouteContext<'_>) -> HandlerResult {
    let Payload::UserJoin(payload) = envelope.payload() else {
        return Err(unexpected("user_join", envelope));
    };
    let handle = payload.handle.trim();
    let wall = Utc::now();

    if ctx.presence.cancel_departure(handle) {
        debug!(handle, "Rejoined within grace period");
        ctx.store.update_user(handle, |user| {
            user.presence = Presence::Online;
            user.last_activity = wall;
        });
        return Ok(RouteOutcome::Handled);
    }

    match ctx.store.user(handle) {
        Some(user) if user.is_online() => {}
        Some(_) => {
            ctx.store.update_user(handle, |user| {
                user.presence = Presence::Online;
                user.last_activity = wall;
            });
        }
        None => {
            ctx.store.add_user(User::new(handle, wall));
            if !ctx.is_self(handle) {
                info!(handle, "User joined");
                system_line(ctx, MessageKind::Join, format!("{handle} joined"));
            }
        }
    }
    Ok(RouteOutcome::Handled)
}

fn user_leave(envelope: &Envelope, ctx: &mut RouteContext<'_>) -> HandlerResult {
    let Payload::UserLeave(payload) = envelope.payload() else {
        return Err(unexpected("user_leave", envelope));
    };
    let handle = payload.handle.trim();
    if ctx.is_self(handle) {
        debug!(handle, "Ignoring leave for the local user");
        return Ok(RouteOutcome::Handled);
    }

    let wall = Utc::now();
    let updated = ctx.store.update_user(handle, |user| {
        user.presence = Presence::Offline;
        user.last_seen = Some(wall);
    });
    if updated.is_some() {
        let at = ctx.now + ctx.config.leave_grace();
        ctx.presence.schedule_departure(handle, at);
        debug!(handle, "Departure scheduled");
    }
    Ok(RouteOutcome::Handled)
}

/// Makes the user set match the roster. The local user is never removed,
/// and users already matching the roster are left untouched.
fn user_list(envelope: &Envelope, ctx: &mut RouteContext<'_>) -> HandlerResult {
    let Payload::UserList(payload) = envelope.payload() else {
        return Err(unexpected("user_list", envelope));
    };
    let wall = Utc::now();
    let listed: Vec<&str> = payload.users.iter().map(|u| u.handle.trim()).collect();
    let listed_ids: Vec<UserId> = listed.iter().map(|h| UserId::from_handle(h)).collect();

    let stale: Vec<String> = ctx
        .store
        .users()
        .filter(|u| !listed_ids.contains(&u.id) && !ctx.is_self(&u.handle))
        .map(|u| u.handle.clone())
        .collect();
    for handle in stale {
        ctx.presence.cancel_departure(&handle);
        ctx.store.remove_user(&handle);
    }

    for handle in listed {
        ctx.presence.cancel_departure(handle);
        match ctx.store.user(handle) {
            Some(user) if user.is_online() => {}
            Some(_) => {
                ctx.store.update_user(handle, |user| user.presence = Presence::Online);
            }
            None => ctx.store.add_user(User::new(handle, wall)),
        }
    }
    Ok(RouteOutcome::Handled)
}

fn typing(envelope: &Envelope, ctx: &mut RouteContext<'_>) -> HandlerResult {
    let Payload::Typing(payload) = envelope.payload() else {
        return Err(unexpected("typing", envelope));
    };
    let handle = payload.handle.trim();
    if !ctx.is_self(handle) {
        ctx.store.emit(StoreEvent::TypingChanged {
            handle: handle.to_string(),
            is_typing: payload.is_typing,
        });
    }
    Ok(RouteOutcome::Handled)
}

fn status(envelope: &Envelope, ctx: &mut RouteContext<'_>) -> HandlerResult {
    let Payload::Status(payload) = envelope.payload() else {
        return Err(unexpected("status", envelope));
    };
    let presence = match payload.status.trim().to_ascii_lowercase().as_str() {
        "online" => Some(Presence::Online),
        "offline" => Some(Presence::Offline),
        _ => None,
    };

    if let (Some(handle), Some(presence)) = (payload.handle.as_deref(), presence) {
        let handle = handle.trim();
        let wall = Utc::now();
        let updated = ctx.store.update_user(handle, |user| {
            user.presence = presence;
            if presence == Presence::Offline {
                user.last_seen = Some(wall);
            }
        });
        if updated.is_none() && presence == Presence::Online {
            ctx.store.add_user(User::new(handle, wall));
        }
        return Ok(RouteOutcome::Handled);
    }

    let text = match (&payload.text, &payload.handle) {
        (Some(text), _) => text.clone(),
        (None, Some(handle)) => format!("{handle} is {}", payload.status),
        (None, None) => format!("Server status: {}", payload.status),
    };
    ctx.store.emit(StoreEvent::notice(NoticeLevel::Info, text));
    Ok(RouteOutcome::Handled)
}

fn ack(envelope: &Envelope, _ctx: &mut RouteContext<'_>) -> HandlerResult {
    let Payload::Ack(payload) = envelope.payload() else {
        return Err(unexpected("ack", envelope));
    };
    Ok(RouteOutcome::Acked {
        id: payload.id.clone(),
    })
}

fn error(envelope: &Envelope, ctx: &mut RouteContext<'_>) -> HandlerResult {
    let Payload::Error(payload) = envelope.payload() else {
        return Err(unexpected("error", envelope));
    };
    let message = if payload.message.trim().is_empty() {
        "unspecified server error".to_string()
    } else {
        payload.message.clone()
    };
    ctx.store.emit(StoreEvent::notice(
        NoticeLevel::Warning,
        format!("Server error: {message}"),
    ));
    Ok(RouteOutcome::ServerError {
        message,
        id: payload.id.clone(),
    })
}

fn ping(envelope: &Envelope, _ctx: &mut RouteContext<'_>) -> HandlerResult {
    match envelope.payload() {
        Payload::Ping(p) => Ok(RouteOutcome::PingReceived(p.timestamp)),
        _ => Err(unexpected("ping", envelope)),
    }
}

fn pong(envelope: &Envelope, _ctx: &mut RouteContext<'_>) -> HandlerResult {
    match envelope.payload() {
        Payload::Pong(p) => Ok(RouteOutcome::Pong(p.timestamp)),
        _ => Err(unexpected("pong", envelope)),
    }
}
