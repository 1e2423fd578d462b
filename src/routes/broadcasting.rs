use std::{convert::Infallible, time::Duration};

use anyhow::Context;
use axum::{
    extract::{Path, State},
    response::{
        IntoResponse,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;
use validator::Validate;

use crate::{
    app_error::{AppError, ErrorResponse, StdResponse, ValidJson},
    app_state::AppState,
    auth::AuthUser,
    broadcast::{Channel, envelope_stream},
    policy::{self, Action},
    services::messages,
};

const KEEP_ALIVE_SECS: u64 = 15;

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().nest(
        "/broadcasting",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(authorize_channel))
            .routes(utoipa_axum::routes!(channel_events)),
    )
}

/// Resolves a client-supplied channel name and checks that `user` may listen on it.
async fn join(
    state: &AppState,
    user: &AuthUser,
    channel_name: &str,
) -> Result<Channel, AppError> {
    let channel = Channel::parse(channel_name).ok_or(AppError::NotFound("Channel"))?;

    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let participants = messages::participants(conn, channel.consultation_id()).await?;
    policy::authorize(user, Action::JoinConsultationChannel(participants))?;
    Ok(channel)
}

#[derive(Deserialize, Validate, ToSchema)]
struct ChannelAuthReq {
    /// `consultation.{id}` or `typing.consultation.{id}`, optionally prefixed with `private-`.
    #[validate(length(min = 1, max = 255))]
    pub channel_name: String,
}

#[derive(Serialize, ToSchema)]
struct ChannelAuthRes {
    pub channel_name: String,
    pub consultation_id: i64,
}

/// Check whether the caller may subscribe to a consultation channel.
#[utoipa::path(
    post,
    path = "/auth",
    tags = ["Broadcasting"],
    security(("bearerAuth" = [])),
    request_body = ChannelAuthReq,
    responses(
        (status = 200, description = "Channel authorized", body = StdResponse<ChannelAuthRes>),
        (status = 403, description = "Not a participant", body = ErrorResponse),
        (status = 404, description = "Unknown channel or consultation", body = ErrorResponse)
    )
)]
async fn authorize_channel(
    State(state): State<AppState>,
    user: AuthUser,
    ValidJson(body): ValidJson<ChannelAuthReq>,
) -> Result<impl IntoResponse, AppError> {
    let channel = join(&state, &user, &body.channel_name).await?;
    Ok(StdResponse::ok(
        ChannelAuthRes {
            channel_name: channel.name(),
            consultation_id: channel.consultation_id(),
        },
        "Channel authorized",
    ))
}

/// Stream a channel's events as Server-Sent Events.
#[utoipa::path(
    get,
    path = "/channels/{channel}/events",
    tags = ["Broadcasting"],
    security(("bearerAuth" = [])),
    params(("channel" = String, Path, description = "Channel name")),
    responses(
        (status = 200, description = "Event stream", content_type = "text/event-stream"),
        (status = 403, description = "Not a participant", body = ErrorResponse),
        (status = 404, description = "Unknown channel or consultation", body = ErrorResponse)
    )
)]
async fn channel_events(
    Path(channel): Path<String>,
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let channel = join(&state, &user, &channel).await?;
    let receiver = state.broadcaster.subscribe(&channel);
    tracing::info!("User #{} listening on {}", user.id, channel.name());

    let stream = envelope_stream(receiver).filter_map(|envelope| async move {
        match Event::default()
            .event(envelope.event.as_str())
            .json_data(&envelope.data)
        {
            Ok(event) => Some(Ok(event)),
            Err(err) => {
                tracing::warn!("Failed to encode {} for SSE: {:?}", envelope.event, err);
                None
            }
        }
    });

    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(KEEP_ALIVE_SECS))))
}
