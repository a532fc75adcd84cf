// This file is part of flowindex.
// Copyright (C) 2025 Flowindex Contributors
// SPDX-License-Identifier: Apache-2.0
// Licensed under the Apache License, Version 2.0 (the "License");
// You may not use this file except in compliance with the License.
// You may obtain a copy of the License at
// http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::{application::StatusHub, domain::storage::Storage};
use axum::{
    Json, Router,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use log::{debug, info};
use serde::Deserialize;
use serde_json::json;
use std::{io, net::IpAddr};
use thiserror::Error;
use tokio::{net::TcpListener, signal::unix::{SignalKind, signal}};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub address: IpAddr,
    pub port: u16,

    #[serde(default = "request_body_limit_default")]
    pub request_body_limit: usize,

    #[serde(default = "price_history_max_limit_default")]
    pub price_history_max_limit: u32,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("cannot bind tcp listener")]
    Bind(#[source] io::Error),

    #[error("cannot serve API")]
    Serve(#[source] io::Error),
}

#[derive(Clone)]
struct AppState<S> {
    hub: StatusHub,
    storage: S,
    price_history_max_limit: u32,
}

/// Serve the status surface: `/status`, `/status/price/history`, `/ws/status`, `/ready`.
pub async fn serve<S>(config: Config, hub: StatusHub, storage: S) -> Result<(), ApiError>
where
    S: Storage,
{
    let Config {
        address,
        port,
        request_body_limit,
        price_history_max_limit,
    } = config;

    let state = AppState {
        hub,
        storage,
        price_history_max_limit,
    };

    let app = Router::new()
        .route("/status", get(status::<S>))
        .route("/status/price/history", get(price_history::<S>))
        .route("/ws/status", get(ws_status::<S>))
        .route("/ready", get(ready::<S>))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(RequestBodyLimitLayer::new(request_body_limit))
                .layer(CorsLayer::permissive()),
        );

    let listener = TcpListener::bind((address, port))
        .await
        .map_err(ApiError::Bind)?;
    info!(address:?, port; "listening to TCP connections");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(ApiError::Serve)
}

async fn status<S>(State(state): State<AppState<S>>) -> Response
where
    S: Storage,
{
    match state.hub.cache.read().clone() {
        Some(report) => Json(report).into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "status has not been computed yet",
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct PriceHistoryQuery {
    limit: Option<u32>,
}

async fn price_history<S>(
    State(state): State<AppState<S>>,
    Query(query): Query<PriceHistoryQuery>,
) -> Response
where
    S: Storage,
{
    let limit = query
        .limit
        .unwrap_or(100)
        .min(state.price_history_max_limit);

    match state.storage.price_history(limit).await {
        Ok(data) => Json(json!({ "data": data })).into_response(),
        Err(error) => {
            debug!(error:% = error; "cannot read price history");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn ws_status<S>(State(state): State<AppState<S>>, upgrade: WebSocketUpgrade) -> Response
where
    S: Storage,
{
    upgrade.on_upgrade(move |socket| push_status(socket, state.hub))
}

/// Send the current status on connect, then every material change.
async fn push_status(mut socket: WebSocket, hub: StatusHub) {
    let mut updates = hub.updates.subscribe();

    let current = hub.cache.read().clone();
    if let Some(report) = current {
        let Ok(payload) = serde_json::to_string(&report) else {
            return;
        };
        if socket.send(Message::Text(payload.into())).await.is_err() {
            return;
        }
    }

    loop {
        match updates.recv().await {
            Ok(report) => {
                let Ok(payload) = serde_json::to_string(&report) else {
                    continue;
                };
                if socket.send(Message::Text(payload.into())).await.is_err() {
                    return;
                }
            }

            // Skipped some updates under lag; the next received one is current enough.
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,

            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn ready<S>(State(state): State<AppState<S>>) -> Response
where
    S: Storage,
{
    if state.hub.cache.read().is_some() {
        StatusCode::OK.into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            "status has not been computed yet",
        )
            .into_response()
    }
}

async fn shutdown_signal() {
    signal(SignalKind::terminate())
        .expect("install SIGTERM handler")
        .recv()
        .await;
}

fn request_body_limit_default() -> usize {
    64 * 1024
}

fn price_history_max_limit_default() -> u32 {
    1_000
}
