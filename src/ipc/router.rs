use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;
use std::time::Instant;

fn dispatch(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Some(resp) = handlers::core::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::setup::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::access::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::users::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::students::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::custom_fields::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::rules::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::invoices::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::staging::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::dashboard::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::backup::try_handle(state, req) {
        return resp;
    }

    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    let span = tracing::debug_span!("request", id = %req.id, method = %req.method);
    let _enter = span.enter();
    let started = Instant::now();

    let resp = dispatch(state, &req);

    let elapsed_ms = started.elapsed().as_millis() as u64;
    if resp.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = resp
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        let message = resp
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("");
        tracing::warn!(code, message, elapsed_ms, "request failed");
    } else {
        tracing::debug!(elapsed_ms, "request handled");
    }
    resp
}
