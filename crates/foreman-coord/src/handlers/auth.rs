// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Manager registration and login.
//!
//! Registration hashes the password with argon2 and relies on the store's
//! unique indexes to catch concurrent duplicates. Login verifies against
//! the stored hash — there is no development-mode bypass — and mints an
//! access/refresh token pair.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use foreman_protocol::{Envelope, Role};
use foreman_store::{Manager, ManagerStatus};

use crate::handlers::{
    data_object, require_str, respond, respond_error, HandlerContext, REFRESH_TTL_FACTOR,
};
use crate::password;

const REGISTER_RESPONSE: &str = "auth/register_response";
const LOGIN_RESPONSE: &str = "auth/login_response";

/// `auth/register`
pub async fn manager_registration_handler(
    ctx: Arc<HandlerContext>,
    _channel: String,
    envelope: Envelope,
) {
    let request_id = envelope.request_id;
    let Some(data) = data_object(&envelope) else {
        respond_error(&ctx, REGISTER_RESPONSE, request_id, "Format de données invalide").await;
        return;
    };

    let (username, email, plaintext) = match (
        require_str(data, "username"),
        require_str(data, "email"),
        require_str(data, "password"),
    ) {
        (Ok(u), Ok(e), Ok(p)) => (u, e, p),
        (Err(m), _, _) | (_, Err(m), _) | (_, _, Err(m)) => {
            respond_error(&ctx, REGISTER_RESPONSE, request_id, m).await;
            return;
        }
    };

    match ctx.catalog.manager_by_email(email).await {
        Ok(Some(_)) => {
            respond_error(&ctx, REGISTER_RESPONSE, request_id, "Cet email est déjà utilisé")
                .await;
            return;
        }
        Ok(None) => {}
        Err(e) => {
            respond_error(&ctx, REGISTER_RESPONSE, request_id, e.to_string()).await;
            return;
        }
    }
    match ctx.catalog.manager_by_username(username).await {
        Ok(Some(_)) => {
            respond_error(
                &ctx,
                REGISTER_RESPONSE,
                request_id,
                "Ce nom d'utilisateur est déjà utilisé",
            )
            .await;
            return;
        }
        Ok(None) => {}
        Err(e) => {
            respond_error(&ctx, REGISTER_RESPONSE, request_id, e.to_string()).await;
            return;
        }
    }

    let hash = match password::hash(plaintext) {
        Ok(h) => h,
        Err(e) => {
            respond_error(&ctx, REGISTER_RESPONSE, request_id, format!("Erreur interne: {e}"))
                .await;
            return;
        }
    };

    let manager = Manager::new(username.to_string(), email.to_string(), hash);
    // The unique indexes are the last word: a racing registration surfaces
    // here as a duplicate error.
    if let Err(e) = ctx.catalog.insert_manager(&manager).await {
        respond_error(&ctx, REGISTER_RESPONSE, request_id, e.to_string()).await;
        return;
    }

    info!(username, manager_id = %manager.id, "manager registered");
    respond(
        &ctx,
        REGISTER_RESPONSE,
        request_id,
        json!({
            "status": "success",
            "message": "Enregistrement réussi",
            "manager_id": manager.id.to_string(),
            "username": manager.username,
            "email": manager.email,
        }),
    )
    .await;
}

/// `auth/login`
pub async fn manager_login_handler(ctx: Arc<HandlerContext>, _channel: String, envelope: Envelope) {
    let request_id = envelope.request_id;
    let Some(data) = data_object(&envelope) else {
        respond_error(&ctx, LOGIN_RESPONSE, request_id, "Format de données invalide").await;
        return;
    };

    let (username, plaintext) = match (require_str(data, "username"), require_str(data, "password"))
    {
        (Ok(u), Ok(p)) => (u, p),
        (Err(m), _) | (_, Err(m)) => {
            respond_error(&ctx, LOGIN_RESPONSE, request_id, m).await;
            return;
        }
    };

    let mut manager = match ctx.catalog.manager_by_username(username).await {
        Ok(Some(m)) => m,
        Ok(None) => {
            warn!(username, "login for unknown manager");
            respond_error(&ctx, LOGIN_RESPONSE, request_id, "Identifiants invalides").await;
            return;
        }
        Err(e) => {
            warn!(username, "manager lookup failed: {e}");
            respond_error(&ctx, LOGIN_RESPONSE, request_id, "Identifiants invalides").await;
            return;
        }
    };

    if !password::verify(plaintext, &manager.password_hash) {
        warn!(username, "wrong password");
        respond_error(&ctx, LOGIN_RESPONSE, request_id, "Identifiants invalides").await;
        return;
    }
    if manager.status != ManagerStatus::Active {
        respond_error(&ctx, LOGIN_RESPONSE, request_id, "Ce compte n'est pas actif").await;
        return;
    }

    let subject = manager.id.to_string();
    let ttl = ctx.token_ttl_hours;
    let (token, refresh_token) = match (
        ctx.tokens.issue(&subject, Role::Manager, ttl),
        ctx.tokens.issue(&subject, Role::Manager, ttl * REFRESH_TTL_FACTOR),
    ) {
        (Ok(t), Ok(r)) => (t, r),
        (Err(e), _) | (_, Err(e)) => {
            respond_error(&ctx, LOGIN_RESPONSE, request_id, format!("Erreur interne: {e}"))
                .await;
            return;
        }
    };

    manager.last_login = Some(Utc::now());
    if let Err(e) = ctx.catalog.update_manager(&manager).await {
        // Not fatal: the login still succeeds.
        warn!(username, "could not update last_login: {e}");
    }

    info!(username, manager_id = %subject, "manager authenticated");
    respond(
        &ctx,
        LOGIN_RESPONSE,
        request_id,
        json!({
            "status": "success",
            "message": "Authentification réussie",
            "token": token.clone(),
            "refresh_token": refresh_token,
            "manager_id": subject.clone(),
            "username": manager.username.clone(),
            "email": manager.email,
        }),
    )
    .await;

    // Privileged broadcast so manager-side tooling sees the session come
    // online; carries the access token for that tooling's own use.
    let status = json!({
        "manager_id": subject,
        "username": manager.username,
        "status": "online",
        "token": token,
        "timestamp": Utc::now().to_rfc3339(),
    });
    if let Err(e) = ctx
        .client
        .publish(
            "manager/status",
            status,
            None,
            Some(ctx.coordinator_token.clone()),
            None,
            None,
        )
        .await
    {
        warn!("manager/status publish failed: {e}");
    }
}
