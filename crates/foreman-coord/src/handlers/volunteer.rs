// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Volunteer registration and login.
//!
//! Registration is fingerprint-deduplicated: a node that comes back after a
//! reinstall (same hardware, possibly a new username) updates its existing
//! row instead of creating a second one, and the response says so with
//! `is_update: true`. Volunteer credentials are machine credentials — the
//! coordinator generates a UUID password and returns it for future logins.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use foreman_protocol::{Envelope, Role};
use foreman_store::{Performance, Volunteer, VolunteerStatus};

use crate::fingerprint;
use crate::handlers::{
    data_object, require_str, require_u64, respond, respond_error, HandlerContext,
    REFRESH_TTL_FACTOR,
};
use crate::password;

const REGISTER_RESPONSE: &str = "auth/volunteer_register_response";
const LOGIN_RESPONSE: &str = "auth/volunteer_login_response";

/// `auth/volunteer_register`
pub async fn volunteer_registration_handler(
    ctx: Arc<HandlerContext>,
    _channel: String,
    envelope: Envelope,
) {
    let request_id = envelope.request_id;
    let Some(data) = data_object(&envelope) else {
        respond_error(&ctx, REGISTER_RESPONSE, request_id, "Format de données invalide").await;
        return;
    };

    // Field validation, in a fixed order so error messages are stable.
    let required = || -> Result<(), String> {
        require_str(data, "username")?;
        require_str(data, "name")?;
        require_str(data, "cpu_model")?;
        require_u64(data, "cpu_cores")?;
        require_u64(data, "total_ram_mb")?;
        require_u64(data, "available_storage_gb")?;
        require_str(data, "operating_system")?;
        require_str(data, "ip_address")?;
        require_u64(data, "communication_port")?;
        Ok(())
    };
    if let Err(message) = required() {
        respond_error(&ctx, REGISTER_RESPONSE, request_id, message).await;
        return;
    }

    let username = data["username"].as_str().unwrap_or_default().to_string();
    let name = data["name"].as_str().unwrap_or_default().to_string();
    let ip = data["ip_address"].as_str().unwrap_or_default().to_string();

    // Machine credentials: generated here, returned once in the response.
    let generated_password = Uuid::new_v4().to_string();
    let password_hash = match password::hash(&generated_password) {
        Ok(h) => h,
        Err(e) => {
            respond_error(&ctx, REGISTER_RESPONSE, request_id, format!("Erreur interne: {e}"))
                .await;
            return;
        }
    };

    let machine_fingerprint = fingerprint::extract(data);
    let known = match ctx.catalog.all_volunteers().await {
        Ok(all) => fingerprint::find_match(&machine_fingerprint, &all),
        Err(e) => {
            respond_error(&ctx, REGISTER_RESPONSE, request_id, e.to_string()).await;
            return;
        }
    };

    // ── Returning machine: update in place ────────────────────────────────
    if let Some(existing_id) = known {
        let Ok(Some(mut volunteer)) = ctx.catalog.volunteer_by_id(existing_id).await else {
            respond_error(&ctx, REGISTER_RESPONSE, request_id, "Volunteer not found").await;
            return;
        };
        volunteer.username = username.clone();
        volunteer.password_hash = password_hash;
        volunteer.name = name;
        volunteer.ip = ip;
        volunteer.status = VolunteerStatus::Available;
        volunteer.last_activity = Utc::now();
        if let Err(e) = ctx.catalog.update_volunteer(&volunteer).await {
            respond_error(&ctx, REGISTER_RESPONSE, request_id, e.to_string()).await;
            return;
        }

        let token = match ctx
            .tokens
            .issue(&volunteer.id.to_string(), Role::Volunteer, ctx.token_ttl_hours)
        {
            Ok(t) => t,
            Err(e) => {
                respond_error(&ctx, REGISTER_RESPONSE, request_id, format!("Erreur interne: {e}"))
                    .await;
                return;
            }
        };

        info!(username, volunteer_id = %volunteer.id, "returning volunteer updated");
        respond(
            &ctx,
            REGISTER_RESPONSE,
            request_id,
            json!({
                "status": "success",
                "message": "Volontaire reconnu et mis à jour",
                "is_update": true,
                "volunteer_id": volunteer.id.to_string(),
                "username": volunteer.username,
                "password": generated_password,
                "token": token,
            }),
        )
        .await;
        return;
    }

    // ── New machine: the username must be free ────────────────────────────
    match ctx.catalog.volunteer_by_username(&username).await {
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

    let volunteer = Volunteer {
        id: Uuid::new_v4(),
        username: username.clone(),
        password_hash,
        name,
        cpu_model: data["cpu_model"].as_str().unwrap_or_default().to_string(),
        cpu_cores: data["cpu_cores"].as_u64().unwrap_or_default() as u32,
        total_ram_mb: data["total_ram_mb"].as_u64().unwrap_or_default(),
        available_storage_gb: data["available_storage_gb"].as_u64().unwrap_or_default(),
        os: data["operating_system"].as_str().unwrap_or_default().to_string(),
        gpu_available: data.get("gpu_available").and_then(|v| v.as_bool()).unwrap_or(false),
        gpu_model: data
            .get("gpu_model")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        gpu_memory_mb: data.get("gpu_memory_mb").and_then(|v| v.as_u64()),
        ip,
        port: data["communication_port"].as_u64().unwrap_or_default() as u16,
        status: VolunteerStatus::Available,
        last_activity: Utc::now(),
        performance: Performance::default(),
        machine_fingerprint,
    };

    if let Err(e) = ctx.catalog.insert_volunteer(&volunteer).await {
        respond_error(&ctx, REGISTER_RESPONSE, request_id, e.to_string()).await;
        return;
    }

    let token = match ctx
        .tokens
        .issue(&volunteer.id.to_string(), Role::Volunteer, ctx.token_ttl_hours)
    {
        Ok(t) => t,
        Err(e) => {
            respond_error(&ctx, REGISTER_RESPONSE, request_id, format!("Erreur interne: {e}"))
                .await;
            return;
        }
    };

    info!(username, volunteer_id = %volunteer.id, "volunteer registered");
    respond(
        &ctx,
        REGISTER_RESPONSE,
        request_id,
        json!({
            "status": "success",
            "message": "Volontaire enregistré avec succès",
            "is_update": false,
            "volunteer_id": volunteer.id.to_string(),
            "username": volunteer.username,
            "password": generated_password,
            "token": token,
        }),
    )
    .await;
}

/// `auth/volunteer_login`
pub async fn volunteer_login_handler(
    ctx: Arc<HandlerContext>,
    _channel: String,
    envelope: Envelope,
) {
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

    let mut volunteer = match ctx.catalog.volunteer_by_username(username).await {
        Ok(Some(v)) => v,
        Ok(None) => {
            warn!(username, "login for unknown volunteer");
            respond_error(&ctx, LOGIN_RESPONSE, request_id, "Identifiants invalides").await;
            return;
        }
        Err(e) => {
            warn!(username, "volunteer lookup failed: {e}");
            respond_error(&ctx, LOGIN_RESPONSE, request_id, "Identifiants invalides").await;
            return;
        }
    };

    if !password::verify(plaintext, &volunteer.password_hash) {
        warn!(username, "wrong volunteer password");
        respond_error(&ctx, LOGIN_RESPONSE, request_id, "Identifiants invalides").await;
        return;
    }

    let subject = volunteer.id.to_string();
    let ttl = ctx.token_ttl_hours;
    let (token, refresh_token) = match (
        ctx.tokens.issue(&subject, Role::Volunteer, ttl),
        ctx.tokens.issue(&subject, Role::Volunteer, ttl * REFRESH_TTL_FACTOR),
    ) {
        (Ok(t), Ok(r)) => (t, r),
        (Err(e), _) | (_, Err(e)) => {
            respond_error(&ctx, LOGIN_RESPONSE, request_id, format!("Erreur interne: {e}"))
                .await;
            return;
        }
    };

    volunteer.last_activity = Utc::now();
    volunteer.status = VolunteerStatus::Available;
    if let Err(e) = ctx.catalog.update_volunteer(&volunteer).await {
        warn!(username, "could not update last_activity: {e}");
    }

    info!(username, volunteer_id = %subject, "volunteer authenticated");
    respond(
        &ctx,
        LOGIN_RESPONSE,
        request_id,
        json!({
            "status": "success",
            "message": "Authentification réussie",
            "token": token,
            "refresh_token": refresh_token,
            "volunteer_id": subject,
            "username": volunteer.username,
        }),
    )
    .await;
}
