use crate::{auth::view_allows_user, error::WebError, AppState};
use actix_web::{web, HttpRequest, HttpResponse};
use devflow_config::{ViewDeviceSection, ViewSection};
use devflow_sdk::{RegisterType, Value, ValueFilter};
use serde_json::Map;
use std::{collections::HashMap, sync::Arc};
use tracing::debug;

/// Resolve the authenticated user from a bearer token, if any.
pub(crate) fn request_user(state: &AppState, req: &HttpRequest) -> Option<String> {
    let auth = state.auth.as_ref()?;
    let header = req.headers().get("Authorization")?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?;
    auth.check_token(token)
}

pub(crate) fn find_view<'a>(state: &'a AppState, name: &str) -> Result<&'a ViewSection, WebError> {
    state
        .views
        .iter()
        .find(|v| v.name == name)
        .ok_or_else(|| WebError::NotFound(format!("no such view '{name}'")))
}

fn find_view_device<'a>(
    view: &'a ViewSection,
    name: &str,
) -> Result<&'a ViewDeviceSection, WebError> {
    view.devices
        .iter()
        .find(|d| d.name == name)
        .ok_or_else(|| WebError::NotFound(format!("no such device '{name}'")))
}

pub(crate) fn view_device_filter(device: &ViewDeviceSection) -> ValueFilter {
    let mut filter = ValueFilter::device(&device.name);
    for field in &device.skip_fields {
        filter = filter.skip_register(&device.name, field);
    }
    for category in &device.skip_categories {
        filter = filter.skip_category(&device.name, category);
    }
    filter
}

/// Filter covering every device of a view, with the per-device skip lists.
pub(crate) fn view_filter(view: &ViewSection) -> ValueFilter {
    let mut filter = ValueFilter::devices(view.device_names().map(str::to_string));
    for device in &view.devices {
        for field in &device.skip_fields {
            filter = filter.skip_register(&device.name, field);
        }
        for category in &device.skip_categories {
            filter = filter.skip_category(&device.name, category);
        }
    }
    filter
}

fn authorize(state: &AppState, req: &HttpRequest, view: &ViewSection) -> Result<(), WebError> {
    let user = request_user(state, req);
    if view_allows_user(view, user.as_deref()) {
        Ok(())
    } else {
        Err(WebError::Forbidden)
    }
}

/// `GET /views/{view}/devices/{device}/values`: latest values of all the
/// registers of a device.
pub(crate) async fn get_values(
    state: web::Data<Arc<AppState>>,
    path: web::Path<(String, String)>,
    req: HttpRequest,
) -> Result<HttpResponse, WebError> {
    let (view_name, device_name) = path.into_inner();
    let view = find_view(&state, &view_name)?;
    authorize(&state, &req, view)?;
    let device = find_view_device(view, &device_name)?;

    let values = state.storage.get_slice(&view_device_filter(device));
    let response: HashMap<&str, serde_json::Value> = values
        .iter()
        .map(|v| (v.name(), v.generic_json()))
        .collect();
    Ok(HttpResponse::Ok().json(response))
}

/// `GET /views/{view}/devices/{device}/registers`: the register schema.
pub(crate) async fn get_registers(
    state: web::Data<Arc<AppState>>,
    path: web::Path<(String, String)>,
    req: HttpRequest,
) -> Result<HttpResponse, WebError> {
    let (view_name, device_name) = path.into_inner();
    let view = find_view(&state, &view_name)?;
    authorize(&state, &req, view)?;
    find_view_device(view, &device_name)?;

    let runner = state
        .devices
        .get_by_name(&device_name)
        .ok_or_else(|| WebError::NotFound(format!("no such device '{device_name}'")))?;
    let registers = devflow_sdk::sort_registers(runner.driver().registers());
    let schemas: Vec<_> = registers.iter().map(|r| r.schema()).collect();
    Ok(HttpResponse::Ok().json(schemas))
}

/// `PATCH /views/{view}/devices/{device}/values`: apply a map of register
/// name to value onto the command storage, type-checked against the
/// register type. Enum registers accept the integer index.
pub(crate) async fn patch_values(
    state: web::Data<Arc<AppState>>,
    path: web::Path<(String, String)>,
    req: HttpRequest,
    body: web::Json<Map<String, serde_json::Value>>,
) -> Result<HttpResponse, WebError> {
    let (view_name, device_name) = path.into_inner();
    let view = find_view(&state, &view_name)?;
    authorize(&state, &req, view)?;
    find_view_device(view, &device_name)?;

    let runner = state
        .devices
        .get_by_name(&device_name)
        .ok_or_else(|| WebError::NotFound(format!("no such device '{device_name}'")))?;

    // check all inputs before anything reaches the command storage
    let mut commands = Vec::with_capacity(body.len());
    for (register_name, value) in body.iter() {
        let register = runner
            .driver()
            .get_register(register_name)
            .ok_or_else(|| {
                WebError::CommandRejected(format!("unknown register '{register_name}'"))
            })?;
        if !register.controllable() {
            return Err(WebError::CommandRejected(format!(
                "register '{register_name}' is not controllable"
            )));
        }

        let rejected = |t: &str| {
            WebError::CommandRejected(format!("expect type of {register_name} to be a {t}"))
        };
        let command = match register.register_type() {
            RegisterType::Text => match value.as_str() {
                Some(text) => Value::text(register, text),
                None => return Err(rejected("string")),
            },
            RegisterType::Number => match value.as_f64() {
                Some(number) => Value::numeric(register, number),
                None => return Err(rejected("float")),
            },
            RegisterType::Enum => match value.as_i64() {
                Some(index) => Value::enumeration(register, index),
                None => return Err(rejected("float")),
            },
        };
        commands.push(command);
    }

    for command in commands {
        debug!(device = %device_name, register = command.name(), "command accepted");
        state.command_storage.fill(command);
    }
    Ok(HttpResponse::Ok().json(serde_json::json!({})))
}
