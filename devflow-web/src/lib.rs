mod auth;
mod error;
mod values;
mod ws;

pub use auth::AuthState;
pub use error::{ErrorResponse, WebError};

use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use devflow_config::{Config, ViewSection};
use devflow_core::{DevicePool, ValueStorage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Shared state of the HTTP surface.
pub struct AppState {
    pub project_title: String,
    pub views: Vec<ViewSection>,
    pub storage: Arc<ValueStorage>,
    pub command_storage: Arc<ValueStorage>,
    pub devices: Arc<DevicePool>,
    pub auth: Option<AuthState>,
    /// Cache lifetime sent for the configuration endpoints.
    pub config_expires: std::time::Duration,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    user: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    user: String,
    token: String,
}

async fn login(
    state: web::Data<Arc<AppState>>,
    body: web::Json<LoginRequest>,
) -> Result<HttpResponse, WebError> {
    let auth = state
        .auth
        .as_ref()
        .ok_or_else(|| WebError::BadRequest("authentication is disabled".to_string()))?;
    let token = auth.login(&body.user, &body.password)?;
    Ok(HttpResponse::Ok().json(LoginResponse {
        user: body.user.clone(),
        token,
    }))
}

#[derive(Debug, Serialize)]
struct FrontendDevice {
    name: String,
    title: String,
}

#[derive(Debug, Serialize)]
struct FrontendView {
    name: String,
    title: String,
    devices: Vec<FrontendDevice>,
    autoplay: bool,
    #[serde(rename = "isPublic")]
    is_public: bool,
    hidden: bool,
}

#[derive(Debug, Serialize)]
struct FrontendConfig {
    #[serde(rename = "projectTitle")]
    project_title: String,
    views: Vec<FrontendView>,
}

/// `GET /config`: the view/device tree the frontend renders.
async fn get_config(
    state: web::Data<Arc<AppState>>,
    _req: HttpRequest,
) -> Result<HttpResponse, WebError> {
    let views = state
        .views
        .iter()
        .map(|v| FrontendView {
            name: v.name.clone(),
            title: v.title.clone(),
            devices: v
                .devices
                .iter()
                .map(|d| FrontendDevice {
                    name: d.name.clone(),
                    title: d.title.clone().unwrap_or_else(|| d.name.clone()),
                })
                .collect(),
            autoplay: v.autoplay,
            is_public: v.is_public(),
            hidden: v.hidden,
        })
        .collect();
    Ok(HttpResponse::Ok()
        .insert_header((
            "Cache-Control",
            format!("max-age={}", state.config_expires.as_secs()),
        ))
        .json(FrontendConfig {
            project_title: state.project_title.clone(),
            views,
        }))
}

/// Register the API routes on an actix application.
pub fn configure_api(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/login").route(web::post().to(login)))
        .service(web::resource("/config").route(web::get().to(get_config)))
        .service(
            web::resource("/views/{view}/devices/{device}/values")
                .route(web::get().to(values::get_values))
                .route(web::patch().to(values::patch_values)),
        )
        .service(
            web::resource("/views/{view}/devices/{device}/registers")
                .route(web::get().to(values::get_registers)),
        )
        .service(web::resource("/views/{view}/ws").route(web::get().to(ws::view_ws)));
}

/// Build the app state from the frozen configuration.
pub fn build_state(
    config: &Config,
    storage: Arc<ValueStorage>,
    command_storage: Arc<ValueStorage>,
    devices: Arc<DevicePool>,
) -> Result<Arc<AppState>, String> {
    let auth = match &config.authentication {
        Some(section) => Some(AuthState::new(
            section.jwt_secret.as_deref().unwrap_or_default(),
            section.jwt_validity_period,
            std::path::Path::new(&section.htaccess_file),
        )?),
        None => None,
    };
    Ok(Arc::new(AppState {
        project_title: config.project_title.clone(),
        views: config.views.clone(),
        storage,
        command_storage,
        devices,
        auth,
        config_expires: config
            .http_server
            .as_ref()
            .map(|h| h.config_expires)
            .unwrap_or_else(|| std::time::Duration::from_secs(60)),
    }))
}

/// Run the HTTP server until the token is cancelled.
pub async fn run_server(
    bind: String,
    port: u16,
    log_requests: bool,
    state: Arc<AppState>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    info!(bind = %bind, port, "http server starting");
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(Arc::clone(&state)))
            .wrap_fn(move |req, srv| {
                use actix_web::dev::Service as _;
                let method = req.method().clone();
                let path = req.path().to_string();
                let fut = srv.call(req);
                async move {
                    let res = fut.await?;
                    if log_requests {
                        info!(%method, %path, status = %res.status(), "request");
                    }
                    Ok(res)
                }
            })
            .configure(configure_api)
    })
    .bind((bind.as_str(), port))?
    .run();

    let handle = server.handle();
    tokio::spawn(async move {
        cancel.cancelled().await;
        handle.stop(true).await;
    });

    if let Err(e) = server.await {
        error!(error = %e, "http server failed");
        return Err(e);
    }
    info!("http server stopped");
    Ok(())
}
