//! Web服务器

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
    Router,
};
use patho_core::Result;
use std::future::Future;
use std::net::SocketAddr;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use tracing::info;

use crate::auth::identity_middleware;
use crate::handlers::*;
use crate::report::generate_document;
use crate::state::AppState;

pub struct WebServer {
    addr: SocketAddr,
    app: Router,
}

impl WebServer {
    pub fn new(addr: SocketAddr, state: AppState) -> Self {
        Self {
            addr,
            app: create_app(state),
        }
    }

    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// 运行直到 `shutdown` 完成，正在处理的请求会先处理完
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!("Starting web server on {}", self.addr);

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("Web server stopped");
        Ok(())
    }
}

pub fn create_app(state: AppState) -> Router {
    let body_limit = state.uploads.max_upload_bytes;
    let media_url = state.uploads.media_url.trim_end_matches('/').to_string();
    let media = ServeDir::new(state.storage.base_path());

    // 需要识别身份的路由
    let identified = Router::new()
        .nest("/api/v1", api_routes())
        .route("/pathology/generatedoc", get(generate_document))
        .layer(axum::middleware::from_fn_with_state(
            state.auth.clone(),
            identity_middleware,
        ));

    Router::new()
        // 根路径
        .route("/", get(api_root))
        // 健康检查
        .route("/health", get(health))
        .merge(identified)
        // 切片和瓦片文件
        .nest_service(&media_url, media)
        // 全局中间件
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                ),
        )
        .with_state(state)
}

/// API v1 路由
fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(api_root))
        .route("/auth/me", get(current_identity))
        .route("/patients", get(list_patients).post(create_patient))
        .route(
            "/patients/:id",
            get(get_patient).patch(update_patient).delete(delete_patient),
        )
        .route("/patients/:id/pictures", get(patient_pictures))
        .route("/pictures", post(upload_picture))
        .route("/pictures/:id", get(get_picture).delete(delete_picture))
        .route("/pictures/:id/dzi", get(picture_dzi))
        .route("/diagnoses", get(list_diagnoses).post(create_diagnosis))
        .route("/diagnoses/:id", get(get_diagnosis).patch(patch_diagnosis))
        .route("/diagnoses/:id/region", post(crop_region))
        .route(
            "/diagnoses/:id/assignees",
            get(list_assignees).post(assign_clinician),
        )
        .route(
            "/diagnoses/:id/assignees/:clinician_id",
            delete(unassign_clinician),
        )
        .route("/diagnoses/:id/labels", get(list_labels).post(add_label))
        .route("/diagnoses/:id/findings", get(findings))
}
