mod responses;
mod routes;

use anyhow::{anyhow, Context, Result};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, TraceLayer};
use tracing::{info, Level};

use crate::state::State;

pub fn router(state: State) -> Router {
    use axum::routing::{get, post, put};

    let api = Router::new()
        .route("/queues", get(routes::list_queues).post(routes::create_queue))
        .route(
            "/queues/:queue_id",
            get(routes::get_queue)
                .put(routes::update_queue)
                .delete(routes::delete_queue),
        )
        .route("/queues/:queue_id/status", put(routes::update_queue_status))
        .route("/queues/:queue_id/deploy", post(routes::deploy_queue))
        .route(
            "/queues/:queue_id/export-config",
            put(routes::put_export_config)
                .patch(routes::patch_export_config)
                .delete(routes::clear_export_config),
        )
        .route(
            "/queues/:queue_id/export-config/:format",
            put(routes::put_format_config)
                .patch(routes::patch_format_config)
                .delete(routes::clear_format_config),
        )
        .route(
            "/queues/:queue_id/credentials/:basic_username",
            put(routes::put_credential).delete(routes::delete_credential),
        )
        .route(
            "/queues/:queue_id/posts",
            get(routes::list_posts).post(routes::create_post),
        )
        .route(
            "/posts/:post_id",
            get(routes::get_post).delete(routes::delete_post),
        )
        .route("/posts/:post_id/status", put(routes::update_post_status))
        .route("/posts/:post_id/archive", post(routes::archive_post))
        .route(
            "/posts/:post_id/expiration",
            put(routes::update_post_expiration),
        );

    Router::new()
        .route("/", get(routes::index))
        .route("/feeds/:transport_ident/:file_name", get(routes::get_feed))
        .nest("/api", api)
        .layer(
            ServiceBuilder::new().layer(
                TraceLayer::new_for_http()
                    .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                    .on_request(DefaultOnRequest::new().level(Level::INFO)),
            ),
        )
        .with_state(state)
}

pub struct Server {
    socket: TcpListener,
    app: Router,
}

impl Server {
    pub async fn new(state: State) -> Result<Self> {
        let bind_addr = &state.cfg.bind_addr;
        let socket = TcpListener::bind(bind_addr)
            .await
            .with_context(|| anyhow!("could not bind to `{bind_addr}`"))?;
        info!("Listening on `{bind_addr}`");

        Ok(Self {
            socket,
            app: router(state),
        })
    }

    pub async fn serve(self, cancel: CancellationToken) -> Result<()> {
        axum::serve(self.socket, self.app)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
            .context("the HTTP server encountered a failure")
    }
}
