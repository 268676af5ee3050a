//! HTTP surface.
//!
//! Every route except `/health` and the SoD catalog needs a caller identity,
//! see [`identity::Identity`].

pub mod error;
pub mod identity;
pub mod routes;
pub mod state;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::store::GovernanceStore;

pub use error::ApiError;
pub use identity::Identity;
pub use state::AppState;

pub fn router<R: GovernanceStore>(state: AppState<R>) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/governance/validate", post(routes::validate::<R>))
        .route("/governance/sod-rules", get(routes::sod_rules::<R>))
        .route("/workflow/approval-requests", post(routes::create_request::<R>))
        .route("/workflow/approval-requests/:id", get(routes::get_request::<R>))
        .route("/workflow/approval-requests/:id/approve", post(routes::approve::<R>))
        .route("/workflow/approval-requests/:id/reject", post(routes::reject::<R>))
        .route("/workflow/approval-requests/:id/delegate", post(routes::delegate::<R>))
        .route("/workflow/approval-requests/:id/escalate", post(routes::escalate::<R>))
        .route("/workflow/approval-requests/:id/cancel", post(routes::cancel::<R>))
        .route("/workflow/pending", get(routes::pending::<R>))
        .route(
            "/workflow/definitions",
            get(routes::list_definitions::<R>).post(routes::upsert_definition::<R>),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
