mod device;
mod discovery;
mod printers;

use std::sync::Arc;

use axum::Router;

use crate::AppState;

/// Build the API router
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .nest("/printers", printers::router())
        .nest("/device", device::router())
        .nest("/discovery", discovery::router())
}
