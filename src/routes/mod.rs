use std::sync::Arc;

use axum::Router;

use crate::consumer::ConsumerStatus;

mod health;

// ---

pub fn router(consumers: Vec<Arc<ConsumerStatus>>) -> Router {
    // ---
    Router::new()
        .merge(health::router())
        .with_state(Arc::new(consumers))
}
