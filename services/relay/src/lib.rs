pub mod auth;
pub mod config;
pub mod correlator;
pub mod directory;
pub mod http;
pub mod liveness;
pub mod registry;
pub mod router;
pub mod state;
pub mod ws_relay;

pub use state::AppState;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub fn build_router(state: AppState) -> Router {
    let api = api_routes(state.clone());

    Router::new()
        .route("/relay", get(ws_relay::ws_relay_handler))
        .route("/health", get(http::meta::health))
        .route("/api", get(http::meta::api_index))
        // Internal-network surface, addressed replica-to-replica only.
        .route("/internal/preempt", post(router::preempt_handler))
        // Forwarded requests land under /proxy/:replica_id with the
        // original path and query intact; the forwarding header stops a
        // second hop.
        .nest("/proxy/:replica_id", api.clone())
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn api_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/search", get(http::api::search))
        .route(
            "/entity",
            get(http::api::get_entity)
                .post(http::api::create_entity)
                .put(http::api::update_entity)
                .delete(http::api::delete_entity),
        )
        .route("/structure", get(http::api::get_structure))
        .route("/contents", get(http::api::get_contents))
        .route("/roll", post(http::api::roll))
        .route("/rolls", get(http::api::roll_history))
        .route("/sheet", get(http::api::get_sheet))
        .route("/files", get(http::files::list_files))
        .route("/files/download", get(http::files::download_file))
        .route("/files/upload", post(http::files::upload_file))
        .route("/macros", get(http::api::list_macros))
        .route("/macros/execute", post(http::api::execute_macro))
        .route("/encounter/:action", post(http::api::encounter_control))
        .route("/select", post(http::api::select_entities))
        .route("/selected", get(http::api::get_selected))
        .route("/execute-script", post(http::api::execute_script))
        .route("/dnd5e/use-item", post(http::api::dnd5e_use_item))
        .route("/dnd5e/apply-damage", post(http::api::dnd5e_apply_damage))
        .route("/dnd5e/rest", post(http::api::dnd5e_rest))
        .route("/clients", get(http::meta::list_clients))
        // Outermost first: body limit, then the auth hook, then routing.
        .layer(middleware::from_fn_with_state(
            state.clone(),
            router::route_or_forward,
        ))
        .layer(middleware::from_fn_with_state(state, auth::require_api_key))
        .layer(DefaultBodyLimit::max(router::MAX_BODY_BYTES + 64 * 1024))
}
