pub mod actions;
pub mod health;
pub mod stream;

use actix_web::web;

/// Mount every route.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.configure(health::configure)
        .configure(actions::configure)
        .configure(stream::configure);
}
