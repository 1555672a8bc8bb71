mod admin;
mod middleware;
mod public;

pub use admin::{AdminState, build_admin_router};
pub use middleware::RequestContext;
pub use public::{HEALTH_PATH, build_router, upstream_router};
