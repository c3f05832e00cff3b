pub mod config;
pub mod error;
pub mod extract;
pub mod handlers;
pub mod logging;
pub mod middlewares;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
pub mod store;

pub use config::Config;
pub use error::AppError;
pub use routes::create_router;
pub use state::AppState;
