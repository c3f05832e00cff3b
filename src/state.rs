use std::sync::Arc;

use crate::config::Config;
use crate::middlewares::auth::SessionVerifier;
use crate::middlewares::rate_limit::{session_rate_limiter, SessionRateLimiter};
use crate::services::mailer::Mailer;
use crate::services::supabase::AuthProvider;
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub auth: Arc<dyn AuthProvider>,
    pub sessions: Arc<SessionVerifier>,
    pub mailer: Option<Arc<dyn Mailer>>,
    pub limiter: Arc<SessionRateLimiter>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        auth: Arc<dyn AuthProvider>,
        mailer: Option<Arc<dyn Mailer>>,
    ) -> Self {
        Self {
            sessions: Arc::new(SessionVerifier::new(&config.supabase.jwt_secret)),
            limiter: Arc::new(session_rate_limiter(config.rate_limit_per_minute)),
            store,
            auth,
            mailer,
            config: Arc::new(config),
        }
    }
}
