use std::net::SocketAddr;
use std::sync::Arc;

use nilepay::logging::init_logging;
use nilepay::services::mailer::{HttpMailer, Mailer};
use nilepay::services::supabase::SupabaseAuth;
use nilepay::store::{MemoryStore, PgStore, Store};
use nilepay::{create_router, AppState, Config};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;
    init_logging(&config.log);

    let store: Arc<dyn Store> = match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url).await?;
            store.migrate().await?;
            tracing::info!("database migrations applied");
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using the in-memory store; data is lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    let auth = Arc::new(SupabaseAuth::new(&config.supabase)?);
    let mailer: Option<Arc<dyn Mailer>> = match &config.mail {
        Some(mail) => Some(Arc::new(HttpMailer::new(mail.clone())?)),
        None => {
            tracing::info!("mail not configured, statement emails are disabled");
            None
        }
    };

    let addr = config.bind_addr;
    let state = AppState::new(config, store, auth, mailer);
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Nile Pay API listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
