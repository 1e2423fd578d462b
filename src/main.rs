use anyhow::Result;
use diesel_migrations::{EmbeddedMigrations, embed_migrations};
use medbook_consultationservice::{
    amqp::AmqpRelay,
    app_state::AppState,
    bootstrap::{self, SERVICE_NAME},
    broadcast::Broadcaster,
    config, db,
};

/// Migrations embedded into the binary which helps with streamlining image building process
const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[tokio::main]
async fn main() -> Result<()> {
    bootstrap::init_env();
    bootstrap::init_tracing();

    let config = config::load()?;

    tracing::info!("Running migrations...");
    let migrations_count = db::run_migrations_blocking(MIGRATIONS, &config.database.url).await?;
    tracing::info!("Run {} new migrations successfully", migrations_count);

    let db_pool = db::create_pool(&config.database.url, config.database.max_connections).await?;

    let broadcaster = match &config.amqp {
        Some(amqp) => match AmqpRelay::connect(amqp).await {
            Ok(relay) => {
                tracing::info!("Relaying broadcasts to exchange {}", amqp.exchange);
                Broadcaster::new().with_relay(relay)
            }
            Err(err) => {
                tracing::warn!("AMQP relay unavailable, broadcasting locally only: {:?}", err);
                Broadcaster::new()
            }
        },
        None => Broadcaster::new(),
    };

    tracing::info!("Bootstrapping {}...", SERVICE_NAME);
    let server = config.server.clone();
    let state = AppState::new(db_pool, config, broadcaster);
    bootstrap::serve(&server, bootstrap::build_router(state)).await
}
