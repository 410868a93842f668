use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use wish_core::{Catalog, GameLogic, LoadStatus, ProgressStore};
use wish_server::calls::{load_profiles, VoiceCallClient};
use wish_server::config::Config;
use wish_server::text::ChatCompletionsClient;
use wish_server::{app, AppState, RevealOptions};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wish_server=info,wish_core=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();

    let (catalog, catalog_errors) = Catalog::load(&config.data_dir);
    let store = ProgressStore::new(config.progress_path.clone());
    let logic = match config.seed {
        Some(seed) => GameLogic::with_seed(catalog, store, seed),
        None => GameLogic::new(catalog, store),
    }
    .with_catalog_errors(catalog_errors);

    match logic.load_status() {
        LoadStatus::NoSnapshot => tracing::info!("no saved progress, starting fresh"),
        LoadStatus::Restored { revealed, ignored } => {
            tracing::info!(revealed, ignored, "restored saved progress")
        }
        LoadStatus::Reset(err) => tracing::warn!("saved progress unusable, starting fresh: {err}"),
    }
    let summary = logic.summary();
    tracing::info!(
        total = summary.total,
        revealed = summary.revealed,
        characters = logic.characters().len(),
        "game loaded from {}",
        config.data_dir.display()
    );

    let text = ChatCompletionsClient::new(&config.text_api);
    let calls = VoiceCallClient::new(
        &config.call_api,
        load_profiles(&config.call_api.profiles_path),
    );
    let state = AppState::new(
        Arc::new(logic),
        Arc::new(text),
        Arc::new(calls),
        RevealOptions::from(&config),
    );
    let app = app(state);

    let addr = config.bind_addr();
    tracing::info!("starting server on {addr}");
    axum::serve(
        tokio::net::TcpListener::bind(&addr).await.expect("bind"),
        app,
    )
    .await
    .expect("server error");
}
