// ============================================================================
// CARDVAULT SERVER - Axum + ReDB
// ============================================================================
//
// Wallet-authenticated card/rewards ledger service.
//
// Run: cargo run
// Test: curl http://localhost:8080/health

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cardvault::routes::{router, AppState};
use cardvault::{CardProvider, KeyedLocks, LedgerStore, TtlStore};

const DEFAULT_DATA_PATH: &str = "./cardvault_data";

#[tokio::main]
async fn main() {
    // ========================================================================
    // 1. STRUCTURED LOGGING
    // ========================================================================
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,cardvault=debug")),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true))
        .init();

    let _ = dotenv::dotenv();

    // ========================================================================
    // 2. LEDGER STORE
    // ========================================================================
    let data_path =
        std::env::var("CARDVAULT_DATA").unwrap_or_else(|_| DEFAULT_DATA_PATH.to_string());
    let store = match LedgerStore::open(&data_path) {
        Ok(store) => store,
        Err(e) => {
            panic!("storage initialization failed: {:?}", e);
        }
    };

    // ========================================================================
    // 3. SUPPORTING STATE
    // ========================================================================
    let nonces = TtlStore::new();
    let locks = KeyedLocks::new();
    let provider = CardProvider::from_env();

    let jwt_secret = std::env::var("JWT_SECRET").unwrap_or_else(|_| {
        warn!("JWT_SECRET not set, using a development default");
        "cardvault-dev-secret".to_string()
    });

    let state = AppState {
        store,
        nonces,
        locks,
        provider,
        jwt_secret: Arc::new(jwt_secret.into_bytes()),
    };

    // ========================================================================
    // 4. ROUTER
    // ========================================================================
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
    let app = router(state).layer(cors).layer(TraceLayer::new_for_http());

    // ========================================================================
    // 5. SERVE
    // ========================================================================
    let addr: SocketAddr = std::env::var("CARDVAULT_LISTEN")
        .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        .parse()
        .expect("invalid listen address");

    info!("server listening on http://{}", addr);
    info!("endpoints:");
    info!("   GET  /health               - health check");
    info!("   POST /auth/nonce           - issue login challenge");
    info!("   POST /auth/authorize       - signature login");
    info!("   POST /user/profile         - profile + balances");
    info!("   POST /user/referrals       - direct downline");
    info!("   POST /user/rewards         - audit ledger");
    info!("   POST /user/records         - operator remarks");
    info!("   POST /user/vip             - tier change");
    info!("   POST /transfer             - peer transfer");
    info!("   POST /withdraw             - withdraw");
    info!("   POST /card/open[...]       - card applications");
    info!("   POST /card/fund            - fund card");
    info!("   POST /card/pin|freeze|token|codes|orders[...]");

    let listener = tokio::net::TcpListener::bind(addr).await.expect("bind listener");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    info!("bye");
}

// ============================================================================
// GRACEFUL SHUTDOWN
// ============================================================================

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    warn!("shutdown signal received");
}
