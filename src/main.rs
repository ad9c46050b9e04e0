use std::{future::IntoFuture, process, sync::Arc, time::Duration};

use hubcache::{
    application::error::AppError,
    cache::{CacheConfig, ResponseSynthesizer, StrategyRegistry, UnifiedCache},
    config::{self, Command, DecryptArgs, EncryptArgs, Settings},
    crypto::{self, MessageCipher},
    infra::{
        error::InfraError,
        http::{self, AdminState, GatewayState, MessageState, RouteTable, RouterState},
        telemetry,
        upstream::UpstreamClient,
    },
};
use tokio::{sync::watch, try_join};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt()
        .with_max_level(Level::ERROR)
        .with_writer(std::io::stderr)
        .finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    match cli_args.command {
        None | Some(Command::Serve(_)) => run_serve(settings).await,
        Some(Command::Encrypt(args)) => run_encrypt(&settings, &args),
        Some(Command::Decrypt(args)) => run_decrypt(&settings, &args),
        Some(Command::GenKey) => {
            println!("{}", crypto::generate_key_hex());
            Ok(())
        }
    }
}

fn run_encrypt(settings: &Settings, args: &EncryptArgs) -> Result<(), AppError> {
    let cipher = settings.crypto.cipher()?;
    println!("{}", cipher.encrypt(&args.text)?);
    Ok(())
}

fn run_decrypt(settings: &Settings, args: &DecryptArgs) -> Result<(), AppError> {
    let cipher = settings.crypto.cipher()?;
    println!("{}", cipher.decrypt(args.encoded.trim())?);
    Ok(())
}

async fn run_serve(settings: Settings) -> Result<(), AppError> {
    telemetry::init(&settings.logging)?;

    let cache_config = CacheConfig::from(&settings.cache);
    let registry = Arc::new(
        StrategyRegistry::with_overrides(&cache_config.strategy_overrides)
            .map_err(|err| InfraError::configuration(err.to_string()))?,
    );
    let cache = UnifiedCache::connect(&cache_config, Arc::clone(&registry))
        .await
        .map_err(InfraError::from)?;
    let synthesizer =
        ResponseSynthesizer::new(Arc::clone(&registry), &cache_config).map_err(InfraError::from)?;

    let upstream = settings
        .upstream
        .base_url
        .as_deref()
        .map(|url| UpstreamClient::new(url, settings.upstream.timeout))
        .transpose()?;
    if upstream.is_none() {
        warn!("No upstream configured; /api routes will answer 503");
    }

    let cipher: Option<MessageCipher> = match settings.crypto.message_key.as_deref() {
        Some(key) => Some(MessageCipher::from_hex(key)?),
        None => {
            warn!("No message key configured; /messages routes will answer 503");
            None
        }
    };

    let router_state = RouterState {
        gateway: GatewayState {
            cache: cache.clone(),
            synthesizer: synthesizer.clone(),
            upstream,
            routes: Arc::new(RouteTable::new(settings.upstream.routes.clone())),
        },
        messages: MessageState {
            cipher,
            synthesizer,
        },
    };

    serve_http(&settings, router_state, AdminState { cache }).await
}

async fn serve_http(
    settings: &Settings,
    router_state: RouterState,
    admin_state: AdminState,
) -> Result<(), AppError> {
    let public_router = http::build_router(router_state);
    let admin_router = http::build_admin_router(admin_state);

    let public_listener = tokio::net::TcpListener::bind(settings.server.public_addr)
        .await
        .map_err(InfraError::from)?;
    let admin_listener = tokio::net::TcpListener::bind(settings.server.admin_addr)
        .await
        .map_err(InfraError::from)?;

    info!(
        public = %settings.server.public_addr,
        admin = %settings.server.admin_addr,
        "hubcache listening"
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                let _ = stop_tx.send(true);
            }
            Err(err) => {
                error!(error = %err, "Unable to listen for the shutdown signal");
                std::future::pending::<()>().await;
            }
        }
    });

    let public_server = axum::serve(public_listener, public_router.into_make_service())
        .with_graceful_shutdown(stopped(stop_rx.clone()))
        .into_future();
    let admin_server = axum::serve(admin_listener, admin_router.into_make_service())
        .with_graceful_shutdown(stopped(stop_rx.clone()))
        .into_future();

    let grace = settings.server.graceful_shutdown;
    tokio::select! {
        result = async { try_join!(public_server, admin_server) } => {
            result.map_err(InfraError::from)?;
        }
        () = drain_deadline(stop_rx, grace) => {
            warn!(grace_secs = grace.as_secs(), "Graceful shutdown timed out; dropping open connections");
        }
    }

    Ok(())
}

async fn stopped(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn drain_deadline(rx: watch::Receiver<bool>, grace: Duration) {
    stopped(rx).await;
    tokio::time::sleep(grace).await;
}
