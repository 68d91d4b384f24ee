use callbridge::settings::{load_settings, settings_path};

#[tokio::main]
async fn main() {
    // Load .env file if present (for development convenience)
    // Silently ignore if not found - production uses system env vars
    let _ = dotenvy::dotenv();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // More than one rustls provider may be compiled in; pick ring for the wss client
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        log::debug!("rustls crypto provider already installed");
    }

    let mut settings = load_settings(settings_path().as_deref());
    settings.apply_env();

    if let Err(e) = callbridge::run(settings).await {
        log::error!("{}", e);
        std::process::exit(1);
    }
}
