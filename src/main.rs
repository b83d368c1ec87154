use std::sync::Arc;
use std::time::Duration;

use pingora::services::{background::background_service, listening::Service};
use pingora_core::server::{configuration::Opt, Server};

use asg_sync::{
    cloud::Provider,
    config::Config,
    gateway::nginx::NginxPlusClient,
    logging::{self, FileLogger},
    service::status::StatusHttpApp,
    sync::{Reconciler, SyncService},
};

const SYNC_SERVICE: &str = "asg sync";

fn main() {
    // Load configuration and command-line arguments
    let cli_options = Opt::parse_args();
    let config = match Config::load_yaml_with_opt_override(&cli_options) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    // Initialize logging
    let logger = if let Some(log_cfg) = &config.log {
        let logger = FileLogger::new(log_cfg.clone());
        logger.init_env_logger();
        Some(logger)
    } else {
        logging::init_stderr_logger();
        None
    };

    // Cloud and load-balancer clients are built once, on a runtime that lives as
    // long as the process so their connection pools stay usable.
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start bootstrap runtime: {e}");
            std::process::exit(1);
        }
    };

    let provider = match runtime.block_on(Provider::from_config(&config)) {
        Ok(provider) => provider,
        Err(e) => {
            eprintln!("Failed to initialize {} provider: {e}", config.cloud_provider);
            std::process::exit(1);
        }
    };

    let gateway = match NginxPlusClient::from_config(&config) {
        Ok(gateway) => gateway,
        Err(e) => {
            eprintln!("Failed to create NGINX Plus client: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = runtime.block_on(gateway.check_api_version()) {
        eprintln!("NGINX Plus API check failed: {e}");
        std::process::exit(1);
    }

    let reconciler = Reconciler::new(Arc::new(provider), Arc::new(gateway));
    let sync_service = SyncService::new(reconciler, Duration::from_secs(config.sync_interval));

    // Create server instance
    let mut server = Server::new_with_opt_and_conf(Some(cli_options), config.pingora);

    if let Some(log_service) = logger {
        log::info!("Adding log sync service...");
        server.add_service(log_service);
    }

    log::info!("Adding upstream sync service...");
    server.add_service(background_service(SYNC_SERVICE, sync_service));

    if let Some(status_cfg) = &config.status {
        log::info!("Adding Status HTTP...");
        server.add_service(StatusHttpApp::status_http_service(status_cfg));
    }

    if let Some(prometheus_cfg) = &config.prometheus {
        log::info!("Adding Prometheus HTTP...");
        let mut prometheus_service_http = Service::prometheus_http_service();
        prometheus_service_http.add_tcp(&prometheus_cfg.address.to_string());
        server.add_service(prometheus_service_http);
    }

    log::info!("Bootstrapping...");
    server.bootstrap();

    log::info!("Starting Server...");
    server.run_forever();
}
