use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use commune_signaler::auth::Authenticator;
use commune_signaler::auth::BasicAuthenticator;
use commune_signaler::auth::DisabledAuthenticator;
use commune_signaler::auth::OidcAuthenticator;
use commune_signaler::brokers::Broker;
use commune_signaler::brokers::ProcessBroker;
use commune_signaler::brokers::RedisBroker;
use commune_signaler::logging::init_logging;
use commune_signaler::logging::LogLevel;
use commune_signaler::persistence::MemoryPersister;
use commune_signaler::persistence::Persister;
use commune_signaler::persistence::SqlitePersister;
use commune_signaler::server::ServerConfig;
use commune_signaler::server::Signaler;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[clap(about = "Signaling server for commune communities", version, author)]
struct Cli {
    #[clap(long, default_value_t = LogLevel::Info, value_enum, env)]
    log_level: LogLevel,

    /// Address to listen on; PORT overrides the port part.
    #[clap(long, default_value = "0.0.0.0:1337")]
    laddr: String,

    #[clap(long, env = "PORT")]
    port: Option<u16>,

    /// SQLite URL, e.g. sqlite://signaler.db?mode=rwc. In-memory persister
    /// when absent.
    #[clap(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Redis URL for clustered fan-out. In-process broker when absent.
    #[clap(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    #[clap(long, env = "API_USERNAME")]
    api_username: Option<String>,

    #[clap(long, env = "API_PASSWORD")]
    api_password: Option<String>,

    #[clap(long, env = "OIDC_ISSUER")]
    oidc_issuer: Option<String>,

    #[clap(long, env = "OIDC_CLIENT_ID")]
    oidc_client_id: Option<String>,

    /// Time a connection may stay silent before it is torn down.
    #[clap(long, default_value = "10", env)]
    heartbeat: u64,

    /// Allow joins to lazily create non-persistent communities.
    #[clap(long, default_value = "true", env)]
    ephemeral_communities: bool,

    /// Drop non-persistent communities and reset counts at startup.
    #[clap(long, env)]
    cleanup: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.log_level.clone());

    let persister: Arc<dyn Persister> = match &cli.database_url {
        Some(url) => Arc::new(SqlitePersister::open(url).await?),
        None => Arc::new(MemoryPersister::new()),
    };
    if cli.cleanup {
        persister.cleanup().await?;
    }

    let broker: Arc<dyn Broker> = match &cli.redis_url {
        Some(url) => Arc::new(RedisBroker::open(url).await?),
        None => Arc::new(ProcessBroker::new()),
    };

    let authenticator: Arc<dyn Authenticator> =
        match (&cli.oidc_issuer, &cli.oidc_client_id, &cli.api_password) {
            (Some(issuer), Some(client_id), _) => {
                Arc::new(OidcAuthenticator::discover(issuer, client_id).await?)
            }
            (_, _, Some(password)) => Arc::new(BasicAuthenticator::new(
                cli.api_username.as_deref().unwrap_or("admin"),
                password,
            )),
            _ => Arc::new(DisabledAuthenticator),
        };

    let mut addr: SocketAddr = cli.laddr.parse()?;
    if let Some(port) = cli.port {
        addr.set_port(port);
    }

    let signaler = Arc::new(Signaler::new(persister, broker, authenticator, ServerConfig {
        heartbeat: Duration::from_secs(cli.heartbeat),
        ephemeral_communities: cli.ephemeral_communities,
    }));

    let shutdown = CancellationToken::new();
    let bound = signaler.bind(addr, shutdown.clone()).await?;

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutting down");
                shutdown.cancel();
            }
        }
    });

    bound.serve().await?;
    Ok(())
}
