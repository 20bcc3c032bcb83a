use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use stackcore::config::Config;
use stackcore::openstack::client::new_request_id;
use stackcore::openstack::{Envelope, ProviderClient, ServiceClient};
use stackcore::pagination::{BodyLink, HeaderLink, MarkerLink, PageLinks};
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use url::Url;

/// Command line client for OpenStack-style APIs
#[derive(Parser, Debug)]
#[command(name = "stackcore", version, about, long_about = None)]
struct Args {
    /// Cloud from clouds.yaml
    #[arg(long, env = "OS_CLOUD", global = true)]
    os_cloud: Option<String>,

    /// Region to resolve endpoints in
    #[arg(long, global = true)]
    region: Option<String>,

    /// Endpoint interface (public, internal, admin)
    #[arg(long, global = true)]
    interface: Option<String>,

    /// Microversion to request from the service
    #[arg(long, global = true)]
    microversion: Option<String>,

    /// Transport timeout in seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Send a global request id with every call
    #[arg(long, global = true)]
    request_id: bool,

    /// Log level for debugging
    #[arg(long, value_enum, default_value = "off", global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Authenticate and print the token
    Token,
    /// Print the service catalog
    Catalog,
    /// GET a path on a service and print the body
    Get {
        service_type: String,
        path: String,
    },
    /// Fetch every page of a collection and print its items
    List {
        service_type: String,
        path: String,
        /// Member holding the items
        #[arg(long)]
        items_key: Option<String>,
        /// Use marker pagination keyed on this item field
        #[arg(long)]
        marker_field: Option<String>,
        /// Page size
        #[arg(long)]
        limit: Option<u32>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Option<Level> {
        match self {
            LogLevel::Off => None,
            LogLevel::Error => Some(Level::ERROR),
            LogLevel::Warn => Some(Level::WARN),
            LogLevel::Info => Some(Level::INFO),
            LogLevel::Debug => Some(Level::DEBUG),
            LogLevel::Trace => Some(Level::TRACE),
        }
    }
}

fn setup_logging(level: LogLevel) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let Some(tracing_level) = level.to_tracing_level() else {
        return Ok(None);
    };

    let log_path = get_log_path();

    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open log file {}", log_path.display()))?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file);

    tracing_subscriber::fmt()
        .with_max_level(tracing_level)
        .with_writer(non_blocking.with_max_level(tracing_level))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!("stackcore started with log level: {:?}", level);
    tracing::info!("Log file: {:?}", log_path);

    Ok(Some(guard))
}

fn get_log_path() -> PathBuf {
    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("stackcore").join("stackcore.log");
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".stackcore").join("stackcore.log");
    }
    PathBuf::from("stackcore.log")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let _log_guard = setup_logging(args.log_level)?;

    let mut config = Config::load(args.os_cloud.as_deref()).context("Failed to load cloud configuration")?;
    if let Some(region) = &args.region {
        config.cloud.region_name = Some(region.clone());
    }
    if let Some(interface) = &args.interface {
        config.cloud.interface = Some(interface.clone());
    }

    let provider = connect(&args, &config).await?;

    let output = match &args.command {
        Command::Token => {
            let state = provider.token().await?;
            json!({
                "token": state.token,
                "expires_at": state.expires_at,
                "user_id": state.user_id,
                "project_id": state.project_id,
            })
        }
        Command::Catalog => {
            let state = provider.token().await?;
            serde_json::to_value(state.catalog.entries()).context("Failed to encode catalog")?
        }
        Command::Get { service_type, path } => {
            let client = service_client(&provider, &config, service_type, &args).await?;
            let page = client.get(client.url(path)?).await?;
            body_to_json(&page)
        }
        Command::List {
            service_type,
            path,
            items_key,
            marker_field,
            limit,
        } => {
            let client = service_client(&provider, &config, service_type, &args).await?;
            let mut url = client.url(path)?;
            if let Some(limit) = limit {
                url.query_pairs_mut().append_pair("limit", &limit.to_string());
            }

            match marker_field {
                Some(field) => {
                    let links = MarkerLink::new(items_key.as_deref()).marker_field(field.clone());
                    list_items(&client, url, links, items_key.as_deref()).await?
                }
                None => list_items(&client, url, any_link(items_key.clone()), items_key.as_deref()).await?,
            }
        }
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&output).context("Failed to encode output")?
    );
    Ok(())
}

async fn list_items<L: PageLinks + 'static>(
    client: &ServiceClient,
    url: Url,
    links: L,
    items_key: Option<&str>,
) -> Result<Value> {
    let mut pager = client.list(url, &(), links).await?;
    if let Some(key) = items_key {
        pager = pager.items_key(key);
    }
    let items = pager.all_items::<Value>().await?;
    tracing::info!("Fetched {} items", items.len());
    Ok(Value::Array(items))
}

/// Whichever of the common link styles the service uses
fn any_link(items_key: Option<String>) -> impl PageLinks {
    let body = BodyLink::new();
    let links_member = items_key.as_deref().map(BodyLink::links_member);
    let header = HeaderLink::new();
    move |page: &Envelope| -> stackcore::Result<Option<Url>> {
        if let Some(next) = body.next_url(page)? {
            return Ok(Some(next));
        }
        if let Some(links) = &links_member {
            if let Some(next) = links.next_url(page)? {
                return Ok(Some(next));
            }
        }
        header.next_url(page)
    }
}

async fn connect(args: &Args, config: &Config) -> Result<ProviderClient> {
    let mut builder = ProviderClient::builder()
        .user_agent_prefix(format!("stackcore-cli/{}", env!("CARGO_PKG_VERSION")))
        .microversions(config.microversions().clone());
    if let Some(secs) = args.timeout {
        builder = builder.timeout(Duration::from_secs(secs));
    }
    if args.request_id {
        builder = builder.global_request_id(new_request_id());
    }

    let options = config.auth_options()?;
    tracing::info!("Authenticating against {}", options.identity_endpoint);
    builder
        .authenticate(options)
        .await
        .context("Failed to authenticate")
}

async fn service_client(
    provider: &ProviderClient,
    config: &Config,
    service_type: &str,
    args: &Args,
) -> Result<ServiceClient> {
    let mut opts = config.endpoint_opts(service_type)?;
    if let Some(version) = &args.microversion {
        opts = opts.microversion(version.clone());
    }
    tracing::info!(
        "Resolving {} endpoint ({}, {})",
        service_type,
        opts.region.as_deref().unwrap_or("any region"),
        opts.interface
    );
    let client = provider
        .service_client(&opts)
        .await
        .with_context(|| format!("No usable endpoint for '{}'", service_type))?;
    Ok(client)
}

fn body_to_json(page: &Envelope) -> Value {
    match page.json() {
        Ok(value) => value.clone(),
        Err(_) => Value::String(page.text().into_owned()),
    }
}

