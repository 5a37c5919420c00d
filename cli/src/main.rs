use std::{error::Error, fs, net::SocketAddr, path::PathBuf, process::ExitCode, time::Duration};

use clap::{Args, Parser, Subcommand};
use sequin::{
    broker::{
        self,
        endpoint::{BrokerEndpoint, NodeTls, QuicConnector, Trust, DEFAULT_SERVER_NAME},
        memory::MemoryCluster,
        DEFAULT_PORT,
    },
    client::{
        body::SequenceShape,
        consumer::{OutputConsumer, RelayConsumer},
        publisher::Publisher,
        roster::{DnsResolver, NodeRoster, ResolveError, StaticResolver},
        supervisor::ConnectionSupervisor,
    },
    config::{OutputConfig, PublisherConfig, RelayConfig, SupervisorConfig},
    signals,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

type CliResult<T = ()> = Result<T, Box<dyn Error>>;

/// Sequence-numbered delivery through a consistent-hash broker.
#[derive(Parser)]
#[command(name = "sequin", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run broker nodes sharing one in-process cluster.
    Node(NodeArgs),
    /// Publish a sequence and wait for it to be confirmed.
    Publish(PublishArgs),
    /// Relay messages from one queue to another, optionally dropping
    /// duplicates.
    Relay(RelayArgs),
    /// Consume the final queue and validate every key's sequence.
    Output(OutputArgs),
}

#[derive(Args)]
struct NodeArgs {
    /// Address of each node to run. Every address is a separate node.
    #[arg(long, required = true, num_args = 1..)]
    listen: Vec<SocketAddr>,

    /// Declare a consistent-hash exchange with this name.
    #[arg(long, requires = "queues")]
    exchange: Option<String>,

    /// Prefix of the queues bound to the exchange.
    #[arg(long, default_value = "q")]
    queue_prefix: String,

    /// Number of queues bound to the exchange, named <prefix>001 onwards.
    #[arg(long, default_value_t = 0)]
    queues: usize,

    /// Ring weight of every bound queue.
    #[arg(long, default_value_t = 10)]
    weight: u32,

    /// Purge the bound queues after declaring them.
    #[arg(long)]
    purge: bool,

    /// Extra queues reachable through the default exchange.
    #[arg(long = "queue")]
    plain_queues: Vec<String>,

    /// PEM certificate chain. A self-signed certificate is generated when
    /// absent.
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,

    /// PKCS#8 PEM private key.
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,
}

#[derive(Args)]
struct ClusterArgs {
    /// Number of nodes, named node1 to nodeN and resolved through DNS.
    #[arg(long, default_value_t = 1)]
    nodes: usize,

    /// Explicit `name=addr` entries, in roster order. Overrides --nodes.
    #[arg(long = "node-addr", value_parser = parse_node_addr)]
    node_addr: Vec<(String, SocketAddr)>,

    /// PEM root certificates to trust. Node certificates are not verified
    /// when absent.
    #[arg(long)]
    ca: Option<PathBuf>,

    /// Name to expect in node certificates.
    #[arg(long, default_value = DEFAULT_SERVER_NAME)]
    server_name: String,

    /// Seconds to wait after every node failed once.
    #[arg(long, default_value_t = 5)]
    cooldown: u64,
}

#[derive(Args)]
struct PublishArgs {
    #[command(flatten)]
    cluster: ClusterArgs,

    /// Node to connect to first. Defaults to the first node.
    #[arg(long)]
    start_node: Option<String>,

    /// Confirmations to wait for.
    #[arg(long)]
    count: u64,

    /// Publish bare integers to this queue.
    #[arg(long, required_unless_present = "exchange", conflicts_with = "exchange")]
    queue: Option<String>,

    /// Publish `key=value` bodies to this consistent-hash exchange.
    #[arg(long, requires = "keys")]
    exchange: Option<String>,

    /// Number of producer keys, 1 to 10.
    #[arg(long)]
    keys: Option<usize>,
}

#[derive(Args)]
struct RelayArgs {
    #[command(flatten)]
    cluster: ClusterArgs,

    /// Node to connect to first.
    #[arg(long)]
    node: String,

    #[arg(long)]
    in_queue: String,

    #[arg(long)]
    out_queue: String,

    #[arg(long, default_value_t = 1)]
    prefetch: u16,

    /// Lower bound of the artificial processing delay, in milliseconds.
    #[arg(long, default_value_t = 0)]
    min_ms: u64,

    /// Upper bound of the artificial processing delay, in milliseconds.
    #[arg(long, default_value_t = 0)]
    max_ms: u64,

    /// Drop messages whose correlation id was already relayed.
    #[arg(long)]
    dedup: bool,
}

#[derive(Args)]
struct OutputArgs {
    #[command(flatten)]
    cluster: ClusterArgs,

    /// Node to connect to first.
    #[arg(long)]
    node: String,

    #[arg(long)]
    queue: String,

    #[arg(long, default_value_t = 1)]
    prefetch: u16,

    /// Drop messages whose body was already seen.
    #[arg(long)]
    dedup: bool,

    /// First value expected for every key.
    #[arg(long, default_value_t = 1)]
    expected_start: u64,
}

fn parse_node_addr(entry: &str) -> Result<(String, SocketAddr), String> {
    let (name, addr) = entry
        .split_once('=')
        .ok_or_else(|| format!("expected name=addr, got {entry:?}"))?;
    let addr = addr
        .parse()
        .map_err(|e| format!("bad address {addr:?}: {e}"))?;
    Ok((name.to_owned(), addr))
}

impl ClusterArgs {
    async fn roster(&self) -> Result<NodeRoster, ResolveError> {
        if self.node_addr.is_empty() {
            let names = NodeRoster::default_names(self.nodes);
            return NodeRoster::resolve(&DnsResolver::new(DEFAULT_PORT), &names).await;
        }
        let mut resolver = StaticResolver::new();
        let mut names = Vec::with_capacity(self.node_addr.len());
        for (name, addr) in &self.node_addr {
            resolver.insert(name.clone(), *addr);
            names.push(name.clone());
        }
        NodeRoster::resolve(&resolver, &names).await
    }

    fn connector(&self) -> CliResult<QuicConnector> {
        let trust = match &self.ca {
            Some(path) => Trust::from_pem(&fs::read(path)?)?,
            None => Trust::AnyNode,
        };
        Ok(QuicConnector::new(trust, self.server_name.clone())?)
    }

    async fn supervisor(
        &self,
        shutdown: CancellationToken,
    ) -> CliResult<(ConnectionSupervisor<QuicConnector>, NodeRoster)> {
        let roster = self.roster().await?;
        let config = SupervisorConfig::builder()
            .cooldown(Duration::from_secs(self.cooldown))
            .build();
        let supervisor =
            ConnectionSupervisor::new(self.connector()?, roster.clone(), config, shutdown);
        Ok((supervisor, roster))
    }
}

async fn node(args: NodeArgs, shutdown: CancellationToken) -> CliResult {
    let tls = match (&args.cert, &args.key) {
        (Some(cert), Some(key)) => NodeTls::from_pem(&fs::read(cert)?, &fs::read(key)?)?,
        _ => NodeTls::self_signed(vec![DEFAULT_SERVER_NAME.into()])?,
    };

    let cluster = MemoryCluster::new();
    provision(&cluster, &args).await?;

    let mut servers = Vec::with_capacity(args.listen.len());
    for listen in &args.listen {
        let endpoint = BrokerEndpoint::bind(*listen, &tls)?;
        let node = endpoint.local_addr()?;
        cluster.add_node(node).await;
        servers.push(tokio::spawn(endpoint.serve(cluster.clone(), node, shutdown.clone())));
    }
    for server in servers {
        server.await?;
    }
    Ok(())
}

async fn provision(cluster: &MemoryCluster, args: &NodeArgs) -> Result<(), broker::Error> {
    for queue in &args.plain_queues {
        cluster.declare_queue(queue).await;
        info!("declared queue {}", queue);
    }
    let Some(exchange) = &args.exchange else {
        return Ok(());
    };
    cluster.declare_hash_exchange(exchange).await;
    info!("declared exchange {}", exchange);
    for i in 1..=args.queues {
        let queue = format!("{}{:03}", args.queue_prefix, i);
        cluster.declare_queue(&queue).await;
        cluster.bind(&queue, exchange, args.weight).await?;
        if args.purge {
            let purged = cluster.purge(&queue).await?;
            info!("declared, bound and purged queue {} ({} dropped)", queue, purged);
        } else {
            info!("declared and bound queue {}", queue);
        }
    }
    Ok(())
}

async fn publish(args: PublishArgs, shutdown: CancellationToken) -> CliResult {
    let shape = match (&args.queue, &args.exchange, args.keys) {
        (Some(queue), _, _) => SequenceShape::plain(queue.as_str()),
        (None, Some(exchange), Some(keys)) => SequenceShape::keyed(exchange.as_str(), keys)?,
        _ => Err("either --queue or --exchange with --keys is required")?,
    };
    let (supervisor, roster) = args.cluster.supervisor(shutdown).await?;
    let start_node = match &args.start_node {
        Some(name) => roster.index_of(name)?,
        None => 0,
    };
    let config = PublisherConfig::builder()
        .target(args.count)
        .shape(shape)
        .start_node(start_node)
        .build();
    let outcome = Publisher::new(supervisor, config).run().await?;
    if !outcome.completed {
        info!("stopped before the target: {}", outcome.summary);
    }
    Ok(())
}

async fn relay(args: RelayArgs, shutdown: CancellationToken) -> CliResult {
    let (supervisor, roster) = args.cluster.supervisor(shutdown).await?;
    let config = RelayConfig::builder()
        .in_queue(args.in_queue)
        .out_queue(args.out_queue)
        .prefetch(args.prefetch)
        .min_ms(args.min_ms)
        .max_ms(args.max_ms)
        .dedup(args.dedup)
        .start_node(roster.index_of(&args.node)?)
        .build();
    RelayConsumer::new(supervisor, config).run().await?;
    Ok(())
}

async fn output(args: OutputArgs, shutdown: CancellationToken) -> CliResult {
    let (supervisor, roster) = args.cluster.supervisor(shutdown).await?;
    let config = OutputConfig::builder()
        .queue(args.queue)
        .prefetch(args.prefetch)
        .dedup(args.dedup)
        .expected_start(args.expected_start)
        .start_node(roster.index_of(&args.node)?)
        .build();
    OutputConsumer::new(supervisor, config).run().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let shutdown = CancellationToken::new();
    let _signals = signals::cancel_on_signal(shutdown.clone());

    let result = match cli.command {
        Command::Node(args) => node(args, shutdown.clone()).await,
        Command::Publish(args) => publish(args, shutdown.clone()).await,
        Command::Relay(args) => relay(args, shutdown.clone()).await,
        Command::Output(args) => output(args, shutdown.clone()).await,
    };
    shutdown.cancel();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:?}", e);
            ExitCode::FAILURE
        }
    }
}
