use clap::{Arg, ArgMatches, Command};
use cluster_txn::config::TxnConfig;
use cluster_txn::logging::init_logging;
use cluster_txn::store::{MemoryStore, Store};
use cluster_txn::transaction::{CleanupHandler, Engine, Step, StepRegistry, Txn, TxnCtx};
use cluster_txn::types::NodeId;
use cluster_txn::{metrics, Error, TxnRuntime};
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Level;

/// Transaction engine simulator
///
/// Runs several in-process nodes on one shared in-memory store and drives a
/// generated transaction through them:
/// - optional sync barriers between steps
/// - failure injection on a chosen node and step
/// - per-node results and metrics at the end

fn main() {
    let matches = create_cli().get_matches();

    if let Err(e) = run_command(matches) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn create_cli() -> Command {
    Command::new("txn-sim")
        .about("Cluster transaction engine simulator")
        .version(env!("CARGO_PKG_VERSION"))
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(Arg::new("log-level")
            .help("Log level")
            .long("log-level")
            .global(true)
            .value_parser(["error", "warn", "info", "debug", "trace"])
            .default_value("warn"))
        .arg(Arg::new("json")
            .help("Emit logs as JSON")
            .long("json")
            .global(true)
            .action(clap::ArgAction::SetTrue))
        .subcommand(
            Command::new("run")
                .about("Run one transaction across simulated nodes")
                .arg(Arg::new("nodes")
                    .help("Number of nodes")
                    .long("nodes")
                    .default_value("3"))
                .arg(Arg::new("steps")
                    .help("Number of steps")
                    .long("steps")
                    .default_value("3"))
                .arg(Arg::new("sync")
                    .help("Put a sync barrier before every step after the first")
                    .long("sync")
                    .action(clap::ArgAction::SetTrue))
                .arg(Arg::new("max-delay-ms")
                    .help("Upper bound of the random per-step delay")
                    .long("max-delay-ms")
                    .default_value("50"))
                .arg(Arg::new("fail-node")
                    .help("Index of the node whose step fails")
                    .long("fail-node"))
                .arg(Arg::new("fail-step")
                    .help("Index of the step that fails on --fail-node")
                    .long("fail-step")
                    .default_value("0"))
                .arg(Arg::new("config")
                    .help("JSON configuration file")
                    .long("config"))
                .arg(Arg::new("metrics")
                    .help("Print Prometheus metrics after the run")
                    .long("metrics")
                    .action(clap::ArgAction::SetTrue))
        )
        .subcommand(
            Command::new("config")
                .about("Print the default configuration as JSON")
        )
}

fn run_command(matches: ArgMatches) -> Result<(), Box<dyn std::error::Error>> {
    let level: Level = matches.get_one::<String>("log-level").unwrap().parse()?;
    init_logging(level, matches.get_flag("json"));

    match matches.subcommand() {
        Some(("run", sub_matches)) => cmd_run(sub_matches),
        Some(("config", _)) => cmd_config(),
        _ => unreachable!(),
    }
}

fn cmd_config() -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(&TxnConfig::default())?);
    Ok(())
}

struct SimOptions {
    nodes: usize,
    steps: usize,
    sync: bool,
    max_delay: Duration,
    failure: Option<(usize, usize)>,
    config: TxnConfig,
}

fn cmd_run(matches: &ArgMatches) -> Result<(), Box<dyn std::error::Error>> {
    let nodes: usize = matches.get_one::<String>("nodes").unwrap().parse()?;
    let steps: usize = matches.get_one::<String>("steps").unwrap().parse()?;
    let max_delay_ms: u64 = matches.get_one::<String>("max-delay-ms").unwrap().parse()?;
    let fail_step: usize = matches.get_one::<String>("fail-step").unwrap().parse()?;
    let failure = match matches.get_one::<String>("fail-node") {
        Some(node) => Some((node.parse::<usize>()?, fail_step)),
        None => None,
    };

    if nodes == 0 || steps == 0 {
        return Err("--nodes and --steps must be at least 1".into());
    }
    if let Some((node, step)) = failure {
        if node >= nodes || step >= steps {
            return Err("--fail-node/--fail-step out of range".into());
        }
    }

    let mut config = match matches.get_one::<String>("config") {
        Some(path) => TxnConfig::from_file(path)?,
        None => TxnConfig::default(),
    };
    config.election_retry_interval = config.election_retry_interval.min(Duration::from_millis(200));

    let options = SimOptions {
        nodes,
        steps,
        sync: matches.get_flag("sync"),
        max_delay: Duration::from_millis(max_delay_ms),
        failure,
        config,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(simulate(options))?;

    if matches.get_flag("metrics") {
        println!();
        print!("{}", metrics::export()?);
    }
    Ok(())
}

fn register_steps(registry: &StepRegistry, options: &SimOptions, failing: Option<(NodeId, usize)>) -> cluster_txn::Result<()> {
    for index in 0..options.steps {
        let max_delay = options.max_delay;
        registry.register(&format!("sim.do.{}", index), move |ctx: TxnCtx| async move {
            let delay = rand::rng().random_range(0..=max_delay.as_millis() as u64);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if failing == Some((ctx.local_node(), index)) {
                return Err(Error::Generic(format!("injected failure at step {}", index)));
            }
            ctx.set_node_result(ctx.local_node(), "last-step", &index)
        })?;
        registry.register(&format!("sim.undo.{}", index), move |ctx: TxnCtx| async move {
            println!("  node {} undid step {}", ctx.local_node(), index);
            Ok(())
        })?;
    }
    Ok(())
}

async fn simulate(options: SimOptions) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(MemoryStore::new());
    let reaper = store.spawn_reaper(Duration::from_millis(250));
    let shared: Arc<dyn Store> = store.clone();

    let node_ids: Vec<NodeId> = (0..options.nodes).map(|_| NodeId::new()).collect();
    let failing = options.failure.map(|(node, step)| (node_ids[node], step));

    let registry = StepRegistry::new();
    register_steps(&registry, &options, failing)?;

    let mut runtimes = Vec::with_capacity(options.nodes);
    let mut engines = Vec::with_capacity(options.nodes);
    let mut janitors = Vec::with_capacity(options.nodes);
    for node in &node_ids {
        let runtime = TxnRuntime::new(*node, shared.clone(), registry.clone(), options.config.clone()).await?;
        runtime.start().await?;

        let engine = Engine::new(runtime.clone());
        engine.start().await?;
        let janitor = CleanupHandler::new(runtime.clone());
        janitor.start_electing();

        runtimes.push(runtime);
        engines.push(engine);
        janitors.push(janitor);
    }

    let steps: Vec<Step> = (0..options.steps)
        .map(|index| {
            let step = Step::new(format!("sim.do.{}", index), node_ids.clone())
                .with_undo(format!("sim.undo.{}", index));
            if options.sync && index > 0 {
                step.synchronized()
            } else {
                step
            }
        })
        .collect();

    println!(
        "running txn: {} nodes, {} steps{}",
        options.nodes,
        options.steps,
        if options.sync { ", synchronized" } else { "" }
    );

    let mut txn = Txn::new(runtimes[0].clone(), "txn-sim").with_steps(steps);
    let started = Instant::now();
    let result = txn.run().await;
    let elapsed = started.elapsed();

    match &result {
        Ok(()) => {
            println!("txn {} succeeded in {:?}", txn.id(), elapsed);
            let results: BTreeMap<String, usize> = txn
                .node_results::<usize>("last-step")
                .await?
                .into_iter()
                .map(|(node, step)| (node.to_string(), step))
                .collect();
            for (node, step) in results {
                println!("  node {} completed through step {}", node, step);
            }
        }
        Err(e) => println!("txn {} failed in {:?}: {} (http {})", txn.id(), elapsed, e, e.status_code()),
    }
    txn.done().await?;

    // give participants a moment to finish rolling back
    if result.is_err() {
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    for janitor in &janitors {
        janitor.stop().await;
    }
    for engine in &engines {
        engine.shutdown().await;
    }
    for runtime in &runtimes {
        runtime.shutdown().await?;
    }
    reaper.abort();
    Ok(())
}
