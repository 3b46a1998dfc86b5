use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use engine::{Engine, EngineConfig, Event, MetricCatalog, Reactor};
use instrumentation::sim::SimTarget;
use instrumentation::{Focus, ProcessControl, SourceFamily};
use log::{error, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

mod output_writer;
mod task_completion_handler;
mod workload;

use output_writer::{ChannelSink, OutputWriter, OutputWriterTask};
use task_completion_handler::supervise;
use workload::Workload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SamplingMode {
    /// Values live in a shared region the collector reads
    Poll,
    /// Processes report their values over the message channel
    Push,
}

impl From<SamplingMode> for SourceFamily {
    fn from(mode: SamplingMode) -> Self {
        match mode {
            SamplingMode::Poll => SourceFamily::Polled,
            SamplingMode::Push => SourceFamily::Pushed,
        }
    }
}

/// Collects metrics from a set of simulated processes
#[derive(Debug, Parser)]
struct Command {
    /// Verbose debug output
    #[arg(short, long)]
    verbose: bool,

    /// Run duration in seconds (0 = until interrupted)
    #[arg(short, long, default_value = "0")]
    duration: u64,

    /// Number of simulated processes
    #[arg(short, long, default_value = "3")]
    processes: usize,

    /// Metric to collect; may be repeated
    #[arg(short, long = "metric", default_values_t = vec!["cpu_time".to_string()])]
    metrics: Vec<String>,

    /// Resource path the metrics are restricted to
    #[arg(short, long, default_value = "/")]
    focus: String,

    /// How sampled values reach the collector
    #[arg(long, value_enum, default_value = "poll")]
    sampling: SamplingMode,

    /// Decompose sampled values per thread
    #[arg(long)]
    per_thread: bool,

    /// Maximum predicted overhead, as a fraction
    #[arg(long, default_value = "0.2")]
    budget: f64,

    /// Milliseconds between ticks
    #[arg(long, default_value = "10")]
    tick_ms: u64,

    /// Width of aggregation intervals in milliseconds
    #[arg(long, default_value = "10")]
    interval_ms: u64,

    /// Fork the first process after this many ticks
    #[arg(long)]
    fork_after: Option<u64>,

    /// Output file (standard output when absent)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Capacity of the queue between the engine and the output writer
    #[arg(long, default_value = "1024")]
    queue_capacity: usize,
}

impl Command {
    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            sampling: self.sampling.into(),
            per_thread: self.per_thread,
            cost_budget: self.budget,
            aggregation_interval_ns: self.interval_ms.max(1) * 1_000_000,
            ..EngineConfig::default()
        }
    }

    fn open_output(&self) -> Result<Box<dyn Write + Send>> {
        Ok(match &self.output {
            Some(path) => Box::new(BufWriter::new(
                File::create(path).with_context(|| format!("failed to create {}", path.display()))?,
            )),
            None => Box::new(io::stdout()),
        })
    }
}

fn main() -> Result<()> {
    let opts = Command::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if opts.verbose { "debug" } else { "info" }),
    )
    .init();

    // The engine and the simulated targets are single-threaded
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;
    runtime.block_on(run(opts))
}

async fn run(opts: Command) -> Result<()> {
    let focus = Focus::parse(&opts.focus).with_context(|| format!("bad focus {:?}", opts.focus))?;
    let sim = SimTarget::new();
    let mut workload = Workload::spawn(&sim, opts.processes, opts.fork_after);
    info!("started {} simulated processes", workload.pids().len());

    let (sender, receiver) = mpsc::channel(opts.queue_capacity.max(1));
    let engine = Engine::new(
        opts.engine_config(),
        MetricCatalog::builtin(),
        Box::new(sim.clone()),
        Box::new(sim.clone()),
        Box::new(ChannelSink::new(sender)),
    );
    let mut reactor = Reactor::new(engine);

    for name in &opts.metrics {
        match reactor.engine().guess_cost(name, &focus) {
            Ok(cost) => info!("{} over {} is predicted to cost {:.4}", name, focus, cost),
            Err(e) => {
                warn!("skipping {}: {}", name, e);
                continue;
            }
        }
        reactor.push(Event::StartCollecting {
            metric: name.clone(),
            focus: focus.clone(),
        });
    }
    reactor.dispatch_all();

    let mut names = BTreeMap::new();
    for (name, metric) in reactor.take_started() {
        info!("collecting {} as {}", name, metric);
        names.insert(metric, name);
    }
    if names.is_empty() {
        bail!("none of the requested metrics could be collected");
    }
    info!("total predicted cost {:.4}", reactor.engine().predicted_cost());

    let shutdown = CancellationToken::new();
    let writer_task = OutputWriterTask::new(
        OutputWriter::new(opts.open_output()?, names.clone()),
        receiver,
        shutdown.clone(),
    );
    let writer = tokio::spawn(supervise(writer_task.run(), shutdown.clone(), "output writer"));

    let tick_ns = opts.tick_ms.max(1) * 1_000_000;
    let mut interval = tokio::time::interval(Duration::from_millis(opts.tick_ms.max(1)));
    let run_for = match opts.duration {
        0 => Duration::MAX,
        secs => Duration::from_secs(secs),
    };
    let deadline = tokio::time::sleep(run_for);
    tokio::pin!(deadline);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = &mut deadline => {
                info!("duration elapsed");
                break;
            }
            _ = &mut ctrl_c => {
                info!("interrupted");
                break;
            }
            _ = shutdown.cancelled() => {
                error!("output writer stopped early");
                break;
            }
        }

        for event in workload.step(&sim, tick_ns) {
            reactor.push(event);
        }
        if opts.sampling == SamplingMode::Push {
            for &pid in workload.pids() {
                for record in sim.sampling_reports(pid) {
                    reactor.push(Event::Message(record));
                }
            }
        }
        reactor.push(Event::Tick(sim.now()));
        reactor.dispatch_all();
    }

    for &metric in names.keys() {
        reactor.push(Event::Disable(metric));
    }
    reactor.dispatch_all();

    info!("ran {} ticks", workload.steps());
    info!("reactor stats: {:?}", reactor.stats());
    info!("engine stats: {:?}", reactor.engine().stats());

    // Dropping the engine closes the output channel
    drop(reactor);
    let outcome = writer.await.context("output writer task lost")?;
    if !outcome.is_completed() {
        bail!("output writer did not complete: {:?}", outcome);
    }
    Ok(())
}
