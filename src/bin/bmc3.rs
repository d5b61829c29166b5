use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use std::path::PathBuf;

use bmc3_rs::builder::{build_graph, default_schedule};
use bmc3_rs::coupler::ChainCoupler;
use bmc3_rs::io::config::{RunConfig, load_config, save_config};
use bmc3_rs::io::fasta::{SitePatterns, read_fasta};
use bmc3_rs::progress;
use bmc3_rs::report::{
    OperatorRate, RunSummary, SwapRateEntry, TraceWriter, default_config_path, default_summary_path,
    default_trace_path, write_summary_json,
};
use bmc3_rs::{MarkovChain, ModelGraph};

#[derive(Parser, Debug)]
#[command(name = "bmc3")]
#[command(about = "Bayesian phylogenetic inference by Metropolis-coupled MCMC", long_about = None)]
struct Cli {
    /// Input alignment (FASTA, optionally gzipped)
    input_file: PathBuf,
    /// Output prefix; writes <prefix>.trace.tsv, <prefix>.summary.json,
    /// <prefix>.config.json
    output_prefix: PathBuf,
    /// Chain length in steps
    n_steps: u64,
    #[arg(long, help = "Load the full run configuration from a JSON file")]
    config: Option<PathBuf>,
    #[arg(long)]
    threads: Option<usize>,
    #[arg(long, default_value_t = 4)]
    chains: usize,
    #[arg(
        long,
        default_value_t = 0.5,
        help = "Temperature increment of the default ladder t_i = 1 + i*delta"
    )]
    hot_delta: f64,
    #[arg(long, value_delimiter = ',', help = "Explicit temperature ladder, overrides --hot-delta")]
    temperatures: Option<Vec<f64>>,
    #[arg(long, default_value_t = 100)]
    swap_interval: u64,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    #[arg(long, default_value_t = 100)]
    sample_every: u64,
    #[arg(long, default_value = "hky85", help = "Substitution model: jc69 or hky85")]
    model: String,
    #[arg(long, default_value_t = 4, help = "Discrete-gamma rate categories; 0 or 1 disables")]
    gamma_categories: usize,
    #[arg(long, default_value_t = 2.0)]
    kappa0: f64,
    #[arg(long, default_value_t = 0.5)]
    shape0: f64,
    #[arg(long, default_value_t = 1.0)]
    pop_size0: f64,
    #[arg(long, default_value_t = 0.25, help = "Window width of the node-height slide move")]
    slide_window: f64,
    #[arg(long)]
    no_progress: bool,
}

fn effective_config(cli: &Cli) -> Result<RunConfig> {
    if let Some(path) = &cli.config {
        let mut config = load_config(path)?;
        // The chain length on the command line always wins.
        config.n_steps = cli.n_steps;
        return Ok(config);
    }
    Ok(RunConfig {
        seed: cli.seed,
        n_steps: cli.n_steps,
        n_chains: cli.chains,
        hot_delta: cli.hot_delta,
        temperatures: cli.temperatures.clone(),
        swap_interval: cli.swap_interval,
        sample_every: cli.sample_every,
        model: cli.model.clone(),
        gamma_categories: cli.gamma_categories,
        kappa0: cli.kappa0,
        shape0: cli.shape0,
        pop_size0: cli.pop_size0,
        slide_window: cli.slide_window,
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Some(n_threads) = cli.threads {
        if n_threads == 0 {
            bail!("--threads must be >= 1");
        }
        rayon::ThreadPoolBuilder::new()
            .num_threads(n_threads)
            .build_global()
            .map_err(|e| anyhow!("failed to configure Rayon global thread pool: {e}"))?;
    }
    let config = effective_config(&cli)?;

    let patterns = if cli.no_progress {
        read_patterns(&cli)?
    } else {
        let pb = progress::spinner("IO", "Reading alignment");
        let patterns = read_patterns(&cli)?;
        pb.finish_with_message(format!(
            "Alignment: {} taxa, {} patterns ({} sites)",
            patterns.n_taxa(),
            patterns.n_patterns(),
            patterns.total_sites()
        ));
        patterns
    };

    let settings = config.settings()?;
    let temperatures = config.ladder()?;
    let mut build_rng = SmallRng::seed_from_u64(config.seed);
    let built = build_graph(&patterns, &settings, &mut build_rng)?;
    let schedule = default_schedule(&built)?;

    let mut chains = Vec::with_capacity(temperatures.len());
    for (i, &t) in temperatures.iter().enumerate() {
        let graph: ModelGraph = built.graph.clone();
        let chain = MarkovChain::new(graph, t, schedule.clone(), config.seed + 1 + i as u64)
            .with_context(|| format!("failed to start chain {i} at temperature {t}"))?;
        chains.push(chain);
    }
    chains[0].set_sample_every(config.sample_every);
    println!(
        "Initial log posterior: {:.4}",
        chains[0].current_score()
    );

    let mut coupler = ChainCoupler::new(chains, config.swap_interval, config.seed)?;

    let trace_path = default_trace_path(&cli.output_prefix);
    let mut trace = TraceWriter::create(&trace_path)?;

    let pb = if cli.no_progress {
        None
    } else {
        Some(progress::bar(config.n_steps, "MC3", "sampling"))
    };
    let steps_done = coupler.run(config.n_steps, |done, samples| {
        for sample in &samples {
            trace.write_sample(sample)?;
        }
        if let Some(pb) = &pb {
            pb.set_position(done);
        }
        Ok(())
    })?;
    if let Some(pb) = pb {
        pb.finish_with_message("sampling done");
    }
    trace.finish()?;

    let cold = coupler.cold_chain();
    let summary = RunSummary {
        steps: steps_done,
        n_chains: coupler.n_chains(),
        temperatures: coupler.temperatures(),
        swap_interval: config.swap_interval,
        seed: config.seed,
        final_posterior: cold.current_score(),
        operators: cold
            .acceptance_rates()
            .into_iter()
            .map(|(name, acceptance, tried)| OperatorRate {
                name,
                acceptance,
                tried,
            })
            .collect(),
        swaps: coupler
            .swap_rates()
            .into_iter()
            .map(|r| SwapRateEntry {
                pair: format!("{}<->{}", r.cold_index, r.hot_index),
                attempts: r.attempts,
                accepts: r.accepts,
            })
            .collect(),
        final_tree: cold.graph.tree(0).newick(),
        final_columns: cold.log_columns(),
    };
    let summary_path = default_summary_path(&cli.output_prefix);
    write_summary_json(&summary_path, &summary)?;
    save_config(&default_config_path(&cli.output_prefix), &config)?;

    println!("Final log posterior: {:.4}", summary.final_posterior);
    println!("Trace: {}", trace_path.display());
    println!("Summary: {}", summary_path.display());
    Ok(())
}

fn read_patterns(cli: &Cli) -> Result<SitePatterns> {
    let alignment = read_fasta(&cli.input_file)
        .with_context(|| format!("failed to read alignment {:?}", cli.input_file))?;
    SitePatterns::from_alignment(&alignment)
}
