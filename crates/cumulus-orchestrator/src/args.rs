use clap::Parser;

#[derive(Debug, Parser)]
pub struct Args {
    /// Seconds between pool garbage-collection sweeps.
    #[arg(long, env = "CUMULUS_GC_INTERVAL_SECS", default_value_t = 3600)]
    pub gc_interval_secs: u64,

    /// Default per-account template quota; unset means unlimited.
    #[arg(long, env = "CUMULUS_TEMPLATE_LIMIT")]
    pub template_limit: Option<u64>,
}
