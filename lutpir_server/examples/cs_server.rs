use std::{error::Error, path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use lutpir_common::{he::FheBfv, params::RetryPolicy};
use lutpir_server::{CalcConfig, CalcManager, CsServer, LookupTable, TableFiles};
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "cs_server")]
#[command(about = "LutPIR computation server")]
struct Args {
    /// Listen address for User queries
    #[arg(long, default_value = "127.0.0.1:9100")]
    bind: String,

    /// Address of the decryptor
    #[arg(long, default_value = "127.0.0.1:9200")]
    dec: String,

    /// One-input table file
    #[arg(long)]
    one_input: Option<PathBuf>,

    /// Two-input table: candidate input file
    #[arg(long, requires = "two_output")]
    two_input: Option<PathBuf>,

    /// Two-input table: output file
    #[arg(long, requires = "two_input")]
    two_output: Option<PathBuf>,

    #[arg(long, default_value_t = 2)]
    threads: usize,

    #[arg(long, default_value_t = 128)]
    max_concurrent_queries: usize,

    #[arg(long, default_value_t = 128)]
    max_results: usize,

    #[arg(long, default_value_t = 3600)]
    result_lifetime_sec: u64,

    /// Worker wake-up and Dec reconnect interval
    #[arg(long, default_value_t = 100)]
    retry_interval_msec: u64,

    #[arg(long, default_value_t = 10)]
    dec_connect_attempts: u32,

    /// Seeds worker randomness, for reproducible runs only
    #[arg(long)]
    seed: Option<u64>,

    #[arg(long, default_value = "info")]
    log_level: Level,
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder().with_max_level(args.log_level).with_target(false).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let files = TableFiles {
        one_input: args.one_input,
        two_input: args.two_input.zip(args.two_output),
    };
    let lut = Arc::new(LookupTable::load(&files)?);

    let retry_interval = Duration::from_millis(args.retry_interval_msec);
    let config = CalcConfig {
        max_concurrent_queries: args.max_concurrent_queries,
        max_results: args.max_results,
        result_lifetime: Duration::from_secs(args.result_lifetime_sec),
        thread_count: args.threads,
        retry_interval,
        dec_retry: RetryPolicy {
            interval: retry_interval,
            max_attempts: args.dec_connect_attempts,
        },
        rng_seed: args.seed,
    };

    let manager = Arc::new(CalcManager::new(lut, config));
    manager.start_threads::<FheBfv>(args.threads, &args.dec)?;

    let server = CsServer::bind(&args.bind, manager.clone())?;
    info!("Computation server listening @ {}, decryptor @ {}", server.local_addr()?, args.dec);
    let _handle = server.spawn()?;

    loop {
        std::thread::park();
    }
}
