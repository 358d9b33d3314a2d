use std::{error::Error, path::PathBuf, sync::Arc};

use clap::Parser;
use lutpir_common::he::FheBfv;
use lutpir_decryptor::{DecServer, KeyContainer};
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "dec_server")]
#[command(about = "LutPIR decryptor")]
struct Args {
    #[arg(long, default_value = "127.0.0.1:9200")]
    bind: String,

    /// Seeds key generation, for reproducible runs only
    #[arg(long)]
    seed: Option<u64>,

    /// Also write every generated key artifact into this directory
    #[arg(long)]
    dump_dir: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    log_level: Level,
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder().with_max_level(args.log_level).with_target(false).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut keys = match args.seed {
        Some(seed) => KeyContainer::<FheBfv>::with_seed(seed),
        None => KeyContainer::<FheBfv>::new(),
    };
    if let Some(dir) = &args.dump_dir {
        keys = keys.with_debug_dump_dir(dir);
    }

    let server = DecServer::bind(&args.bind, Arc::new(keys))?;
    info!("Decryptor listening @ {}", server.local_addr()?);
    let _handle = server.spawn()?;

    loop {
        std::thread::park();
    }
}
