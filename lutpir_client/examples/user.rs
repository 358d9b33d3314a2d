use std::{error::Error, time::Duration};

use clap::Parser;
use lutpir_client::{Client, FuncNo};
use lutpir_common::{
    he::{FheBfv, SchemeParams},
    params::RetryPolicy,
};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "user")]
#[command(about = "Looks values up in a LutPIR computation server's table")]
struct Args {
    #[arg(long, default_value = "127.0.0.1:9200")]
    dec: String,

    #[arg(long, default_value = "127.0.0.1:9100")]
    cs: String,

    /// One value queries the one-input table, two values the two-input table
    #[arg(required = true, num_args = 1..=2, allow_negative_numbers = true)]
    values: Vec<i64>,

    #[arg(long, default_value_t = 4096)]
    poly_modulus_degree: u32,

    #[arg(long, default_value_t = 65537)]
    plain_modulus: u64,

    #[arg(long, default_value_t = 30)]
    timeout_sec: u64,

    #[arg(long, default_value = "warn")]
    log_level: Level,
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder().with_max_level(args.log_level).with_target(false).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let func_no = if args.values.len() == 1 { FuncNo::OneInput } else { FuncNo::TwoInput };
    let params = SchemeParams {
        poly_modulus_degree: args.poly_modulus_degree,
        plain_modulus: args.plain_modulus,
        ..SchemeParams::default()
    };

    let mut rng = ChaCha8Rng::from_os_rng();
    let mut client = Client::<FheBfv>::new(&args.dec, &args.cs, RetryPolicy::default());

    let key_id = client.new_keys(&params)?;
    println!("Obtained key bundle {}", key_id);

    let query_id = client.submit(key_id, func_no, &args.values, &mut rng)?;
    println!("Submitted query {} for {:?}", query_id, args.values);

    match client.wait_result(key_id, query_id, Duration::from_secs(args.timeout_sec)) {
        Ok(value) => println!("f({:?}) = {}", args.values, value),
        Err(e) => println!("Lookup failed: {}", e),
    }

    client.delete_keys(key_id)?;
    Ok(())
}
