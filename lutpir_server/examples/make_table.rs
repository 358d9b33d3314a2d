use std::{error::Error, fs, path::PathBuf};

use clap::Parser;
use lutpir_server::{OneInputTable, TwoInputTable};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

/// Writes sample table files for `cs_server`: a one-input table of `3x + 1` over distinct random inputs, and a
/// two-input table of `2a + b`.
#[derive(Parser)]
#[command(name = "make_table")]
struct Args {
    #[arg(long, default_value = "lut_one.txt")]
    one_input: PathBuf,

    #[arg(long, default_value = "lut_two_in.txt")]
    two_input: PathBuf,

    #[arg(long, default_value = "lut_two_out.txt")]
    two_output: PathBuf,

    /// Entries of the one-input table
    #[arg(long, default_value_t = 64)]
    entries: usize,

    /// Candidates per input of the two-input table
    #[arg(long, default_value_t = 8)]
    candidates: usize,
}

fn distinct_values(rng: &mut ChaCha8Rng, count: usize) -> Vec<i64> {
    let mut values = (-1000i64..1000).collect::<Vec<_>>();
    values.shuffle(rng);
    values.truncate(count);
    values
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let mut rng = ChaCha8Rng::from_os_rng();

    let one = OneInputTable::from_fn(distinct_values(&mut rng, args.entries), |x| 3 * x + 1);
    fs::write(&args.one_input, one.to_text())?;
    println!("Wrote one-input table of {} entries to {}", args.entries, args.one_input.display());

    let two = TwoInputTable::from_fn(distinct_values(&mut rng, args.candidates), distinct_values(&mut rng, args.candidates), |a, b| 2 * a + b);
    let (input_text, output_text) = two.to_text();
    fs::write(&args.two_input, input_text)?;
    fs::write(&args.two_output, output_text)?;
    println!("Wrote two-input table of {}x{} entries", args.candidates, args.candidates);

    Ok(())
}
