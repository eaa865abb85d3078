#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;

use cm_pipeline::{run, PipelineConfig};

fn main() -> ExitCode {
    let config = match parse_args() {
        Ok(Some(config)) => config,
        Ok(None) => return ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("cm-merge: {error}");
            eprintln!("run with --help for usage");
            return ExitCode::from(2);
        }
    };

    match run(&config) {
        Ok(summary) => {
            println!(
                "merged {} rows across {} countries into {}",
                summary.merged_rows,
                summary.countries,
                summary.output_path.display()
            );
            ExitCode::SUCCESS
        }
        Err(error) => {
            eprintln!("cm-merge error: {error}");
            ExitCode::from(1)
        }
    }
}

fn parse_args() -> Result<Option<PipelineConfig>, String> {
    let mut config = PipelineConfig::default_paths();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--data-dir" => {
                let value = next_value(&mut args, "--data-dir")?;
                let out = config.output_path.clone();
                config = PipelineConfig::from_data_dir(&PathBuf::from(value));
                config.output_path = out;
            }
            "--out" => {
                config.output_path = PathBuf::from(next_value(&mut args, "--out")?);
            }
            "--indicators" => {
                config.indicators_path = PathBuf::from(next_value(&mut args, "--indicators")?);
            }
            "--flood" => {
                config.flood_path = PathBuf::from(next_value(&mut args, "--flood")?);
            }
            "--sea-level" => {
                config.sea_level_path = PathBuf::from(next_value(&mut args, "--sea-level")?);
            }
            "--risk" => {
                config.risk_path = PathBuf::from(next_value(&mut args, "--risk")?);
            }
            "--help" | "-h" => {
                print_help();
                return Ok(None);
            }
            other => {
                return Err(format!("unknown argument: {other}"));
            }
        }
    }

    Ok(Some(config))
}

fn next_value(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<String, String> {
    args.next().ok_or_else(|| format!("{flag} requires a value"))
}

fn print_help() {
    println!(
        "cm-merge: merge climate, flood, sea-level and risk tables into nested JSON

USAGE:
    cm-merge [OPTIONS]

OPTIONS:
    --data-dir <dir>     directory holding the four inputs under their default names
    --indicators <path>  climate/socioeconomic indicator table (.json or .csv)
    --flood <path>       long-form flood days table
    --sea-level <path>   sea level table
    --risk <path>        composite risk index table
    --out <path>         output file (default merged_climate_metrics.json)
    -h, --help           print this help"
    );
}
