use std::env;
use std::process;

use tracing_subscriber::EnvFilter;

use netfx::data::load_households;
use netfx::{run_analysis, AnalysisConfig, Result};

const USAGE: &str = "usage: netfx <households.csv> [config.toml] [--json]";

// Command line arguments: the data path, an optional config file and an
// optional `--json` switch, in any order after the data path.
struct Args {
    data: String,
    config: Option<String>,
    json: bool,
}

fn parse_args(args: &[String]) -> std::result::Result<Args, String> {
    let mut json = false;
    let mut positional = Vec::new();
    for arg in args {
        match arg.as_str() {
            "--json" => json = true,
            "-h" | "--help" => return Err(USAGE.to_string()),
            flag if flag.starts_with("--") => return Err(format!("unknown flag {flag}\n{USAGE}")),
            path => positional.push(path.to_string()),
        }
    }
    let mut positional = positional.into_iter();
    let data = positional.next().ok_or_else(|| USAGE.to_string())?;
    let config = positional.next();
    if let Some(extra) = positional.next() {
        return Err(format!("unexpected argument {extra}\n{USAGE}"));
    }
    Ok(Args { data, config, json })
}

fn run(args: &Args) -> Result<String> {
    let config = match &args.config {
        Some(path) => AnalysisConfig::from_path(path)?,
        None => AnalysisConfig::default(),
    };
    let data = load_households(&args.data)?;
    let analysis = run_analysis(&data, &config)?;
    if args.json {
        analysis.comparison.to_json()
    } else {
        Ok(analysis.comparison.to_string())
    }
}

fn main() {
    let filter = EnvFilter::try_from_env("NETFX_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let argv: Vec<String> = env::args().skip(1).collect();
    let args = match parse_args(&argv) {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{msg}");
            process::exit(1);
        }
    };

    match run(&args) {
        Ok(table) => println!("{table}"),
        Err(e) => {
            eprintln!("netfx: {e}");
            process::exit(1);
        }
    }
}
