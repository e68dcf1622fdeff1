mod cmd;

use clap::{Parser, Subcommand};
use gemma_bridge::app::OverloadPolicy;
use gemma_bridge::envconfig::EnvConfig;
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "gemma-bridge")]
#[command(version)]
#[command(about = "Run on-device language models behind a host bridge", long_about = None)]
struct Cli {
    /// Directory relative model paths resolve against
    #[arg(long, global = true)]
    models_dir: Option<PathBuf>,

    /// Concurrent generation slots
    #[arg(long, global = true)]
    max_sessions: Option<usize>,

    /// What to do when every slot is taken
    #[arg(long, global = true, value_parser = parse_policy)]
    overload: Option<OverloadPolicy>,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream a completion for one prompt to stdout
    Run {
        model: PathBuf,
        #[arg(trailing_var_arg = true)]
        prompt: Vec<String>,
        #[arg(long, default_value_t = 512)]
        max_tokens: usize,
        #[arg(long, default_value_t = 0.7)]
        temperature: f32,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long = "stop")]
        stop: Vec<String>,
        #[arg(long)]
        context_length: Option<usize>,
    },
    /// Serve bridge operations as newline-delimited JSON on stdin/stdout
    Stdio,
    /// Download a model into the models directory
    Pull {
        url: String,
        #[arg(short, long)]
        output: Option<String>,
        #[arg(long)]
        sha256: Option<String>,
    },
}

fn parse_policy(s: &str) -> Result<OverloadPolicy, String> {
    s.parse()
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut config = EnvConfig::from_env();
    if let Some(dir) = cli.models_dir {
        config.models_dir = dir;
    }
    if let Some(n) = cli.max_sessions {
        config.max_sessions = n.max(1);
    }
    if let Some(policy) = cli.overload {
        config.overload = policy;
    }

    let level = if cli.verbose || config.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .with_target(false)
        .init();

    let result = match cli.command {
        Commands::Run {
            model,
            prompt,
            max_tokens,
            temperature,
            seed,
            stop,
            context_length,
        } => {
            let options = cmd::RunOptions {
                max_tokens,
                temperature,
                seed,
                stop,
                context_length,
            };
            cmd::run(&config, &model, &prompt.join(" "), options).await
        }
        Commands::Stdio => cmd::stdio(&config).await,
        Commands::Pull { url, output, sha256 } => cmd::pull(&config, &url, output.as_deref(), sha256.as_deref()).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}
