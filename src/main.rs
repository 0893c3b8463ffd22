use clap::builder::BoolishValueParser;
use clap::{ArgAction, Args, Parser, Subcommand};
use log::debug;
use rust_transformers_gptj::registry::DEFAULT_REVISION;
use rust_transformers_gptj::responder::ResponseOptions;
use rust_transformers_gptj::{load_pipeline, ModelSource, ResponseError, ResponseGenerator, DEFAULT_MODEL_ID};
use std::path::PathBuf;
use std::process::ExitCode;

const DEFAULT_PROMPT: &str = "What is the capital of France?";

#[derive(Parser, Debug)]
#[clap(author, version, about = "Text generation with GPT-J", long_about = None)]
struct Cli {
    /// Hub model id, or a local directory holding config.json, tokenizer.json and safetensors weights
    #[clap(long, global = true, env = "GPTJ_MODEL", default_value = DEFAULT_MODEL_ID)]
    model: String,

    #[clap(long, global = true, default_value = DEFAULT_REVISION)]
    revision: String,

    /// Hub cache directory (defaults to the standard Hugging Face cache)
    #[clap(long, global = true, env = "GPTJ_CACHE_DIR", value_parser)]
    cache_dir: Option<PathBuf>,

    /// Only use files already in the local cache
    #[clap(long, global = true, env = "HF_HUB_OFFLINE", action = ArgAction::SetTrue, value_parser = BoolishValueParser::new())]
    offline: bool,

    #[clap(long, global = true, env = "HF_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate one reply and print it
    Ask(AskArgs),
    /// Run the web chat server
    Serve(ServeArgs),
}

#[derive(Args, Debug)]
struct AskArgs {
    #[clap(default_value = DEFAULT_PROMPT)]
    prompt: String,

    /// Total token limit, prompt included
    #[clap(long, value_parser)]
    max_length: Option<usize>,

    #[clap(long, value_parser)]
    seed: Option<u64>,

    /// Always pick the most likely token
    #[clap(long)]
    greedy: bool,
}

impl Default for AskArgs {
    fn default() -> Self {
        Self {
            prompt: DEFAULT_PROMPT.to_string(),
            max_length: None,
            seed: None,
            greedy: false,
        }
    }
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[clap(long, default_value = "127.0.0.1")]
    host: String,

    #[clap(long, env = "PORT", default_value_t = 5000)]
    port: u16,

    /// Directory served under /static
    #[clap(long, value_parser)]
    static_dir: Option<PathBuf>,

    #[clap(long, default_value_t = 600)]
    cache_ttl_secs: u64,
}

fn log_causes(err: &dyn std::error::Error) {
    let mut current = err.source();
    while let Some(source) = current {
        debug!("Caused by: {}", source);
        current = source.source();
    }
}

fn ask(responder: &ResponseGenerator, args: &AskArgs) -> ExitCode {
    let options = ResponseOptions {
        max_length: args.max_length,
        seed: args.seed,
        greedy: args.greedy,
    };
    match responder.generate_response_with(&args.prompt, &options) {
        Ok(text) => {
            println!("Response: {}", text);
            ExitCode::SUCCESS
        }
        Err(e) => {
            log_causes(&e);
            match e {
                ResponseError::GenerationFailed(_) => println!("Response: {}", e),
                ResponseError::ModelUnavailable { .. } => {
                    println!("Response: AI Error: Failed to generate response using GPT-J. {}", e)
                }
            }
            ExitCode::FAILURE
        }
    }
}

#[cfg(feature = "server")]
fn serve(responder: ResponseGenerator, args: ServeArgs) -> ExitCode {
    use rust_transformers_gptj::ui::{run_server, ServerConfig};
    use std::time::Duration;

    let config = ServerConfig {
        host: args.host,
        port: args.port,
        static_dir: args.static_dir,
        cache_ttl: Duration::from_secs(args.cache_ttl_secs),
    };
    match actix_web::rt::System::new().block_on(run_server(config, responder)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Server error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(not(feature = "server"))]
fn serve(_responder: ResponseGenerator, _args: ServeArgs) -> ExitCode {
    eprintln!("This build does not include the web server; rebuild with --features server");
    ExitCode::FAILURE
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let source = ModelSource::new(cli.model)
        .with_revision(cli.revision)
        .with_cache_dir(cli.cache_dir)
        .with_offline(cli.offline)
        .with_token(cli.token);

    let outcome = load_pipeline(&source);
    if let Err(e) = &outcome {
        println!("Error loading GPT-J model: {}", e);
        log_causes(e);
    }
    let responder = ResponseGenerator::from_load(source.model_id.clone(), outcome);

    match cli.command.unwrap_or_else(|| Command::Ask(AskArgs::default())) {
        Command::Ask(args) => ask(&responder, &args),
        Command::Serve(args) => serve(responder, args),
    }
}
