//! CLI for StableGen - Stable Diffusion image generation.

use clap::{Args, Parser, Subcommand};
use stablegen::{
    CredentialGate, GeneratedImage, GenerationOutcome, Session, StabilityBuilder,
    ValidationOutcome,
};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const API_KEY_ENV: &str = "STABILITY_API_KEY";

#[derive(Parser)]
#[command(name = "stablegen")]
#[command(about = "Generate images with Stable Diffusion via the Stability AI API")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    connection: ConnectionArgs,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Args)]
struct ConnectionArgs {
    /// Stability AI API key (falls back to STABILITY_API_KEY, then a prompt)
    #[arg(long, global = true)]
    api_key: Option<String>,

    /// API host (falls back to STABILITY_HOST)
    #[arg(long, global = true)]
    host: Option<String>,

    /// Retry key validation this many times on network errors
    #[arg(long, global = true, default_value_t = 0)]
    retries: u32,

    /// Client-side request timeout in seconds
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that an API key is accepted
    Validate,

    /// Generate one image from a text prompt
    Generate(GenerateArgs),

    /// Enter an API key once, then generate from prompts read line by line
    Interactive(InteractiveArgs),
}

#[derive(Args)]
struct GenerateArgs {
    /// The text prompt describing the image
    prompt: String,

    /// Output file path
    #[arg(short, long)]
    output: PathBuf,
}

#[derive(Args)]
struct InteractiveArgs {
    /// Directory generated images are written to
    #[arg(short, long, default_value = ".")]
    out_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let gate = build_gate(&cli.connection);

    match cli.command {
        Commands::Validate => validate(&gate, &cli.connection, cli.json).await,
        Commands::Generate(args) => generate(gate, &cli.connection, args, cli.json).await,
        Commands::Interactive(args) => interactive(gate, &cli.connection, args).await,
    }
}

fn build_gate(args: &ConnectionArgs) -> CredentialGate {
    let mut builder = StabilityBuilder::new();
    if let Some(host) = &args.host {
        builder = builder.host(host.clone());
    }
    if let Some(secs) = args.timeout_secs {
        builder = builder.request_timeout(Duration::from_secs(secs));
    }
    CredentialGate::new(Arc::new(builder.connector())).with_retries(args.retries)
}

/// Flag, then environment, then an interactive prompt.
fn resolve_api_key(args: &ConnectionArgs) -> anyhow::Result<String> {
    if let Some(key) = args.api_key.clone().or_else(|| std::env::var(API_KEY_ENV).ok()) {
        return Ok(key);
    }
    read_line("Enter your Stability AI API key: ")?
        .ok_or_else(|| anyhow::anyhow!("no API key provided"))
}

fn read_line(prompt: &str) -> anyhow::Result<Option<String>> {
    eprint!("{prompt}");
    io::stderr().flush()?;
    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(&['\r', '\n'][..]).to_string()))
}

async fn validate(
    gate: &CredentialGate,
    args: &ConnectionArgs,
    json_output: bool,
) -> anyhow::Result<ExitCode> {
    let key = resolve_api_key(args)?;
    let outcome = gate.check(&key).await;

    if json_output {
        let (valid, reason) = match &outcome {
            ValidationOutcome::Valid(_) => (true, None),
            ValidationOutcome::Rejected(r) => (false, Some(r.as_str())),
            ValidationOutcome::Unreachable(r) => (false, Some(r.as_str())),
        };
        let result = serde_json::json!({
            "valid": valid,
            "unreachable": matches!(outcome, ValidationOutcome::Unreachable(_)),
            "reason": reason,
        });
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_validation(&outcome);
    }

    Ok(if outcome.is_valid() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_validation(outcome: &ValidationOutcome) {
    match outcome {
        ValidationOutcome::Valid(_) => println!("API key validated successfully!"),
        ValidationOutcome::Rejected(reason) => {
            eprintln!("Invalid API key. Please try again. ({reason})")
        }
        ValidationOutcome::Unreachable(reason) => {
            eprintln!("Could not reach the API to validate the key. Please try again. ({reason})")
        }
    }
}

async fn generate(
    gate: CredentialGate,
    args: &ConnectionArgs,
    opts: GenerateArgs,
    json_output: bool,
) -> anyhow::Result<ExitCode> {
    if opts.prompt.trim().is_empty() {
        anyhow::bail!("Please enter a prompt before generating.");
    }

    let key = resolve_api_key(args)?;
    let mut session = Session::with_gate(gate);
    let validation = session.unlock(&key).await;
    if !validation.is_valid() {
        print_validation(&validation);
        return Ok(ExitCode::FAILURE);
    }

    eprintln!("Generating image with Stable Diffusion...");
    let outcome = session.generate(&opts.prompt).await?;
    report(outcome, &opts.output, json_output)
}

fn report(outcome: GenerationOutcome, output: &Path, json_output: bool) -> anyhow::Result<ExitCode> {
    let (code, kind, message) = match outcome {
        GenerationOutcome::Image(image) => {
            image.save(output)?;
            print_image(&image, output, json_output)?;
            return Ok(ExitCode::SUCCESS);
        }
        GenerationOutcome::Filtered(reason) => (ExitCode::from(2), "filtered", reason),
        GenerationOutcome::Error(message) => (ExitCode::FAILURE, "error", message),
    };

    if json_output {
        let result = serde_json::json!({
            "type": "image",
            "success": false,
            "outcome": kind,
            "message": message,
        });
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else if kind == "filtered" {
        eprintln!("warning: {message}");
    } else {
        eprintln!("Error generating image: {message}");
        eprintln!("Failed to generate image. Please try a different prompt.");
    }
    Ok(code)
}

fn print_image(image: &GeneratedImage, output: &Path, json_output: bool) -> anyhow::Result<()> {
    if json_output {
        let result = serde_json::json!({
            "type": "image",
            "success": true,
            "output": output.display().to_string(),
            "size_bytes": image.size(),
            "format": image.format.extension(),
            "engine": image.metadata.engine,
            "seed": image.metadata.seed,
            "duration_ms": image.metadata.duration_ms,
        });
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!(
            "Generated image: {} ({} bytes)",
            output.display(),
            image.size()
        );
        if let Some(duration) = image.metadata.duration_ms {
            println!("Duration: {}ms", duration);
        }
    }
    Ok(())
}

/// Reports one interactive result. A failure here never ends the session.
fn report_in_session(outcome: GenerationOutcome, path: &Path) -> bool {
    match report(outcome, path, false) {
        Ok(_) => true,
        Err(e) => {
            eprintln!("Error saving image: {e:#}");
            false
        }
    }
}

async fn interactive(
    gate: CredentialGate,
    args: &ConnectionArgs,
    opts: InteractiveArgs,
) -> anyhow::Result<ExitCode> {
    std::fs::create_dir_all(&opts.out_dir)?;
    let mut session = Session::with_gate(gate);

    println!("Welcome to Stable Diffusion Image Generator");
    let mut supplied = args
        .api_key
        .clone()
        .or_else(|| std::env::var(API_KEY_ENV).ok());
    loop {
        let key = match supplied.take() {
            Some(key) => key,
            None => match read_line("Enter your Stability AI API key: ")? {
                Some(key) => key,
                None => return Ok(ExitCode::FAILURE),
            },
        };
        let outcome = session.unlock(&key).await;
        print_validation(&outcome);
        if outcome.is_valid() {
            break;
        }
    }

    println!("Enter a prompt per line. An empty line is ignored; Ctrl-D quits.");
    let mut count = 0u32;
    while let Some(prompt) = read_line("prompt> ")? {
        if prompt.trim().is_empty() {
            eprintln!("Please enter a prompt before generating.");
            continue;
        }

        eprintln!("Generating image with Stable Diffusion...");
        let outcome = session.generate(&prompt).await?;
        count += 1;
        let ext = outcome
            .image()
            .map(|image| image.format.extension())
            .unwrap_or("png");
        let path = opts.out_dir.join(format!("image-{count:03}.{ext}"));
        report_in_session(outcome, &path);
    }

    session.sign_out();
    Ok(ExitCode::SUCCESS)
}
