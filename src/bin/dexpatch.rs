use clap::Parser;
use dexpatch::config::PipelineConfig;
use dexpatch::error::PipelineError;
use dexpatch::pipeline::Pipeline;
use dexpatch::tools::SignerConfig;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Replace one smali method inside an APK and re-sign it.
#[derive(Debug, Parser)]
#[command(name = "dexpatch", version)]
struct Args {
    /// APK to patch.
    input: PathBuf,

    /// Where to write the signed APK.
    #[arg(short, long)]
    output: PathBuf,

    /// JSON configuration (patch target, tool commands, minSdkVersion, ...).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Signer as NAME,KEY[,CERT...]; repeat for additional signers.
    #[arg(long = "signer", value_name = "NAME,KEY,CERT", value_parser = parse_signer, required = true)]
    signers: Vec<SignerConfig>,

    /// Override the minimum SDK version passed to the signer.
    #[arg(long)]
    min_sdk: Option<u32>,
}

fn parse_signer(value: &str) -> Result<SignerConfig, String> {
    let mut parts = value.split(',').map(str::trim);
    let name = parts.next().unwrap_or_default().to_string();
    let private_key = parts
        .next()
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .ok_or_else(|| format!("signer '{value}' is missing a private key"))?;
    let certificates: Vec<PathBuf> = parts.filter(|p| !p.is_empty()).map(PathBuf::from).collect();
    if certificates.is_empty() {
        return Err(format!("signer '{value}' has no certificates"));
    }
    Ok(SignerConfig {
        name,
        private_key,
        certificates,
    })
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match process_apk(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Aborted due to error: {e}");
            if let PipelineError::Signing {
                unsigned_archive: Some(path),
                ..
            } = &e
            {
                eprintln!("Unsigned APK kept at {}", path.display());
            }
            ExitCode::FAILURE
        }
    }
}

fn process_apk(args: Args) -> Result<(), PipelineError> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(min_sdk) = args.min_sdk {
        config.min_sdk_version = min_sdk;
    }

    let pipeline = Pipeline::with_command_tools(config);
    let handle = pipeline.spawn(args.input, args.output, args.signers)?;
    for status in handle.progress().iter() {
        println!("{status}");
    }
    let report = handle.join()?;
    for skipped in &report.skipped {
        println!("  skipped {}: {}", skipped.entry, skipped.failure);
    }
    println!(
        "Patched {} and wrote {}",
        report.patched_entry,
        report.output.display()
    );
    Ok(())
}
