#![doc = include_str!("../README.md")]

use anyhow::{Context, bail};
use certforge_core::protocol::{Response, encode_request};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::{io::AsyncWriteExt, net::TcpStream};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "certforge-client",
    version,
    about = "Requests a key and certificate from a certforge server"
)]
struct Args {
    /// Server host name or address
    host: String,

    /// Server port
    port: u16,

    /// Subject name to request
    name: String,

    /// Seconds to wait after sending the request before reading the response
    #[arg(long, default_value_t = 0)]
    delay: u64,

    /// Send the request and exit without reading the response
    #[arg(long = "exit-before-read", visible_alias = "preexit")]
    exit_before_read: bool,

    /// Directory for the `.key` and `.crt` files
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,
}

#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Saved { key: PathBuf, certificate: PathBuf },
    Abandoned,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .init();

    let args = Args::parse();
    match run(&args).await? {
        Outcome::Saved { key, certificate } => tracing::info!(
            "Saved {} and {}",
            key.display(),
            certificate.display()
        ),
        Outcome::Abandoned => tracing::info!("Exited before reading the response"),
    }
    Ok(())
}

async fn run(args: &Args) -> anyhow::Result<Outcome> {
    check_file_name(&args.name)?;
    let request = encode_request(&args.name)?;

    let mut stream = TcpStream::connect((args.host.as_str(), args.port))
        .await
        .with_context(|| format!("failed to connect to {}:{}", args.host, args.port))?;
    stream.write_all(&request).await?;
    tracing::debug!("Requested {:?}", args.name);

    if args.exit_before_read {
        return Ok(Outcome::Abandoned);
    }
    if args.delay > 0 {
        tracing::info!("Waiting {}s before reading", args.delay);
        tokio::time::sleep(Duration::from_secs(args.delay)).await;
    }

    match Response::read_from(&mut stream).await? {
        Response::Issued {
            private_key,
            certificate,
        } => {
            let key_path = args.out_dir.join(format!("{}.key", args.name));
            let cert_path = args.out_dir.join(format!("{}.crt", args.name));
            write_file(&key_path, &private_key).await?;
            write_file(&cert_path, &certificate).await?;
            Ok(Outcome::Saved {
                key: key_path,
                certificate: cert_path,
            })
        }
        Response::Failed { message } => bail!("server returned an error: {message}"),
    }
}

/// Rejects names that would place output files outside `--out-dir`.
fn check_file_name(name: &str) -> anyhow::Result<()> {
    if name == "." || name == ".." || name.contains(['/', '\\']) {
        bail!("{name:?} cannot be used as a file name");
    }
    Ok(())
}

async fn write_file(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    tokio::fs::write(path, contents)
        .await
        .with_context(|| format!("failed to write {}", path.display()))
}
