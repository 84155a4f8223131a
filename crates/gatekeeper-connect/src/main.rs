//! gatekeeper-connect: connect to a Gatekeeper listener from the command line.
//!
//! Authenticates with a secret, then pipes stdin to the endpoint and the
//! endpoint's replies to stdout.

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use zeroize::Zeroizing;

use gatekeeper_core::digest_of;
use gatekeeper_relay::handshake;

const PASSWORD_ENV: &str = "GATEKEEPER_PASSWORD";

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  gatekeeper-connect <host:port>   authenticate, then relay stdin/stdout");
    eprintln!("  gatekeeper-connect digest        print the mapping digest of a secret");
    eprintln!();
    eprintln!("The secret is taken from ${PASSWORD_ENV}, or else the first line of stdin.");
    eprintln!("After stdin ends, replies are printed until the remote side closes.");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();

    match args.as_slice() {
        ["help"] | ["--help"] | ["-h"] | [] => {
            print_usage();
            Ok(())
        }
        ["digest"] => cmd_digest().await,
        [target] => cmd_connect(target).await,
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}

// ── Commands ──────────────────────────────────────────────────────────────────

async fn cmd_digest() -> Result<()> {
    let mut stdin = BufReader::new(tokio::io::stdin());
    let secret = read_secret(&mut stdin).await?;
    println!("{}", digest_of(secret.as_bytes()));
    Ok(())
}

async fn cmd_connect(target: &str) -> Result<()> {
    let mut stdin = BufReader::new(tokio::io::stdin());
    let secret = read_secret(&mut stdin).await?;

    let mut stream = TcpStream::connect(target)
        .await
        .with_context(|| format!("failed to connect to {target}"))?;
    handshake::authenticate(&mut stream, secret.as_bytes())
        .await
        .context("handshake failed")?;
    drop(secret);

    relay_stdio(stream, stdin, tokio::io::stdout()).await
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// The secret from the environment, or the first line of `stdin`.
async fn read_secret<R>(stdin: &mut BufReader<R>) -> Result<Zeroizing<String>>
where
    R: AsyncRead + Unpin,
{
    if let Ok(secret) = std::env::var(PASSWORD_ENV) {
        return Ok(Zeroizing::new(secret));
    }

    let mut line = Zeroizing::new(String::new());
    stdin
        .read_line(&mut line)
        .await
        .context("failed to read secret from stdin")?;
    let trimmed = line.trim_end_matches(['\r', '\n']);
    if trimmed.is_empty() {
        bail!("no secret given (set {PASSWORD_ENV} or write it on the first line of stdin)");
    }
    Ok(Zeroizing::new(trimmed.to_string()))
}

/// Copy `input` → socket and socket → `output` until the remote side closes.
///
/// The socket is never half-closed: the listener treats a client FIN as the
/// end of the session, so replies would be lost. Once `input` is exhausted
/// the client only waits for the remote to close.
async fn relay_stdio<S, R, W>(stream: S, mut input: R, mut output: W) -> Result<()>
where
    S: AsyncRead + AsyncWrite,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (mut rd, mut wr) = tokio::io::split(stream);

    let upload = async {
        tokio::io::copy(&mut input, &mut wr).await?;
        wr.flush().await?;
        std::future::pending::<std::io::Result<()>>().await
    };
    let download = async {
        tokio::io::copy(&mut rd, &mut output).await?;
        output.flush().await
    };

    tokio::select! {
        r = download => r.context("relay from endpoint failed")?,
        r = upload => r.context("relay to endpoint failed")?,
    }
    Ok(())
}
