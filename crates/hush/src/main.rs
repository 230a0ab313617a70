mod client;

use std::io::Read;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hush_server::envelope::{decrypt_secret, encrypt_secret, EnvelopeError, ShareLink};
use hush_server::pow::SolveTask;
use hush_server::store::model::{MAX_TTL_SECS, MAX_VIEWS, MIN_TTL_SECS, MIN_VIEWS};
use hush_server::wire::CreateRequest;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::client::HushClient;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "hush", about = "hush: share a secret once, end-to-end encrypted", version)]
struct Cli {
    /// hush server URL (default: http://localhost:8080 or $HUSH_SERVER)
    #[arg(long, env = "HUSH_SERVER", default_value = "http://localhost:8080")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the hush HTTP server (configured through HUSH_* variables)
    Serve {
        /// Port to listen on (overrides $HUSH_PORT)
        #[arg(long)]
        port: Option<u16>,
        /// Host to bind (overrides $HUSH_HOST)
        #[arg(long)]
        host: Option<String>,
    },
    /// Encrypt text locally, upload it, and print a one-time link
    Share {
        /// Text to share; read from stdin when omitted or `-`
        #[arg(name = "TEXT")]
        text: Option<String>,
        /// Lifetime e.g. 15m, 1h, 7d (between 15 minutes and 90 days)
        #[arg(long, default_value = "1h")]
        ttl: String,
        /// Number of times the link can be opened (1-5)
        #[arg(long, default_value_t = 1)]
        views: u8,
        /// Also require a passphrase to decrypt
        #[arg(long)]
        protect: bool,
    },
    /// Fetch and decrypt a shared secret (consumes one view)
    Open {
        /// Share link including its `#fragment`
        url: String,
    },
    /// Destroy a secret before it is read
    Burn {
        /// Secret id (the segment after `/s/` in the link)
        id: String,
        /// Burn token printed by `share`
        burn_token: String,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("HUSH_LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port, host } => cmd_serve(host, port).await,

        Commands::Share {
            text,
            ttl,
            views,
            protect,
        } => {
            let client = HushClient::parse(&cli.server)?;
            cmd_share(&client, text, &ttl, views, protect).await
        }

        Commands::Open { url } => cmd_open(&url).await,

        Commands::Burn { id, burn_token } => {
            let client = HushClient::parse(&cli.server)?;
            client.burn(&id, &burn_token).await?;
            println!("✓ burn request accepted for {id}");
            Ok(())
        }
    }
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_serve(host: Option<String>, port: Option<u16>) -> Result<()> {
    let mut cfg = hush_server::ServerConfig::from_env()?;
    if let Some(host) = host {
        cfg.host = host;
    }
    if let Some(port) = port {
        cfg.port = port;
    }
    hush_server::run(cfg).await
}

async fn cmd_share(
    client: &HushClient,
    text: Option<String>,
    ttl: &str,
    views: u8,
    protect: bool,
) -> Result<()> {
    let ttl_secs = parse_ttl(ttl)?;
    if !(MIN_VIEWS..=MAX_VIEWS).contains(&views) {
        anyhow::bail!("--views must be between {MIN_VIEWS} and {MAX_VIEWS}");
    }

    let plaintext = read_text(text)?;
    let passphrase = if protect {
        Some(prompt_new_passphrase()?)
    } else {
        None
    };

    let issued = client.request_token().await?;
    debug!(difficulty = issued.challenge.difficulty, "solving proof of work");
    let solver = SolveTask::spawn(issued.nonce.clone(), issued.challenge.clone());

    // Key derivation overlaps with the search.
    let sealed = encrypt_secret(&plaintext, passphrase.as_deref())?;
    let solution = solver
        .join()
        .await
        .context("proof-of-work search stopped before finding a solution")?;

    let body = CreateRequest::new(&sealed.payload, issued.nonce, solution, ttl_secs, views);
    let created = client.create(&issued.token, &body).await?;

    let link = ShareLink::new(client.base().clone(), created.id.as_str(), sealed.fragment);
    println!("{link}");
    eprintln!("burn token: {}", created.burn_token);
    eprintln!(
        "expires in {}, {} view(s)",
        humantime::format_duration(std::time::Duration::from_secs(ttl_secs)),
        views
    );
    Ok(())
}

async fn cmd_open(url: &str) -> Result<()> {
    let link = ShareLink::parse(url)?;
    let client = HushClient::new(link.base.clone());

    let Some(secret) = client.fetch(&link.id).await? else {
        anyhow::bail!("secret is not available (already viewed, burned, or expired)");
    };
    let payload = secret.payload()?;

    let passphrase = if payload.is_passphrase_protected() {
        Some(rpassword::prompt_password("Passphrase: ").context("read passphrase")?)
    } else {
        None
    };

    match decrypt_secret(&payload, &link.fragment, passphrase.as_deref()) {
        Ok(plaintext) => {
            println!("{plaintext}");
            Ok(())
        }
        Err(EnvelopeError::DecryptionFailed) if passphrase.is_some() => {
            anyhow::bail!("decryption failed: wrong passphrase or damaged link")
        }
        Err(e) => Err(e.into()),
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Parse human duration strings like "1h", "30m", "7d" into seconds, within
/// the range the server accepts.
fn parse_ttl(s: &str) -> Result<u64> {
    let d: humantime::Duration = s
        .parse()
        .with_context(|| format!("invalid duration: {s}"))?;
    let secs = d.as_secs();
    if !(MIN_TTL_SECS..=MAX_TTL_SECS).contains(&secs) {
        anyhow::bail!("--ttl must be between 15m and 90d");
    }
    Ok(secs)
}

fn read_text(text: Option<String>) -> Result<String> {
    match text {
        Some(t) if t != "-" => Ok(t),
        _ => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("read secret from stdin")?;
            Ok(strip_trailing_newline(buf))
        }
    }
}

fn strip_trailing_newline(mut s: String) -> String {
    if s.ends_with('\n') {
        s.pop();
        if s.ends_with('\r') {
            s.pop();
        }
    }
    s
}

fn prompt_new_passphrase() -> Result<String> {
    let first = rpassword::prompt_password("Passphrase: ").context("read passphrase")?;
    if first.is_empty() {
        anyhow::bail!("passphrase must not be empty");
    }
    let second = rpassword::prompt_password("Repeat passphrase: ").context("read passphrase")?;
    if first != second {
        anyhow::bail!("passphrases do not match");
    }
    Ok(first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn ttl_accepts_human_durations_in_range() {
        assert_eq!(parse_ttl("15m").unwrap(), 900);
        assert_eq!(parse_ttl("1h").unwrap(), 3600);
        assert_eq!(parse_ttl("90days").unwrap(), MAX_TTL_SECS);
        assert!(parse_ttl("5m").is_err());
        assert!(parse_ttl("91d").is_err());
        assert!(parse_ttl("soon").is_err());
    }

    #[test]
    fn strips_one_trailing_newline() {
        assert_eq!(strip_trailing_newline("abc\n".into()), "abc");
        assert_eq!(strip_trailing_newline("abc\r\n".into()), "abc");
        assert_eq!(strip_trailing_newline("abc\n\n".into()), "abc\n");
        assert_eq!(strip_trailing_newline("abc".into()), "abc");
    }

    #[test]
    fn share_defaults() {
        let cli = Cli::try_parse_from(["hush", "share", "hello"]).unwrap();
        let Commands::Share {
            text,
            ttl,
            views,
            protect,
        } = cli.command
        else {
            panic!("expected share");
        };
        assert_eq!(text.as_deref(), Some("hello"));
        assert_eq!(ttl, "1h");
        assert_eq!(views, 1);
        assert!(!protect);
    }
}
