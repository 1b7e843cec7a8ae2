use std::io::BufRead;

use docsyncd::daemon::{DaemonConfig, DaemonRuntime};
use docsyncd::storage::CredentialStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    SyncNow(Option<i64>),
    Status,
    Login(i64),
    Logout(i64),
    Help,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cli {
    mode: CliMode,
    verbosity: u8,
}

fn parse_account_id(value: Option<String>, flag: &str) -> anyhow::Result<i64> {
    let Some(value) = value else {
        anyhow::bail!("{flag} requires an account id");
    };
    value
        .parse::<i64>()
        .map_err(|_| anyhow::anyhow!("invalid account id for {flag}: {value}"))
}

fn parse_cli<I>(args: I) -> anyhow::Result<Cli>
where
    I: IntoIterator<Item = String>,
{
    let mut cli = Cli {
        mode: CliMode::Run,
        verbosity: 0,
    };
    let mut args = args.into_iter().skip(1).peekable();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--sync-now" => {
                let account = match args.peek() {
                    Some(next) if !next.starts_with('-') => {
                        Some(parse_account_id(args.next(), "--sync-now")?)
                    }
                    _ => None,
                };
                cli.mode = CliMode::SyncNow(account);
            }
            "--status" => cli.mode = CliMode::Status,
            "--login" => cli.mode = CliMode::Login(parse_account_id(args.next(), "--login")?),
            "--logout" => cli.mode = CliMode::Logout(parse_account_id(args.next(), "--logout")?),
            "--help" | "-h" => cli.mode = CliMode::Help,
            "-v" => cli.verbosity = cli.verbosity.saturating_add(1),
            "-vv" => cli.verbosity = cli.verbosity.saturating_add(2),
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(cli)
}

fn init_tracing(verbosity: u8) {
    let default_filter = match verbosity {
        0 => "docsyncd=info",
        1 => "docsyncd=debug",
        2 => "docsyncd=trace",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}

/// Warns when the inotify watch limit looks too low for large mirrors.
fn check_inotify_limits() {
    let path = "/proc/sys/fs/inotify/max_user_watches";
    if let Ok(content) = std::fs::read_to_string(path)
        && let Ok(limit) = content.trim().parse::<u64>()
    {
        if limit < 65536 {
            tracing::warn!(
                max_user_watches = limit,
                "inotify watch limit is low, raise it with: echo 524288 | sudo tee {path}"
            );
        } else {
            tracing::debug!(max_user_watches = limit, "inotify watch limit ok");
        }
    }
}

fn print_help() {
    println!("Usage: docsyncd [-v|-vv] [--sync-now [ACCOUNT_ID] | --status | --login ACCOUNT_ID | --logout ACCOUNT_ID]");
    println!("  --sync-now [ID]   Run one full pass (all enabled accounts when ID is omitted) and exit");
    println!("  --status          Print per-account state and exit");
    println!("  --login ID        Read an Authorization header from stdin and store it in the keyring");
    println!("  --logout ID       Remove the stored Authorization header and exit");
    println!("  -v, -vv           Raise log verbosity (RUST_LOG overrides)");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = parse_cli(std::env::args())?;
    init_tracing(cli.verbosity);

    match cli.mode {
        CliMode::Help => {
            print_help();
            Ok(())
        }
        CliMode::Login(account_id) => {
            eprintln!("[docsyncd] paste the Authorization header for account {account_id}:");
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line)?;
            let header = line.trim();
            if header.is_empty() {
                anyhow::bail!("empty Authorization header");
            }
            CredentialStore::Keyring.save(account_id, header)?;
            eprintln!("[docsyncd] credentials stored for account {account_id}");
            Ok(())
        }
        CliMode::Logout(account_id) => {
            CredentialStore::Keyring.delete(account_id)?;
            eprintln!("[docsyncd] credentials removed for account {account_id}");
            Ok(())
        }
        CliMode::Status => {
            let daemon = DaemonRuntime::bootstrap(DaemonConfig::from_env()?, false).await?;
            for status in daemon.status().await? {
                println!("{status}");
            }
            Ok(())
        }
        CliMode::SyncNow(account_id) => {
            let daemon = DaemonRuntime::bootstrap(DaemonConfig::from_env()?, false).await?;
            for (id, stats) in daemon.sync_now(account_id).await? {
                match stats {
                    Some(stats) => println!("account {id}: {stats:?}"),
                    None => println!("account {id}: pass already running"),
                }
            }
            Ok(())
        }
        CliMode::Run => {
            check_inotify_limits();
            let daemon = DaemonRuntime::bootstrap(DaemonConfig::from_env()?, true).await?;
            daemon.run().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("docsyncd")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn parse_cli_defaults_to_run() {
        let cli = parse_cli(args(&[])).unwrap();
        assert_eq!(cli.mode, CliMode::Run);
        assert_eq!(cli.verbosity, 0);
    }

    #[test]
    fn parse_cli_supports_sync_now_with_and_without_account() {
        assert_eq!(parse_cli(args(&["--sync-now"])).unwrap().mode, CliMode::SyncNow(None));
        assert_eq!(
            parse_cli(args(&["--sync-now", "7"])).unwrap().mode,
            CliMode::SyncNow(Some(7))
        );
        let cli = parse_cli(args(&["--sync-now", "-v"])).unwrap();
        assert_eq!(cli.mode, CliMode::SyncNow(None));
        assert_eq!(cli.verbosity, 1);
    }

    #[test]
    fn parse_cli_supports_login_and_logout() {
        assert_eq!(parse_cli(args(&["--login", "2"])).unwrap().mode, CliMode::Login(2));
        assert_eq!(parse_cli(args(&["--logout", "3"])).unwrap().mode, CliMode::Logout(3));
        assert!(parse_cli(args(&["--logout"])).is_err());
        assert!(parse_cli(args(&["--login", "abc"])).is_err());
    }

    #[test]
    fn parse_cli_counts_verbosity() {
        assert_eq!(parse_cli(args(&["-vv", "--status"])).unwrap().verbosity, 2);
        assert_eq!(parse_cli(args(&["-v", "-vv"])).unwrap().verbosity, 3);
    }

    #[test]
    fn parse_cli_rejects_unknown_arguments() {
        assert!(parse_cli(args(&["--bogus"])).is_err());
    }
}
