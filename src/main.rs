use std::env;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use coin_ledger::csv::{CsvError, read_brands, read_commands, read_config, read_users, write_balances};
use coin_ledger::ledger::InMemoryDirectory;
use coin_ledger::{Ledger, LedgerConfig};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

const USAGE: &str = "usage: coin-ledger <brands.csv> <users.csv> <commands.csv> [config.csv]";

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(LevelFilter::WARN.into()))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let [brands, users, commands, rest @ ..] = args.as_slice() else {
        eprintln!("{USAGE}");
        return ExitCode::from(2);
    };
    if rest.len() > 1 {
        eprintln!("{USAGE}");
        return ExitCode::from(2);
    }

    for path in args.iter().filter(|path| !path.ends_with(".csv")) {
        warn!(path, "input file seems to not be a csv file");
    }

    let ledger = match setup(brands, users, rest.first()) {
        Ok(ledger) => ledger,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let commands = match read_commands(Path::new(commands)) {
        Ok(commands) => commands,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let (cmd_sender, cmd_receiver) = tokio::sync::mpsc::channel(16);
    tokio::spawn(async move {
        for result in commands {
            match result {
                Ok(command) => {
                    if cmd_sender.send(command).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("{e}");
                }
            }
        }
    });

    ledger.run(ReceiverStream::new(cmd_receiver)).await;

    if let Err(e) = write_balances(std::io::stdout().lock(), ledger.balances()) {
        error!("{e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn setup(brands: &str, users: &str, config: Option<&String>) -> Result<Ledger, CsvError> {
    let directory = InMemoryDirectory::new();
    for brand in read_brands(brands)? {
        let id = brand.id;
        if let Err(e) = directory.upsert_brand(brand) {
            warn!(brand = id, "{e}");
        }
    }
    for user in read_users(users)? {
        directory.upsert_user(user);
    }

    let config = match config {
        Some(path) => read_config(path)?,
        None => LedgerConfig::default(),
    };
    Ok(Ledger::new(Arc::new(directory)).with_config(config))
}
