use std::{path::PathBuf, sync::Arc};

use clap::{Arg, ArgMatches, Command};
use eyre::{Result, WrapErr, eyre};
use jumpgate::{
    Config, Credential, GroupConfig, GroupState, RusshTransport, Supervisor, TunnelEvent,
};
use tokio::{signal, sync::broadcast, task::JoinSet};
use tracing::{error, info, warn};

const PASSWORD_ENV: &str = "JUMPGATE_PASSWORD";
const PASSPHRASE_ENV: &str = "JUMPGATE_KEY_PASSPHRASE";

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("jumpgate")
        .version("0.1.0")
        .author("akagi201")
        .about("Supervise groups of SSH port forwards through a jump host")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("jumpgate.json")
                .global(true),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(clap::ArgAction::Count)
                .help("Increase logging verbosity")
                .global(true),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("up")
                .about("Start groups and stream their events until Ctrl+C")
                .arg(group_args()),
        )
        .subcommand(Command::new("check").about("Validate the configuration"))
        .subcommand(
            Command::new("command")
                .about("Print the equivalent ssh command lines")
                .arg(group_args()),
        )
        .subcommand(
            Command::new("import")
                .about("Convert an ssh command line into a group definition")
                .arg(
                    Arg::new("ssh_command")
                        .value_name("SSH_COMMAND")
                        .help("e.g. \"ssh ops@bastion -L 8080:db:5432 -N\"")
                        .required(true),
                )
                .arg(
                    Arg::new("name")
                        .long("name")
                        .value_name("NAME")
                        .help("Name of the imported group")
                        .required(true),
                ),
        )
        .get_matches();

    jumpgate::init_logging(matches.get_count("verbose"))?;

    match matches.subcommand() {
        Some(("import", sub)) => import(sub),
        Some((name, sub)) => {
            let config_path = matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .ok_or_else(|| eyre!("config argument is required"))?;
            let config = Config::from_file(&config_path)
                .wrap_err_with(|| format!("Loading {}", config_path.display()))?;
            info!("Loaded configuration from {}", config_path.display());

            match name {
                "up" => up(config, selected(sub)).await,
                "check" => check(&config),
                "command" => command(&config, selected(sub)),
                other => Err(eyre!("Unknown command {other}")),
            }
        }
        None => Err(eyre!("No command given")),
    }
}

fn group_args() -> Arg {
    Arg::new("groups")
        .value_name("GROUP")
        .help("Groups to act on (default: all)")
        .num_args(0..)
}

fn selected(matches: &ArgMatches) -> Vec<String> {
    matches
        .get_many::<String>("groups")
        .map(|groups| groups.cloned().collect())
        .unwrap_or_default()
}

fn pick<'a>(config: &'a Config, names: &[String]) -> Result<Vec<&'a GroupConfig>> {
    if names.is_empty() {
        return Ok(config.groups.iter().collect());
    }
    names
        .iter()
        .map(|name| {
            config
                .group(name)
                .ok_or_else(|| eyre!("Group '{name}' is not defined"))
        })
        .collect()
}

/// Key file if configured, otherwise the password from the environment
fn credential_for(group: &GroupConfig) -> Result<Credential> {
    if let Some(path) = group.jump.key_path() {
        return Ok(Credential::KeyFile {
            path,
            passphrase: std::env::var(PASSPHRASE_ENV).ok(),
        });
    }
    std::env::var(PASSWORD_ENV)
        .map(Credential::Password)
        .map_err(|_| {
            eyre!(
                "Group '{}' has no key file and {} is not set",
                group.name,
                PASSWORD_ENV
            )
        })
}

async fn up(config: Config, names: Vec<String>) -> Result<()> {
    let targets: Vec<(String, Credential)> = pick(&config, &names)?
        .into_iter()
        .map(|group| -> Result<(String, Credential)> {
            Ok((group.name.clone(), credential_for(group)?))
        })
        .collect::<Result<_>>()?;

    let options = config.supervisor_options();
    let store = Arc::new(config.into_store()?);
    let supervisor = Arc::new(Supervisor::new(
        Arc::new(RusshTransport::new()),
        options,
        store,
    ));

    let printer = tokio::spawn(print_events(supervisor.subscribe()));

    let mut starts = JoinSet::new();
    for (name, credential) in targets {
        let supervisor = Arc::clone(&supervisor);
        starts.spawn(async move { supervisor.start_group(&name, &credential).await });
    }
    while let Some(res) = starts.join_next().await {
        match res {
            Ok(Ok(status)) if status.state == GroupState::Running => {
                info!("Group {} running", status.name)
            }
            Ok(Ok(status)) => warn!("Group {} is {:?}", status.name, status.state),
            Ok(Err(e)) => error!("{}", e),
            Err(e) => error!("Start task failed: {}", e),
        }
    }

    info!("Tunnels up. Press Ctrl+C to stop.");
    signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");

    supervisor.shutdown().await;
    printer.abort();

    info!("Shutdown complete");
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<TunnelEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!("Cannot render event: {}", e),
            },
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("Event output fell behind, {} event(s) dropped", missed)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn check(config: &Config) -> Result<()> {
    for group in &config.groups {
        println!(
            "{}: {}@{}:{} with {} forward(s)",
            group.name,
            group.jump.user,
            group.jump.host,
            group.jump.port,
            group.forwardings.len()
        );
        for forward in group.to_group()?.forwards {
            println!("  {forward}");
        }
    }
    println!("Configuration OK");
    Ok(())
}

fn command(config: &Config, names: Vec<String>) -> Result<()> {
    for group in pick(config, &names)? {
        println!("# {}", group.name);
        println!("{}", group.to_ssh_command());
    }
    Ok(())
}

fn import(matches: &ArgMatches) -> Result<()> {
    let ssh_command = matches
        .get_one::<String>("ssh_command")
        .ok_or_else(|| eyre!("ssh command is required"))?;
    let name = matches
        .get_one::<String>("name")
        .ok_or_else(|| eyre!("group name is required"))?;

    let group = GroupConfig::from_ssh_command(name, ssh_command)?;
    println!("{}", serde_json::to_string_pretty(&group)?);
    Ok(())
}
