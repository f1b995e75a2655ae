// CLI handling for vinted-watcher
//
// The binary normally runs the full service; the `config` subcommand prints
// the effective configuration (env + file + defaults) and exits, which is the
// quickest way to check what a deployment will actually do.

use clap::{Parser, Subcommand};

use crate::config::{Config, VERSION};

#[derive(Parser)]
#[command(name = "vinted-watcher")]
#[command(version = VERSION)]
#[command(about = "Marketplace monitor: scans saved searches and notifies on new listings")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print the effective configuration and exit
    Config,
}

/// Handle CLI subcommands. Returns true if a command was handled and the
/// process should exit.
pub fn handle_cli() -> bool {
    let cli = Cli::parse();

    match cli.command {
        Some(Command::Config) => {
            print_effective_config();
            true
        }
        None => false,
    }
}

fn print_effective_config() {
    let config = Config::from_env();

    println!("vinted-watcher {}", VERSION);
    println!();
    println!("  bind_addr:            {}", config.bind_addr);
    println!("  database_path:        {}", config.database_path.display());
    println!("  log_level:            {}", config.log_level);
    println!("  allow_emergency_exit: {}", config.allow_emergency_exit);
    println!();
    println!("  telegram configured:  {}", config.telegram_bot_token.is_some());
    println!("  control plane token:  {}", config.railway_token.is_some());
    println!("  redeploy webhook:     {}", config.railway_redeploy_webhook.is_some());
    println!();
    let t = &config.tunables;
    println!("  session error limit:  {}", t.max_session_errors);
    println!("  rotation scans:       {}", t.rotation_scans);
    println!("  priority cadence:     {}s", t.priority_refresh_secs);
    println!("  critical errors:      {}", t.critical_total_errors);
    println!("  success threshold:    {}", t.success_threshold);
    println!("  redeploy cooldown:    {}s", t.min_redeploy_interval.as_secs());
    println!("  proxy recheck:        {}s", t.proxy_recheck_interval.as_secs());

    if let Some(path) = Config::config_path() {
        println!();
        if path.exists() {
            println!("  config file:          {}", path.display());
        } else {
            println!("  config file:          {} (not present)", path.display());
        }
    }
}
