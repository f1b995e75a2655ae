// Startup banner and configuration summary

use crate::config::{Config, VERSION};

/// Print the startup banner to stdout
pub fn print_startup(config: &Config) {
    println!();
    println!("  vinted-watcher v{}", VERSION);
    println!("  ──────────────────────────────────────");
    println!("  admin surface:  http://{}", config.bind_addr);
    println!("  store:          {}", config.database_path.display());
    println!(
        "  notifier:       {}",
        if config.telegram_bot_token.is_some() {
            "telegram (env credentials)"
        } else {
            "telegram (store credentials, if set)"
        }
    );
    println!();
}

/// Log the configuration facts worth having in every log capture
pub fn log_startup(config: &Config) {
    tracing::info!("vinted-watcher v{} starting", VERSION);
    tracing::info!("Admin surface on {}", config.bind_addr);
    tracing::info!("Store at {}", config.database_path.display());
    tracing::info!(
        "Emergency exit {}",
        if config.allow_emergency_exit { "enabled" } else { "disabled" }
    );
    tracing::debug!(
        "Tunables: rotation={} scans, session errors={}, critical={}, cooldown={}s",
        config.tunables.rotation_scans,
        config.tunables.max_session_errors,
        config.tunables.critical_total_errors,
        config.tunables.min_redeploy_interval.as_secs()
    );
}
