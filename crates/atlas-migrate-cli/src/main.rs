//! atlas-migrate CLI - legacy launcher snapshot to PostgreSQL migration.

use clap::{ArgAction, Parser};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::Level;

use atlas_migrate::{
    DbConfig, EntitySelection, MigrateError, MigrateOptions, Migrator, SnapshotPaths,
};

#[derive(Parser)]
#[command(name = "atlas-migrate")]
#[command(about = "Migrate a legacy launcher JSON snapshot into PostgreSQL")]
#[command(version)]
struct Cli {
    /// Path to the primary client list [default: migration/clients.json]
    #[arg(long = "json", value_name = "FILE")]
    clients_json: Option<PathBuf>,

    /// Path to the fabric client list [default: migration/fabric-clients.json]
    #[arg(long, value_name = "FILE")]
    fabric_json: Option<PathBuf>,

    /// Path to the forge client list [default: migration/forge-clients.json]
    #[arg(long, value_name = "FILE")]
    forge_json: Option<PathBuf>,

    /// Path to the analytics counter object [default: migration/analytics.json]
    #[arg(long, value_name = "FILE")]
    analytics_json: Option<PathBuf>,

    /// Path to the user list [default: migration/users.json]
    #[arg(long, value_name = "FILE")]
    users_json: Option<PathBuf>,

    /// Path to the user profile dump [default: migration/user_data.json]
    #[arg(long, value_name = "FILE")]
    user_data_json: Option<PathBuf>,

    /// Path to the social link dump [default: migration/social_links.json]
    #[arg(long, value_name = "FILE")]
    social_links_json: Option<PathBuf>,

    /// Path to the friendship dump [default: migration/friendships.json]
    #[arg(long, value_name = "FILE")]
    friendships_json: Option<PathBuf>,

    /// Migrate clients (with no selector given, every entity runs)
    #[arg(long)]
    clients: bool,

    /// Migrate fabric clients
    #[arg(long)]
    fabric: bool,

    /// Migrate forge clients
    #[arg(long)]
    forge: bool,

    /// Migrate the analytics counter
    #[arg(long)]
    analytics: bool,

    /// Migrate users
    #[arg(long)]
    users: bool,

    /// Migrate user profiles
    #[arg(long)]
    user_profiles: bool,

    /// Migrate social links
    #[arg(long)]
    social_links: bool,

    /// Migrate friendships
    #[arg(long, visible_alias = "friendship")]
    friendships: bool,

    /// Leave the clients/users id sequences alone after writing
    #[arg(long)]
    skip_sequence_reset: bool,

    /// Output JSON report to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), MigrateError> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, &cli.log_format).map_err(MigrateError::Config)?;

    let config = DbConfig::from_env()?;

    let mut paths = SnapshotPaths::default();
    if let Some(path) = cli.clients_json {
        paths.clients = path;
    }
    if let Some(path) = cli.fabric_json {
        paths.fabric_clients = path;
    }
    if let Some(path) = cli.forge_json {
        paths.forge_clients = path;
    }
    if let Some(path) = cli.analytics_json {
        paths.analytics = path;
    }
    if let Some(path) = cli.users_json {
        paths.users = path;
    }
    if let Some(path) = cli.user_data_json {
        paths.user_profiles = path;
    }
    if let Some(path) = cli.social_links_json {
        paths.social_links = path;
    }
    if let Some(path) = cli.friendships_json {
        paths.friendships = path;
    }

    let selection = EntitySelection {
        clients: cli.clients,
        fabric: cli.fabric,
        forge: cli.forge,
        analytics: cli.analytics,
        users: cli.users,
        user_profiles: cli.user_profiles,
        social_links: cli.social_links,
        friendships: cli.friendships,
    };

    let options = MigrateOptions {
        skip_sequence_reset: cli.skip_sequence_reset,
        ..MigrateOptions::default()
    };

    let migrator = Migrator::new(config, paths, selection, options);
    let report = migrator.run().await?;

    if cli.output_json {
        println!("{}", report.to_json()?);
    } else {
        println!("\nMigration completed!");
        println!("  Run ID: {}", report.run_id);
        println!("  Target: {}", report.target);
        println!("  Duration: {:.2}s", report.duration_seconds);
        println!(
            "  Clients: {} written ({} rejected)",
            report.clients_written, report.clients_rejected
        );
        println!(
            "  Dependencies: {} written ({} skipped)",
            report.dependencies_written, report.dependencies_skipped
        );
        println!(
            "  Analytics counters: {} written ({} rejected)",
            report.analytics_written, report.analytics_rejected
        );
        println!(
            "  Users: {} written ({} assigned ids, {} placeholders, {} synthesized)",
            report.users_written,
            report.users_assigned_ids,
            report.users_placeholders,
            report.users_synthesized
        );
        println!(
            "  Profiles: {} written ({} skipped, {} synthesized)",
            report.profiles_written, report.profiles_skipped, report.profiles_synthesized
        );
        println!(
            "  Social links: {} written ({} skipped)",
            report.social_links_written, report.social_links_skipped
        );
        println!(
            "  Friendships: {} written ({} skipped)",
            report.friendships_written, report.friendships_skipped
        );
        if !report.sequences_reset.is_empty() {
            println!("  Sequences reset: {}", report.sequences_reset.join(", "));
        }
    }

    Ok(())
}

fn setup_logging(verbose: u8, format: &str) -> Result<(), String> {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    // Location detail only once someone asks for debug output.
    let detailed = verbose >= 2;
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(detailed)
        .with_file(detailed)
        .with_line_number(detailed);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}
