//! CLI entry point for stratum.
//! Routes `db` and `migration` subcommands to the core library, maps errors
//! to exit codes and wires Ctrl-C to cancellation.

mod output;

use std::io::{IsTerminal, Read};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use colored::Colorize;

use stratum_core::config::{CliOverrides, StratumConfig};
use stratum_core::context::{Context, Target};
use stratum_core::error::StratumError;
use stratum_core::prompt::AutoConfirm;
use stratum_core::reconcile::repair_suggestion;
use stratum_core::{DiffOptions, DumpMode, DumpOptions, PushOptions, RepairStatus, Stratum};

#[derive(Parser)]
#[command(
    name = "stratum",
    about = "Reconcile local migration files with local and remote Postgres databases",
    version = concat!(
        env!("CARGO_PKG_VERSION"),
        " (", env!("GIT_HASH"), " ", env!("BUILD_TIME"), ")"
    ),
    propagate_version = true
)]
struct Cli {
    /// Project directory (default: current directory)
    #[arg(long, value_name = "PATH", global = true)]
    workdir: Option<PathBuf>,

    /// Config file path (default: <workdir>/stratum.toml)
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Remote database URL (overrides config)
    #[arg(long, value_name = "URL", global = true)]
    db_url: Option<String>,

    /// Migrations directory (overrides config)
    #[arg(long, value_name = "PATH", global = true)]
    migrations_dir: Option<PathBuf>,

    /// SSL/TLS mode for the remote database: disable, prefer, require
    #[arg(long, value_name = "MODE", global = true)]
    ssl_mode: Option<String>,

    /// Number of retries when connecting to the remote database
    #[arg(long, value_name = "N", global = true)]
    connect_retries: Option<u32>,

    /// Host port of the shadow database
    #[arg(long, value_name = "PORT", global = true)]
    shadow_port: Option<u16>,

    /// Answer yes to every confirmation prompt
    #[arg(short, long, global = true)]
    yes: bool,

    /// Output results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Enable verbose/debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage local and remote databases
    #[command(subcommand)]
    Db(DbCommands),

    /// Inspect and repair migration history
    #[command(subcommand)]
    Migration(MigrationCommands),
}

#[derive(Subcommand)]
enum DbCommands {
    /// Create an empty migration file (or one filled from stdin)
    New {
        /// Migration name
        name: String,
    },

    /// Pull schema changes from the remote database into a new migration
    Pull {
        /// Migration name
        #[arg(default_value = stratum_core::commands::pull::DEFAULT_NAME)]
        name: String,
        /// Extra schemas to include
        #[arg(short, long = "schema", value_name = "SCHEMA", value_delimiter = ',')]
        schemas: Vec<String>,
        /// Pull from the local database instead
        #[arg(long)]
        local: bool,
    },

    /// Apply local migrations missing from the remote database
    Push {
        /// Print pending migrations without applying them
        #[arg(long)]
        dry_run: bool,
        /// Run the seed script after migrations
        #[arg(long)]
        include_seed: bool,
        /// Push to the local database instead
        #[arg(long)]
        local: bool,
    },

    /// Recreate a database from local migrations
    #[command(disable_version_flag = true)]
    Reset {
        /// Apply migrations up to and including this version
        #[arg(long, value_name = "VERSION")]
        version: Option<String>,
        /// Reset the remote database
        #[arg(long, visible_alias = "remote")]
        linked: bool,
    },

    /// Squash migrations into a single file
    #[command(disable_version_flag = true)]
    Squash {
        /// Squash up to and including this version
        #[arg(long, value_name = "VERSION")]
        version: Option<String>,
        /// Also baseline the remote history table
        #[arg(long)]
        linked: bool,
    },

    /// Diff a database against the local migrations
    Diff {
        /// Schemas to diff
        #[arg(short, long = "schema", value_name = "SCHEMA", value_delimiter = ',')]
        schemas: Vec<String>,
        /// Diff the remote database
        #[arg(long)]
        linked: bool,
        /// Write the diff to a new migration with this name
        #[arg(short, long, value_name = "NAME")]
        file: Option<String>,
        /// Diff the declarative schema directory instead of a database
        #[arg(long, conflicts_with = "linked")]
        declarative: bool,
    },

    /// Dump the schema, data or roles of a database
    Dump(DumpArgs),
}

#[derive(Args)]
struct DumpArgs {
    /// Dump data instead of schema
    #[arg(long, conflicts_with = "role_only")]
    data_only: bool,
    /// Dump cluster roles instead of schema
    #[arg(long)]
    role_only: bool,
    /// Use COPY instead of INSERT statements
    #[arg(long, requires = "data_only")]
    use_copy: bool,
    /// Schemas to include
    #[arg(short, long = "schema", value_name = "SCHEMA", value_delimiter = ',')]
    schemas: Vec<String>,
    /// Tables to exclude, as schema.table
    #[arg(short = 'x', long = "exclude", value_name = "TABLE", value_delimiter = ',')]
    excluded_tables: Vec<String>,
    /// Write the dump to a file instead of stdout
    #[arg(short, long, value_name = "PATH")]
    file: Option<PathBuf>,
    /// Print the dump script instead of running it
    #[arg(long)]
    dry_run: bool,
    /// Dump the local database instead
    #[arg(long)]
    local: bool,
}

impl DumpArgs {
    fn options(&self) -> DumpOptions {
        let mode = if self.data_only {
            DumpMode::Data
        } else if self.role_only {
            DumpMode::Roles
        } else {
            DumpMode::Schema
        };
        DumpOptions {
            mode,
            schemas: self.schemas.clone(),
            excluded_schemas: Vec::new(),
            excluded_tables: self.excluded_tables.clone(),
            use_copy: self.use_copy,
            single_row_inserts: false,
            dry_run: self.dry_run,
        }
    }
}

#[derive(Subcommand)]
enum MigrationCommands {
    /// List local and remote migration versions
    List {
        /// List against the local database instead
        #[arg(long)]
        local: bool,
    },

    /// Mark versions applied or reverted without running them
    Repair {
        /// applied or reverted
        #[arg(long, value_name = "STATUS")]
        status: RepairStatus,
        /// Versions to repair
        #[arg(required = true, value_name = "VERSION")]
        versions: Vec<String>,
        /// Repair the local history table instead
        #[arg(long)]
        local: bool,
    },
}

fn target(local: bool) -> Target {
    if local {
        Target::Local
    } else {
        Target::Linked
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Set up logging (suppress when JSON output is requested)
    let filter = if cli.json || cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };

    env_logger::Builder::new()
        .parse_env(env_logger::Env::default().default_filter_or(filter))
        .format_target(false)
        .format_timestamp(None)
        .init();

    if let Err(e) = run(cli).await {
        print_error(&e);
        process::exit(exit_code(&e));
    }
}

/// Map error types to differentiated exit codes.
fn exit_code(error: &StratumError) -> i32 {
    match error {
        StratumError::ConfigError(_) => 2,
        StratumError::ConnectFailed { .. } => 4,
        StratumError::DatabaseError(_) => 4,
        StratumError::ApplyError { .. } => 5,
        StratumError::HistoryConflict { .. } => 11,
        StratumError::MissingLocal { .. } => 11,
        StratumError::NotRunning(_) => 12,
        StratumError::ShadowUnhealthy { .. } => 12,
        StratumError::DifferError { .. } => 13,
        StratumError::DumpError { .. } => 13,
        StratumError::Cancelled => 130,
        _ => 1,
    }
}

/// Load configuration, build the context and dispatch the chosen subcommand.
async fn run(cli: Cli) -> Result<(), StratumError> {
    let json = cli.json;
    let overrides = CliOverrides {
        workdir: cli.workdir,
        db_url: cli.db_url,
        migrations_dir: cli.migrations_dir,
        ssl_mode: cli.ssl_mode,
        connect_retries: cli.connect_retries,
        shadow_port: cli.shadow_port,
    };
    let config = StratumConfig::load(cli.config.as_deref(), &overrides)?;

    let mut ctx = Context::new(config);
    if cli.yes {
        ctx = ctx.with_prompt(Arc::new(AutoConfirm(true)));
    }

    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted; cleaning up");
            cancel.cancel();
        }
    });

    let stratum = Stratum::with_context(ctx);

    match cli.command {
        Commands::Db(command) => run_db_command(&stratum, command, json).await,
        Commands::Migration(command) => run_migration_command(&stratum, command, json).await,
    }
}

async fn run_db_command(
    stratum: &Stratum,
    command: DbCommands,
    json: bool,
) -> Result<(), StratumError> {
    match command {
        DbCommands::New { name } => {
            let mut stdin = std::io::stdin();
            let input: Option<&mut dyn Read> = if stdin.is_terminal() {
                None
            } else {
                Some(&mut stdin)
            };
            let report = stratum.new_migration(&name, input)?;
            if json {
                output::print_json(&report);
            } else {
                output::print_new_report(&report);
            }
        }
        DbCommands::Pull {
            name,
            schemas,
            local,
        } => {
            let report = stratum.pull(target(local), &name, &schemas).await?;
            output::print_drop_warnings(&report.drop_statements);
            if json {
                output::print_json(&report);
            } else {
                output::print_pull_report(&report);
            }
        }
        DbCommands::Push {
            dry_run,
            include_seed,
            local,
        } => {
            let options = PushOptions {
                target: target(local),
                dry_run,
                include_seed,
            };
            let report = stratum.push(&options).await?;
            if json {
                output::print_json(&report);
            } else {
                output::print_push_report(&report);
            }
        }
        DbCommands::Reset { version, linked } => {
            let target = if linked { Target::Linked } else { Target::Local };
            let report = stratum.reset(target, version.as_deref()).await?;
            if json {
                output::print_json(&report);
            } else {
                output::print_reset_report(&report);
            }
        }
        DbCommands::Squash { version, linked } => {
            let report = stratum.squash(version.as_deref(), linked).await?;
            if json {
                output::print_json(&report);
            } else {
                output::print_squash_report(&report);
            }
        }
        DbCommands::Diff {
            schemas,
            linked,
            file,
            declarative,
        } => {
            let options = DiffOptions {
                target: if linked { Target::Linked } else { Target::Local },
                schemas,
                file,
                declarative,
            };
            let report = stratum.diff(&options).await?;
            output::print_drop_warnings(&report.drop_statements);
            if json {
                output::print_json(&report);
            } else {
                output::print_diff_report(&report);
            }
        }
        DbCommands::Dump(args) => {
            let options = args.options();
            let mut stdout = tokio::io::stdout();
            let report = stratum
                .dump(target(args.local), options, args.file.as_deref(), &mut stdout)
                .await?;
            if json && report.path.is_some() {
                output::print_json(&report);
            } else if report.path.is_some() {
                output::print_dump_report(&report);
            }
        }
    }
    Ok(())
}

async fn run_migration_command(
    stratum: &Stratum,
    command: MigrationCommands,
    json: bool,
) -> Result<(), StratumError> {
    match command {
        MigrationCommands::List { local } => {
            let rows = stratum.list(target(local)).await?;
            if json {
                output::print_json(&rows);
            } else {
                output::print_list_table(&rows);
            }
        }
        MigrationCommands::Repair {
            status,
            versions,
            local,
        } => {
            let report = stratum.repair(target(local), status, &versions).await?;
            if json {
                output::print_json(&report);
            } else {
                output::print_repair_report(&report);
            }
        }
    }
    Ok(())
}

/// Print a formatted error message with actionable hints to stderr.
fn print_error(error: &StratumError) {
    if matches!(error, StratumError::Cancelled) {
        eprintln!("{}", "Cancelled.".yellow());
        return;
    }
    eprintln!("{} {}", "ERROR:".red().bold(), error);

    match error {
        StratumError::HistoryConflict {
            extra_local,
            extra_remote,
        } => {
            eprint!("{}", repair_suggestion(extra_local, extra_remote));
        }
        StratumError::MissingLocal { .. } => {
            eprintln!(
                "{}",
                "Hint: Run 'stratum migration repair --status reverted <version>' for each remote version, or restore the migration files."
                    .dimmed()
            );
        }
        StratumError::ConfigError(_) => {
            eprintln!(
                "{}",
                "Hint: Check your stratum.toml or set STRATUM_DB_URL / PGHOST environment variables."
                    .dimmed()
            );
        }
        StratumError::ConnectFailed { .. } | StratumError::DatabaseError(_) => {
            eprintln!(
                "{}",
                "Hint: Verify the database is running and connection details are correct.".dimmed()
            );
        }
        StratumError::NotRunning(_) => {
            eprintln!(
                "{}",
                "Hint: Start the local development stack and try again.".dimmed()
            );
        }
        StratumError::ApplyError { version, .. } => {
            eprintln!(
                "{}",
                format!("Hint: Migration {version} was rolled back; fix the file and push again.")
                    .dimmed()
            );
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_repair() {
        let cli = Cli::parse_from([
            "stratum",
            "migration",
            "repair",
            "--status",
            "reverted",
            "20230101000000",
            "20230102000000",
        ]);
        match cli.command {
            Commands::Migration(MigrationCommands::Repair {
                status,
                versions,
                local,
            }) => {
                assert_eq!(status, RepairStatus::Reverted);
                assert_eq!(versions.len(), 2);
                assert!(!local);
            }
            _ => panic!("expected migration repair"),
        }
    }

    #[test]
    fn test_repair_rejects_unknown_status() {
        assert!(Cli::try_parse_from([
            "stratum", "migration", "repair", "--status", "done", "1"
        ])
        .is_err());
    }

    #[test]
    fn test_reset_accepts_remote_alias() {
        let cli = Cli::parse_from(["stratum", "db", "reset", "--remote", "--version", "2"]);
        match cli.command {
            Commands::Db(DbCommands::Reset { version, linked }) => {
                assert!(linked);
                assert_eq!(version.as_deref(), Some("2"));
            }
            _ => panic!("expected db reset"),
        }
    }

    #[test]
    fn test_dump_options() {
        let cli = Cli::parse_from([
            "stratum",
            "db",
            "dump",
            "--data-only",
            "--use-copy",
            "-s",
            "public,app",
            "-x",
            "public.logs",
        ]);
        let Commands::Db(DbCommands::Dump(args)) = cli.command else {
            panic!("expected db dump");
        };
        let options = args.options();
        assert_eq!(options.mode, DumpMode::Data);
        assert!(options.use_copy);
        assert_eq!(options.schemas, vec!["public", "app"]);
        assert_eq!(options.excluded_tables, vec!["public.logs"]);
    }

    #[test]
    fn test_dump_rejects_data_and_roles() {
        assert!(Cli::try_parse_from(["stratum", "db", "dump", "--data-only", "--role-only"]).is_err());
    }

    #[test]
    fn test_pull_defaults() {
        let cli = Cli::parse_from(["stratum", "db", "pull"]);
        match cli.command {
            Commands::Db(DbCommands::Pull {
                name,
                schemas,
                local,
            }) => {
                assert_eq!(name, "remote_schema");
                assert!(schemas.is_empty());
                assert!(!local);
            }
            _ => panic!("expected db pull"),
        }
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(&StratumError::ConfigError("x".into())), 2);
        assert_eq!(
            exit_code(&StratumError::HistoryConflict {
                extra_local: vec![],
                extra_remote: vec!["3".into()],
            }),
            11
        );
        assert_eq!(exit_code(&StratumError::NotRunning("db".into())), 12);
        assert_eq!(
            exit_code(&StratumError::DifferError {
                exit_code: 1,
                stderr_tail: String::new(),
            }),
            13
        );
        assert_eq!(exit_code(&StratumError::Cancelled), 130);
        assert_eq!(exit_code(&StratumError::Aborted("no".into())), 1);
    }
}
