use std::path::PathBuf;

use clap::{Parser, Subcommand};

use harbor_core::{EntityType, EntryState};

#[derive(Parser, Debug)]
#[command(
    name = "harbor-ctl",
    version,
    about = "Inspect and drive the Harbor POS sync queue",
    long_about = "Operator tool for the branch sync queue: list and inspect entries, \
                  force retries or skips, run housekeeping, or run the sync agent."
)]
pub struct Cli {
    /// Path to sync.toml (defaults to the platform config directory)
    #[arg(short, long, global = true, env = "HARBOR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug logging (RUST_LOG still wins when set)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List queue entries (pending and error by default)
    List {
        /// Only this partition
        #[arg(short, long)]
        partition: Option<String>,

        /// Only this entity type (order, partner, auxiliary_document)
        #[arg(short, long)]
        entity_type: Option<EntityType>,

        /// States to include; repeatable
        #[arg(short, long = "state")]
        states: Vec<EntryState>,

        #[arg(short, long, default_value_t = 100)]
        limit: u32,
    },

    /// Show one entry with its attempt history
    Show { id: i64 },

    /// Reset an entry to pending with a fresh attempt budget
    Retry { id: i64 },

    /// Skip an entry; it will never replicate
    Skip {
        id: i64,

        /// Why the entry is set aside (kept on the entry)
        #[arg(short, long)]
        reason: String,
    },

    /// Entry counts per partition and state
    Summary,

    /// Return entries stuck in processing to pending
    Reap {
        /// Override the configured staleness threshold
        #[arg(long)]
        stale_after_secs: Option<u64>,
    },

    /// Delete synced entries past the retention window
    Purge {
        /// Override the configured retention window
        #[arg(long)]
        older_than_days: Option<u64>,
    },

    /// Run the sync agent until Ctrl-C
    Run,
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
    fn test_list_parses_filters() {
        let cli = Cli::parse_from([
            "harbor-ctl",
            "list",
            "--partition",
            "lisbon-cloud",
            "--entity-type",
            "order",
            "--state",
            "error",
            "--state",
            "pending",
        ]);
        let Commands::List {
            partition,
            entity_type,
            states,
            limit,
        } = cli.command
        else {
            panic!("expected list");
        };
        assert_eq!(partition.as_deref(), Some("lisbon-cloud"));
        assert_eq!(entity_type, Some(EntityType::Order));
        assert_eq!(states, vec![EntryState::Error, EntryState::Pending]);
        assert_eq!(limit, 100);
    }

    #[test]
    fn test_skip_requires_reason() {
        assert!(Cli::try_parse_from(["harbor-ctl", "skip", "7"]).is_err());
        let cli = Cli::try_parse_from(["harbor-ctl", "--json", "skip", "7", "-r", "duplicate"]).unwrap();
        assert!(cli.json);
        assert!(matches!(cli.command, Commands::Skip { id: 7, .. }));
    }
}
