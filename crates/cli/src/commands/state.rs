//! State command - Inspect and clear local state directories
//!
//! The layout on disk is `<state-dir>/<group>/<store>/<partition>`. Listing
//! opens every partition it finds, so it must not run against a directory
//! held by a live application.

use super::{CliError, CliResult};
use clap::Subcommand;
use colored::Colorize;
use rowstream::config::StateConfig;
use rowstream::state::{PartitionConfig, StateStoreManager, StorePartition};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Subcommand, Debug, Clone)]
pub enum StateCommand {
    /// List store partitions with their offsets
    #[command(name = "list", about = "List store partitions and their offsets")]
    List {
        /// Root state directory
        #[arg(long, default_value = "state", value_name = "PATH")]
        state_dir: PathBuf,

        /// Only show this consumer group
        #[arg(long, short)]
        group: Option<String>,
    },

    /// Remove all local state of a consumer group
    #[command(name = "clear", about = "Remove the local state of a consumer group")]
    Clear {
        #[arg(long, default_value = "state", value_name = "PATH")]
        state_dir: PathBuf,

        #[arg(long, short)]
        group: String,

        /// Do not ask for confirmation
        #[arg(long, short)]
        yes: bool,
    },
}

/// One store partition found on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionSummary {
    pub group: String,
    pub store: String,
    pub partition: i32,
    pub keys: usize,
    pub processed_offset: Option<i64>,
    pub changelog_offset: Option<i64>,
    pub recovery_required: bool,
}

impl StateCommand {
    pub fn execute(&self) -> CliResult<()> {
        match self {
            StateCommand::List { state_dir, group } => {
                let partitions = scan(state_dir, group.as_deref())?;
                print_partitions(&partitions);
                Ok(())
            }
            StateCommand::Clear {
                state_dir,
                group,
                yes,
            } => {
                if !yes {
                    println!(
                        "{} this deletes every store of group '{}' under {}. Re-run with --yes.",
                        "Warning:".yellow().bold(),
                        group,
                        state_dir.display()
                    );
                    return Ok(());
                }
                clear(state_dir, group)?;
                println!("{} state of group '{}' removed", "✓".green(), group);
                Ok(())
            }
        }
    }
}

/// Collect every store partition under `state_dir`, optionally for one group.
pub fn scan(state_dir: &Path, group: Option<&str>) -> CliResult<Vec<PartitionSummary>> {
    if !state_dir.is_dir() {
        return Err(CliError::InvalidInput(format!(
            "{} is not a directory",
            state_dir.display()
        )));
    }

    let mut summaries = Vec::new();
    for group_dir in subdirectories(state_dir)? {
        let group_name = file_name(&group_dir);
        if group.is_some_and(|wanted| wanted != group_name) {
            continue;
        }

        for store_dir in subdirectories(&group_dir)? {
            let store_name = file_name(&store_dir);
            for partition_dir in subdirectories(&store_dir)? {
                // anything that is not a partition number is not ours
                let Ok(partition) = file_name(&partition_dir).parse::<i32>() else {
                    continue;
                };
                debug!(path = %partition_dir.display(), "Opening store partition");
                let store = StorePartition::open(&PartitionConfig::new(&partition_dir))?;
                summaries.push(PartitionSummary {
                    group: group_name.clone(),
                    store: store_name.clone(),
                    partition,
                    keys: store.len(),
                    processed_offset: store.processed_offset()?,
                    changelog_offset: store.changelog_offset()?,
                    recovery_required: store.is_recovery_required()?,
                });
            }
        }
    }

    summaries.sort_by(|a, b| {
        (&a.group, &a.store, a.partition).cmp(&(&b.group, &b.store, b.partition))
    });
    Ok(summaries)
}

/// Remove the state of `group`.
pub fn clear(state_dir: &Path, group: &str) -> CliResult<()> {
    let config = StateConfig {
        dir: state_dir.to_path_buf(),
        ..StateConfig::default()
    };
    StateStoreManager::new(group, config).clear_stores()?;
    Ok(())
}

fn subdirectories(dir: &Path) -> CliResult<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn format_offset(offset: Option<i64>) -> String {
    offset.map_or_else(|| "-".to_string(), |o| o.to_string())
}

fn print_partitions(partitions: &[PartitionSummary]) {
    if partitions.is_empty() {
        println!("{}", "No store partitions found".dimmed());
        return;
    }

    println!(
        "{:<24} {:<24} {:>9} {:>8} {:>10} {:>10}  {}",
        "GROUP".bold(),
        "STORE".bold(),
        "PARTITION".bold(),
        "KEYS".bold(),
        "PROCESSED".bold(),
        "CHANGELOG".bold(),
        "STATUS".bold()
    );
    for p in partitions {
        let status = if p.recovery_required {
            "rebuild pending".yellow()
        } else {
            "ok".green()
        };
        println!(
            "{:<24} {:<24} {:>9} {:>8} {:>10} {:>10}  {}",
            p.group,
            p.store,
            p.partition,
            p.keys,
            format_offset(p.processed_offset),
            format_offset(p.changelog_offset),
            status
        );
    }
}
