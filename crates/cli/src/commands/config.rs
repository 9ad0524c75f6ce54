//! Config command - Show the effective application configuration

use super::CliResult;
use clap::Subcommand;
use rowstream::ApplicationConfig;
use std::path::{Path, PathBuf};

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommand {
    /// Print the merged configuration (defaults, file, environment)
    #[command(name = "show", about = "Show the effective configuration")]
    Show {
        /// YAML configuration file
        #[arg(long, short, value_name = "FILE")]
        config: Option<PathBuf>,
    },
}

impl ConfigCommand {
    pub fn execute(&self) -> CliResult<()> {
        match self {
            ConfigCommand::Show { config } => {
                print!("{}", render(config.as_deref())?);
                Ok(())
            }
        }
    }
}

/// Load and validate the configuration, then render it as YAML.
pub fn render(path: Option<&Path>) -> CliResult<String> {
    let config = ApplicationConfig::load(path)?;
    Ok(serde_yaml::to_string(&config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_render_merges_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.yaml");
        std::fs::write(&path, "consumer_group: billing\nauto_create_topics: false\n").unwrap();

        let yaml = render(Some(&path)).unwrap();
        let parsed: ApplicationConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.consumer_group, "billing");
        assert!(!parsed.auto_create_topics);
    }

    #[test]
    fn test_render_rejects_invalid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.yaml");
        std::fs::write(&path, "consumer_poll_timeout_ms: 0\n").unwrap();

        assert!(render(Some(&path)).is_err());
    }
}
