use crate::config::Config;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use log::info;
use std::fs::File;
use std::path::Path;

/// Load, parse and validate a configuration YAML file
pub fn load_config(config_path: &Path) -> Result<Config> {
    info!("Loading configuration from: {:?}", config_path);

    // Open the configuration file
    let file = File::open(config_path)
        .wrap_err_with(|| format!("Failed to open configuration file {:?}", config_path))?;

    // Parse the YAML content
    let config: Config = serde_yaml::from_reader(file)
        .wrap_err_with(|| format!("Failed to parse configuration file {:?}", config_path))?;

    // Validate the configuration
    config.validate()?;

    // Log what the topology section declares
    if let Some(topology) = &config.topology {
        info!(
            "Configuration declares {} nodes and {} links",
            topology.nodes.len(),
            topology.links.len()
        );
    }

    Ok(config)
}

/// Configuration used when no file is given on the command line
pub fn default_config() -> Config {
    info!("No configuration file given, using defaults");
    Config::default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_config() {
        let yaml = r#"
controller:
  state_path: "state.json"
  command_timeout: "2s"
topology:
  nodes:
    r1: 1.1.1.1
  links:
    - a: r1
      a_ip: 10.0.1.1
      b: r2
      b_ip: 10.0.1.2
      bandwidth: 10
      burst: 32
      latency: 5
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        write!(temp_file, "{}", yaml).unwrap();

        let config = load_config(temp_file.path()).unwrap();
        assert_eq!(config.controller.command_timeout, Duration::from_secs(2));
        assert_eq!(config.topology.unwrap().links.len(), 1);
    }

    #[test]
    fn test_load_config_rejects_invalid() {
        let yaml = r#"
topology:
  links:
    - a: r1
      a_ip: 10.0.1.1
      b: r2
      b_ip: 10.0.1.2
      bandwidth: -1
      burst: 32
      latency: 5
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        write!(temp_file, "{}", yaml).unwrap();

        assert!(load_config(temp_file.path()).is_err());
    }

    #[test]
    fn test_load_config_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(&dir.path().join("absent.yaml")).is_err());
    }
}
