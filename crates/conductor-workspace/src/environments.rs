//! Workspace environment helpers: resource-string parsing and
//! image-aware package installation.

use conductor_core::config::EnvironmentConfig;
use conductor_core::{Error, Result};

/// Parse a human memory limit ("2g", "512m", "1024k", "2048") into bytes.
pub fn parse_memory(value: &str) -> Result<i64> {
    let trimmed = value.trim().to_ascii_lowercase();
    if trimmed.is_empty() {
        return Err(Error::Configuration("empty memory limit".into()));
    }

    let (digits, multiplier) = match trimmed.chars().last() {
        Some('k') => (&trimmed[..trimmed.len() - 1], 1024i64),
        Some('m') => (&trimmed[..trimmed.len() - 1], 1024i64 * 1024),
        Some('g') => (&trimmed[..trimmed.len() - 1], 1024i64 * 1024 * 1024),
        _ => (trimmed.as_str(), 1i64),
    };

    let number: i64 = digits
        .parse()
        .map_err(|_| Error::Configuration(format!("invalid memory limit: {value}")))?;
    if number <= 0 {
        return Err(Error::Configuration(format!(
            "memory limit must be positive: {value}"
        )));
    }
    Ok(number * multiplier)
}

/// Parse a CPU limit ("1.0", "0.5", "2") into Docker nano-CPUs.
pub fn parse_cpus(value: &str) -> Result<i64> {
    let cpus: f64 = value
        .trim()
        .parse()
        .map_err(|_| Error::Configuration(format!("invalid cpu limit: {value}")))?;
    if !cpus.is_finite() || cpus <= 0.0 {
        return Err(Error::Configuration(format!(
            "cpu limit must be positive: {value}"
        )));
    }
    Ok((cpus * 1_000_000_000.0) as i64)
}

/// Shell command installing the environment's packages, chosen by the base
/// image's package manager. `None` when there is nothing to install or the
/// image family is unrecognized.
pub fn install_command(environment: &EnvironmentConfig) -> Option<String> {
    if environment.packages.is_empty() {
        return None;
    }
    let packages = environment.packages.join(" ");
    let image = environment.image.as_str();

    if image.contains("alpine") {
        Some(format!("apk add --no-cache {packages}"))
    } else if image.contains("ubuntu") || image.contains("debian") {
        Some(format!(
            "apt-get update && apt-get install -y {packages}"
        ))
    } else if image.contains("python") {
        Some(format!("pip install {packages}"))
    } else if image.contains("node") {
        Some(format!("npm install -g {packages}"))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(image: &str, packages: &[&str]) -> EnvironmentConfig {
        EnvironmentConfig {
            name: "test".into(),
            image: image.into(),
            packages: packages.iter().map(|p| p.to_string()).collect(),
            volumes: HashMap::new(),
        }
    }

    #[test]
    fn test_parse_memory_units() {
        assert_eq!(parse_memory("2g").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory("512m").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory("64k").unwrap(), 64 * 1024);
        assert_eq!(parse_memory("4096").unwrap(), 4096);
        assert_eq!(parse_memory("2G").unwrap(), 2 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_parse_memory_rejects_garbage() {
        assert!(parse_memory("").is_err());
        assert!(parse_memory("lots").is_err());
        assert!(parse_memory("-2g").is_err());
        assert!(parse_memory("0").is_err());
    }

    #[test]
    fn test_parse_cpus() {
        assert_eq!(parse_cpus("1.0").unwrap(), 1_000_000_000);
        assert_eq!(parse_cpus("0.5").unwrap(), 500_000_000);
        assert_eq!(parse_cpus("2").unwrap(), 2_000_000_000);
        assert!(parse_cpus("zero").is_err());
        assert!(parse_cpus("-1").is_err());
    }

    #[test]
    fn test_install_command_by_image_family() {
        assert_eq!(
            install_command(&env("alpine:latest", &["git", "curl"])).unwrap(),
            "apk add --no-cache git curl"
        );
        assert_eq!(
            install_command(&env("ubuntu:22.04", &["git"])).unwrap(),
            "apt-get update && apt-get install -y git"
        );
        assert_eq!(
            install_command(&env("python:3.12-slim", &["pytest"])).unwrap(),
            "pip install pytest"
        );
        assert_eq!(
            install_command(&env("node:22", &["typescript"])).unwrap(),
            "npm install -g typescript"
        );
    }

    #[test]
    fn test_install_command_none_cases() {
        assert!(install_command(&env("alpine:latest", &[])).is_none());
        assert!(install_command(&env("scratch", &["git"])).is_none());
    }
}
