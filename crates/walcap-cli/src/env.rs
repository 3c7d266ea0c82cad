use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info};

/// Overrides `replication.status_interval_secs` from walcap.toml.
pub const STATUS_INTERVAL_VAR: &str = "WALCAP_STATUS_INTERVAL_SECS";

/// Load a dotenv file from the current directory or any parent directory.
///
/// Searches from the working directory up to the filesystem root and loads
/// the first `.env` (or `.env.{env}` when an environment is given) found.
/// Returns the loaded path, or `None` when there is no such file; the
/// process environment alone is then used.
pub fn load_dotenv_from_ancestors(env: Option<&str>) -> Result<Option<PathBuf>> {
    let file_name = match env {
        Some(env) => format!(".env.{}", env),
        None => ".env".to_string(),
    };
    let cwd = std::env::current_dir().context("Failed to get current directory")?;

    for dir in cwd.ancestors() {
        let env_path = dir.join(&file_name);
        if env_path.exists() {
            dotenvy::from_path(&env_path)
                .with_context(|| format!("Failed to load {}", env_path.display()))?;
            info!("Loaded {}", env_path.display());
            return Ok(Some(env_path));
        }
    }

    debug!(file = %file_name, "No dotenv file found");
    Ok(None)
}

/// Status interval set through the environment, if any.
pub fn status_interval_override() -> Result<Option<Duration>> {
    let Ok(raw) = std::env::var(STATUS_INTERVAL_VAR) else {
        return Ok(None);
    };

    let secs: u64 = raw
        .trim()
        .parse()
        .with_context(|| format!("{} must be a whole number of seconds, got '{}'", STATUS_INTERVAL_VAR, raw))?;
    if secs == 0 {
        anyhow::bail!("{} must be greater than zero", STATUS_INTERVAL_VAR);
    }
    Ok(Some(Duration::from_secs(secs)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    #[serial]
    fn test_load_dotenv_from_current_directory() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join(".env"), "TEST_VAR_CURRENT=hello").unwrap();

        let original_dir = std::env::current_dir().unwrap();
        std::env::set_current_dir(temp_dir.path()).unwrap();
        std::env::remove_var("TEST_VAR_CURRENT");

        let loaded = load_dotenv_from_ancestors(None).unwrap();
        assert!(loaded.is_some(), "Should find .env in current directory");
        assert_eq!(std::env::var("TEST_VAR_CURRENT").unwrap(), "hello");

        std::env::set_current_dir(original_dir).unwrap();
        std::env::remove_var("TEST_VAR_CURRENT");
    }

    #[test]
    #[serial]
    fn test_load_dotenv_from_grandparent_directory() {
        let grandparent_dir = TempDir::new().unwrap();
        let child_dir = grandparent_dir.path().join("parent").join("child");
        fs::create_dir_all(&child_dir).unwrap();
        fs::write(
            grandparent_dir.path().join(".env"),
            "TEST_VAR_GRANDPARENT=nested",
        )
        .unwrap();

        let original_dir = std::env::current_dir().unwrap();
        std::env::set_current_dir(&child_dir).unwrap();
        std::env::remove_var("TEST_VAR_GRANDPARENT");

        let loaded = load_dotenv_from_ancestors(None).unwrap();
        assert!(loaded.is_some(), "Should find .env in grandparent directory");
        assert_eq!(std::env::var("TEST_VAR_GRANDPARENT").unwrap(), "nested");

        std::env::set_current_dir(original_dir).unwrap();
        std::env::remove_var("TEST_VAR_GRANDPARENT");
    }

    #[test]
    #[serial]
    fn test_load_dotenv_prefers_closest_env_file() {
        let parent_dir = TempDir::new().unwrap();
        let child_dir = parent_dir.path().join("subdir");
        fs::create_dir(&child_dir).unwrap();
        fs::write(parent_dir.path().join(".env"), "TEST_VAR_CLOSEST=parent").unwrap();
        fs::write(child_dir.join(".env"), "TEST_VAR_CLOSEST=child").unwrap();

        let original_dir = std::env::current_dir().unwrap();
        std::env::set_current_dir(&child_dir).unwrap();
        std::env::remove_var("TEST_VAR_CLOSEST");

        load_dotenv_from_ancestors(None).unwrap();
        assert_eq!(
            std::env::var("TEST_VAR_CLOSEST").unwrap(),
            "child",
            "Should prefer .env in current directory over parent"
        );

        std::env::set_current_dir(original_dir).unwrap();
        std::env::remove_var("TEST_VAR_CLOSEST");
    }

    #[test]
    #[serial]
    fn test_load_named_environment() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join(".env"), "TEST_VAR_NAMED=default").unwrap();
        fs::write(temp_dir.path().join(".env.staging"), "TEST_VAR_NAMED=staging").unwrap();

        let original_dir = std::env::current_dir().unwrap();
        std::env::set_current_dir(temp_dir.path()).unwrap();
        std::env::remove_var("TEST_VAR_NAMED");

        let loaded = load_dotenv_from_ancestors(Some("staging")).unwrap().unwrap();
        assert!(loaded.ends_with(".env.staging"));
        assert_eq!(std::env::var("TEST_VAR_NAMED").unwrap(), "staging");

        std::env::set_current_dir(original_dir).unwrap();
        std::env::remove_var("TEST_VAR_NAMED");
    }

    #[test]
    #[serial]
    fn test_missing_dotenv_is_not_an_error() {
        let temp_dir = TempDir::new().unwrap();

        let original_dir = std::env::current_dir().unwrap();
        std::env::set_current_dir(temp_dir.path()).unwrap();

        let loaded = load_dotenv_from_ancestors(Some("walcap-test-nonexistent")).unwrap();
        assert!(loaded.is_none());

        std::env::set_current_dir(original_dir).unwrap();
    }

    #[test]
    #[serial]
    fn test_status_interval_override() {
        std::env::remove_var(STATUS_INTERVAL_VAR);
        assert_eq!(status_interval_override().unwrap(), None);

        std::env::set_var(STATUS_INTERVAL_VAR, "3");
        assert_eq!(
            status_interval_override().unwrap(),
            Some(Duration::from_secs(3))
        );

        std::env::set_var(STATUS_INTERVAL_VAR, "0");
        assert!(status_interval_override().is_err());

        std::env::set_var(STATUS_INTERVAL_VAR, "ten");
        assert!(status_interval_override().is_err());

        std::env::remove_var(STATUS_INTERVAL_VAR);
    }
}
