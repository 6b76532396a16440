//! Environment constants and path utilities for chatlink.
//!
//! This module centralizes the hardcoded paths, file names and environment
//! variable names used throughout the application, making them easier to
//! maintain and modify.

/// Main application directory name (hidden directory like .git, .vscode)
pub const APP_DIR_NAME: &str = ".chatlink";

/// Configuration file name inside the application directory
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Configuration file name looked up directly in the current directory
pub const LOCAL_CONFIG_FILE_NAME: &str = "chatlink.toml";

/// Credential store directory and file names
pub mod credentials {
    /// Default credential directory, relative to the working directory
    pub const DEFAULT_DIR_NAME: &str = "auth_info";

    /// Primary credential artifact
    pub const CREDS_FILE_NAME: &str = "creds.json";

    /// Suffix used for in-flight atomic writes
    pub const TEMP_SUFFIX: &str = ".tmp";

    /// Snapshot directory inside the credential directory
    pub const BACKUPS_DIR_NAME: &str = "backups";

    /// Prefix of every snapshot file name
    pub const SNAPSHOT_PREFIX: &str = "creds-";

    /// Timestamp layout embedded in snapshot names (fixed width, sorts chronologically)
    pub const SNAPSHOT_TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%6fZ";
}

/// Environment variables recognized as configuration overrides
pub mod vars {
    pub const PORT: &str = "PORT";
    pub const RETRY_MAX: &str = "RETRY_MAX";
    pub const RETRY_BASE_DELAY_MS: &str = "RETRY_BASE_DELAY_MS";
    pub const RETRY_MAX_DELAY_MS: &str = "RETRY_MAX_DELAY_MS";
    pub const BACKUP_INTERVAL_MS: &str = "BACKUP_INTERVAL_MS";
    pub const BACKUP_RETENTION: &str = "BACKUP_RETENTION";
    pub const COMMAND_PREFIX: &str = "COMMAND_PREFIX";
    pub const CREDENTIALS_DIR: &str = "CREDENTIALS_DIR";
}

/// Test-related constants
pub mod test {
    /// Chat id used by dispatcher tests
    pub const TEST_CHAT_ID: &str = "15550001111@s.chat";

    /// Broadcast/status channel id
    pub const BROADCAST_CHAT_ID: &str = "status@broadcast";
}

/// Common path utilities
use std::path::{Path, PathBuf};

/// Build the primary credential file path
pub fn creds_file_path(credentials_dir: &Path) -> PathBuf {
    credentials_dir.join(credentials::CREDS_FILE_NAME)
}

/// Build the temp file path used while atomically replacing the primary credentials
pub fn creds_temp_file_path(credentials_dir: &Path) -> PathBuf {
    credentials_dir.join(format!(
        "{}{}",
        credentials::CREDS_FILE_NAME,
        credentials::TEMP_SUFFIX
    ))
}

/// Build the snapshot directory path
pub fn backups_dir_path(credentials_dir: &Path) -> PathBuf {
    credentials_dir.join(credentials::BACKUPS_DIR_NAME)
}

/// Build a snapshot file path from its id
pub fn snapshot_file_path(credentials_dir: &Path, snapshot_id: &str, compressed: bool) -> PathBuf {
    let extension = if compressed { "json.gz" } else { "json" };
    backups_dir_path(credentials_dir).join(format!("{}.{}", snapshot_id, extension))
}

/// Build config directory path in user's home directory
pub fn user_config_dir_path(home_dir: &Path) -> PathBuf {
    home_dir.join(APP_DIR_NAME)
}

/// Build config file path in user's home directory
pub fn user_config_file_path(home_dir: &Path) -> PathBuf {
    user_config_dir_path(home_dir).join(CONFIG_FILE_NAME)
}

/// Build local config file path in current directory
pub fn local_config_file_path(current_dir: &Path) -> PathBuf {
    current_dir.join(APP_DIR_NAME).join(CONFIG_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_credential_paths() {
        let dir = Path::new("/srv/bot/auth_info");

        assert_eq!(
            creds_file_path(dir),
            Path::new("/srv/bot/auth_info/creds.json")
        );

        assert_eq!(
            creds_temp_file_path(dir),
            Path::new("/srv/bot/auth_info/creds.json.tmp")
        );

        assert_eq!(
            backups_dir_path(dir),
            Path::new("/srv/bot/auth_info/backups")
        );

        assert_eq!(
            snapshot_file_path(dir, "creds-20260101T000000000000Z", false),
            Path::new("/srv/bot/auth_info/backups/creds-20260101T000000000000Z.json")
        );

        assert_eq!(
            snapshot_file_path(dir, "creds-20260101T000000000000Z", true),
            Path::new("/srv/bot/auth_info/backups/creds-20260101T000000000000Z.json.gz")
        );
    }

    #[test]
    fn test_config_paths() {
        let home_dir = Path::new("/home/user");
        let current_dir = Path::new("/current/project");

        assert_eq!(
            user_config_file_path(home_dir),
            Path::new("/home/user/.chatlink/config.toml")
        );

        assert_eq!(
            local_config_file_path(current_dir),
            Path::new("/current/project/.chatlink/config.toml")
        );
    }
}
