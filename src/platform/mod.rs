use std::path::{Path, PathBuf};

/// Environment variable that relocates the data directory.
pub const DATA_DIR_ENV: &str = "JOBRELAY_DATA_DIR";

/// Platform-specific operations abstracted behind a common interface.
/// Each OS provides its own `NativePlatform` implementation so call sites
/// remain free of `#[cfg]` blocks.
pub trait Platform {
    /// Shell binary used for agent and cron commands.
    fn default_shell() -> &'static str;

    /// Build a **tokio** `Command` that runs an inline shell string.
    fn shell_inline(command: &str) -> tokio::process::Command;

    /// Set restrictive *directory* permissions (0o700 on Unix, no-op on Windows).
    fn restrict_dir_permissions(path: &Path);

    /// Set restrictive *file* permissions (0o600 on Unix, no-op on Windows).
    fn restrict_file_permissions(path: &Path);

    /// Root data directory.
    /// Unix: `~/.jobrelay`, Windows: `%APPDATA%\jobrelay`.
    fn data_dir() -> PathBuf;
}

/// `JOBRELAY_DATA_DIR` wins over the platform default when set and non-empty.
pub fn resolve_data_dir(default: PathBuf) -> PathBuf {
    match std::env::var(DATA_DIR_ENV) {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value.trim()),
        _ => default,
    }
}

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::NativePlatform;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::NativePlatform;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_dir_falls_back_to_default() {
        // Only meaningful when the override is not set in the test env.
        if std::env::var(DATA_DIR_ENV).is_err() {
            let default = PathBuf::from("/tmp/jobrelay-default");
            assert_eq!(resolve_data_dir(default.clone()), default);
        }
    }

    #[tokio::test]
    async fn shell_inline_runs_command() {
        let output = NativePlatform::shell_inline("echo relay")
            .output()
            .await
            .unwrap();
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "relay");
    }
}
