use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunnerKind {
    Pi,
    Echo,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub workspace_dir: PathBuf,
    pub database_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub runner: RunnerKind,
    pub log_level: String,
    pub telegram_bot_token: Option<String>,
    pub telegram_allowed_user_ids: Vec<String>,
}

const LOG_LEVELS: &[&str] = &["fatal", "error", "warn", "info", "debug", "trace", "silent"];

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let workspace_dir = match env_nonempty("WORKSPACE_DIR") {
            Some(raw) => expand_home(&raw)?,
            None => default_workspace()?,
        };

        let database_path = match env_nonempty("DATABASE_PATH") {
            Some(raw) => {
                let p = expand_home(&raw)?;
                if p.is_absolute() {
                    p
                } else {
                    workspace_dir.join(p)
                }
            }
            None => workspace_dir.join("jagc.sqlite"),
        };

        let host = env_nonempty("HOST").unwrap_or_else(|| crate::DEFAULT_HOST.to_string());
        let port = match env_nonempty("PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .with_context(|| format!("PORT {raw:?} is not a valid port number"))?,
            None => crate::DEFAULT_PORT,
        };

        let runner = match env_nonempty("RUNNER").as_deref() {
            None | Some("pi") => RunnerKind::Pi,
            Some("echo") => RunnerKind::Echo,
            Some(other) => anyhow::bail!("RUNNER must be `pi` or `echo`, got {other:?}"),
        };

        let log_level = env_nonempty("LOG_LEVEL").unwrap_or_else(|| "info".to_string());
        if !LOG_LEVELS.contains(&log_level.as_str()) {
            anyhow::bail!(
                "LOG_LEVEL must be one of {}, got {log_level:?}",
                LOG_LEVELS.join("|")
            );
        }

        let telegram_bot_token = env_nonempty("TELEGRAM_BOT_TOKEN");
        let telegram_allowed_user_ids = env_nonempty("TELEGRAM_ALLOWED_USER_IDS")
            .map(|raw| parse_allowed_user_ids(&raw))
            .unwrap_or_default();

        Ok(Self {
            workspace_dir,
            database_path,
            host,
            port,
            runner,
            log_level,
            telegram_bot_token,
            telegram_allowed_user_ids,
        })
    }

    /// Translate the configured level into a tracing env-filter directive.
    pub fn tracing_filter(&self) -> &'static str {
        match self.log_level.as_str() {
            "fatal" | "error" => "error",
            "warn" => "warn",
            "debug" => "debug",
            "trace" => "trace",
            "silent" => "off",
            _ => "info",
        }
    }

    /// Create the workspace and session directories, owner-only.
    pub fn ensure_workspace(&self) -> anyhow::Result<()> {
        create_private_dir(&self.workspace_dir)?;
        create_private_dir(&self.sessions_dir())?;
        if let Some(parent) = self.database_path.parent() {
            if !parent.exists() {
                create_private_dir(parent)?;
            }
        }
        Ok(())
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.workspace_dir.join("sessions")
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn default_workspace() -> anyhow::Result<PathBuf> {
    let home = dirs::home_dir().context("cannot determine home directory for WORKSPACE_DIR")?;
    Ok(home.join(".jagc"))
}

fn expand_home(raw: &str) -> anyhow::Result<PathBuf> {
    if let Some(rest) = raw.strip_prefix("~/") {
        let home = dirs::home_dir().context("cannot expand `~`: no home directory")?;
        return Ok(home.join(rest));
    }
    if raw == "~" {
        return dirs::home_dir().context("cannot expand `~`: no home directory");
    }
    Ok(PathBuf::from(raw))
}

fn create_private_dir(path: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("failed to chmod 0700 {}", path.display()))?;
    }
    Ok(())
}

/// Comma-separated numeric user ids; leading zeroes are stripped so `007`
/// and `7` compare equal.
pub fn parse_allowed_user_ids(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|part| strip_leading_zeroes(part.trim()))
        .filter(|part| !part.is_empty())
        .collect()
}

pub fn strip_leading_zeroes(id: &str) -> String {
    let trimmed = id.trim_start_matches('0');
    if trimmed.is_empty() && !id.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}
