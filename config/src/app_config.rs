use directories::{
    BaseDirs,
    ProjectDirs,
};
use std::{
    env,
    path::{
        Path,
        PathBuf,
    },
};

/// Prefix shared by every environment variable the agent reads.
pub const ENV_PREFIX: &str = "PATTOO_AGENT";

lazy_static::lazy_static! {
    static ref CONFIG_FOLDER: Option<PathBuf> = env::var(format!("{ENV_PREFIX}_CONFIG"))
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from);
}

/// Directory holding the YAML configuration files.
///
/// `PATTOO_AGENT_CONFIG` wins over the platform default.
pub fn get_config_dir() -> PathBuf {
    let directory = if let Some(s) = CONFIG_FOLDER.clone() {
        s
    } else if let Some(proj_dirs) = project_directory() {
        proj_dirs.config_local_dir().to_path_buf()
    } else {
        PathBuf::from(".").join(".config")
    };
    directory
}

fn project_directory() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "pattoo", "pattoo-agent")
}

/// Expands a leading `~` to the home directory of the current user.
pub(crate) fn expand_home(path: &str) -> PathBuf {
    let home = || BaseDirs::new().map(|dirs| dirs.home_dir().to_path_buf());
    match path.strip_prefix('~') {
        Some("") => home().unwrap_or_else(|| PathBuf::from(path)),
        Some(rest) if rest.starts_with('/') => match home() {
            Some(home) => home.join(rest.trim_start_matches('/')),
            None => PathBuf::from(path),
        },
        _ => Path::new(path).to_path_buf(),
    }
}
