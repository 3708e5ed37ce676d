use anyhow::Context;
use std::env;
use std::path::{Path, PathBuf};

fn home_dir() -> anyhow::Result<PathBuf> {
    // On Unix, HOME is standard; USERPROFILE covers Windows shells.
    let home = env::var_os("HOME")
        .or_else(|| env::var_os("USERPROFILE"))
        .context("neither HOME nor USERPROFILE is set")?;
    Ok(PathBuf::from(home))
}

fn ensure_dir(path: &Path) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("failed to create directory: {}", path.display()))?;
    Ok(path.to_path_buf())
}

fn cerebras_home() -> Option<PathBuf> {
    env::var_os("CEREBRAS_HOME").map(PathBuf::from)
}

pub fn config_dir() -> anyhow::Result<PathBuf> {
    if let Some(base) = cerebras_home() {
        return ensure_dir(&base.join("config"));
    }

    if let Some(xdg) = env::var_os("XDG_CONFIG_HOME").map(PathBuf::from) {
        return ensure_dir(&xdg.join("cerebras"));
    }

    ensure_dir(&home_dir()?.join(".config").join("cerebras"))
}

pub fn state_dir() -> anyhow::Result<PathBuf> {
    if let Some(base) = cerebras_home() {
        return ensure_dir(&base.join("state"));
    }

    if let Some(xdg) = env::var_os("XDG_STATE_HOME").map(PathBuf::from) {
        return ensure_dir(&xdg.join("cerebras"));
    }

    ensure_dir(&home_dir()?.join(".local").join("state").join("cerebras"))
}
