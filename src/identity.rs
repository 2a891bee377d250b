use std::{
    env,
    path::{Path, PathBuf},
};

use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub home: PathBuf,
}

/// The two identities that matter when resolving `~`: the one the process runs
/// as, and the one that invoked it through sudo (if any).
#[derive(Debug, Clone, Default)]
pub struct IdentityContext {
    pub current_home: Option<PathBuf>,
    pub original: Option<Identity>,
}

impl IdentityContext {
    pub fn from_env() -> Self {
        let original = env::var("SUDO_USER")
            .ok()
            .filter(|name| !name.is_empty())
            .and_then(|name| {
                let home = lookup_home(&name)?;
                debug!("elevated session on behalf of {name} ({})", home.display());
                Some(Identity { name, home })
            });

        Self {
            current_home: dirs::home_dir(),
            original,
        }
    }

    /// Home directory `~` refers to: the invoking user's when elevated on
    /// their behalf, otherwise the current one.
    pub fn home(&self) -> Option<&Path> {
        self.original
            .as_ref()
            .map(|id| id.home.as_path())
            .or(self.current_home.as_deref())
    }

    /// Expands a leading `~` or `~/`. Anything else is returned untouched.
    pub fn expand(&self, path: &str) -> String {
        let rest = match path.strip_prefix('~') {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
            _ => return path.to_string(),
        };

        match self.home() {
            Some(home) if rest.is_empty() => home.display().to_string(),
            Some(home) => home.join(&rest[1..]).display().to_string(),
            None => path.to_string(),
        }
    }
}

#[cfg(unix)]
fn lookup_home(name: &str) -> Option<PathBuf> {
    match nix::unistd::User::from_name(name) {
        Ok(user) => user.map(|user| user.dir),
        Err(err) => {
            debug!("passwd lookup for {name} failed: {err}");
            None
        }
    }
}

#[cfg(not(unix))]
fn lookup_home(_name: &str) -> Option<PathBuf> {
    None
}
