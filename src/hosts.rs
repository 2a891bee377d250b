use std::{
    env,
    ffi::{OsStr, OsString},
    fs::{self, FileTimes},
    io::{self, Write},
    path::{Path, PathBuf},
    process::Command,
};

use tracing::{debug, info, warn};

use crate::{address::parse_ipv4, error::HostsError};

#[cfg(windows)]
pub const DEFAULT_HOSTS_PATH: &str = r"C:\Windows\System32\drivers\etc\hosts";
#[cfg(not(windows))]
pub const DEFAULT_HOSTS_PATH: &str = "/etc/hosts";

/// How the live table gets replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Privilege {
    /// The process may write the table itself.
    Elevated,
    /// Protected operations go through this helper program, e.g. `sudo`.
    Helper(String),
}

impl Privilege {
    pub fn detect() -> Self {
        #[cfg(unix)]
        {
            if nix::unistd::geteuid().is_root() {
                Self::Elevated
            } else {
                Self::Helper("sudo".to_string())
            }
        }
        #[cfg(not(unix))]
        {
            Self::Elevated
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostsChange {
    Added,
    Updated,
    Removed,
    Unchanged,
}

/// The shared name-resolution table. Every mutation reads the whole file,
/// filters it, snapshots the original to `<table>.bak` and swaps in the new
/// content with a single rename, so readers never see a half written table.
#[derive(Debug, Clone)]
pub struct HostsFile {
    path: PathBuf,
    privilege: Privilege,
    staging_dir: Option<PathBuf>,
}

impl HostsFile {
    pub fn new(path: impl Into<PathBuf>, privilege: Privilege) -> Self {
        Self {
            path: path.into(),
            privilege,
            staging_dir: None,
        }
    }

    pub fn system() -> Self {
        Self::new(DEFAULT_HOSTS_PATH, Privilege::detect())
    }

    /// Scratch directory the helper path writes the new content to before
    /// copying it next to the table.
    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = Some(dir.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> PathBuf {
        let mut backup = self.path.clone().into_os_string();
        backup.push(".bak");
        PathBuf::from(backup)
    }

    pub fn upsert(&self, ip: &str, hostname: &str) -> Result<HostsChange, HostsError> {
        let ip = parse_ipv4(ip).ok_or_else(|| HostsError::InvalidAddress(ip.to_string()))?;
        check_hostname(hostname)?;

        let original = self.read()?;
        let (mut content, found) = partition(&original, hostname);
        if found {
            info!(
                "Hostname '{hostname}' found in {}. Updating IP address...",
                self.path.display()
            );
        }

        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(&format!("{ip} {hostname}\n"));

        self.replace(&content)?;

        if found {
            info!("Updated: {ip} {hostname}");
            Ok(HostsChange::Updated)
        } else {
            info!("Added: {ip} {hostname}");
            Ok(HostsChange::Added)
        }
    }

    pub fn remove(&self, hostname: &str) -> Result<HostsChange, HostsError> {
        check_hostname(hostname)?;

        let original = self.read()?;
        let (content, found) = partition(&original, hostname);
        if !found {
            warn!("Hostname '{hostname}' not found in {}", self.path.display());
            return Ok(HostsChange::Unchanged);
        }

        self.replace(&content)?;
        info!("Removed: {hostname}");
        Ok(HostsChange::Removed)
    }

    fn read(&self) -> Result<String, HostsError> {
        fs::read_to_string(&self.path).map_err(|err| HostsError::from_io(err, &self.path))
    }

    fn table_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    fn staging_dir(&self) -> PathBuf {
        self.staging_dir.clone().unwrap_or_else(env::temp_dir)
    }

    /// `<table dir>/.<scratch name>`, on the table's filesystem so the final
    /// `mv` is a rename.
    fn sibling_of(&self, scratch: &Path) -> PathBuf {
        let mut name = OsString::from(".");
        name.push(scratch.file_name().unwrap_or_else(|| OsStr::new("hosts_new")));
        self.table_dir().join(name)
    }

    fn replace(&self, content: &str) -> Result<(), HostsError> {
        let backup = self.backup()?;
        debug!("backup written to {}", backup.display());

        let owner = owner_of(&self.path);
        let staging = match self.privilege {
            Privilege::Elevated => self.table_dir(),
            Privilege::Helper(_) => self.staging_dir(),
        };
        let mut temp = tempfile::Builder::new()
            .prefix("hosts_")
            .tempfile_in(&staging)
            .map_err(|err| HostsError::from_io(err, &staging))?;
        temp.write_all(content.as_bytes())?;
        temp.as_file().sync_all()?;

        // The temporary file is removed on every error path when its handle
        // drops. Ownership and mode are settled before the swap, so once the
        // rename happens nothing is left that can fail.
        match &self.privilege {
            Privilege::Elevated => {
                restore_ownership(temp.path(), owner)?;
                set_world_readable(temp.path())?;
                temp.persist(&self.path)
                    .map_err(|err| HostsError::from_io(err.error, &self.path))?;
            }
            Privilege::Helper(program) => {
                let scratch = temp.into_temp_path();
                let sibling = self.sibling_of(&scratch);
                let swapped = self
                    .elevate(
                        program,
                        &[OsStr::new("cp"), scratch.as_os_str(), sibling.as_os_str()],
                    )
                    .and_then(|()| self.swap_in(program, &sibling, owner));
                if let Err(err) = swapped {
                    let cleanup = self.elevate(
                        program,
                        &[OsStr::new("rm"), OsStr::new("-f"), sibling.as_os_str()],
                    );
                    if let Err(cleanup) = cleanup {
                        warn!("could not remove {}: {cleanup}", sibling.display());
                    }
                    return Err(err);
                }
            }
        }

        Ok(())
    }

    fn swap_in(
        &self,
        program: &str,
        sibling: &Path,
        owner: Option<(u32, u32)>,
    ) -> Result<(), HostsError> {
        if let Some((uid, gid)) = owner {
            let spec = format!("{uid}:{gid}");
            self.elevate(
                program,
                &[OsStr::new("chown"), OsStr::new(&spec), sibling.as_os_str()],
            )?;
        }
        self.elevate(
            program,
            &[OsStr::new("chmod"), OsStr::new("644"), sibling.as_os_str()],
        )?;
        self.elevate(
            program,
            &[OsStr::new("mv"), sibling.as_os_str(), self.path.as_os_str()],
        )
    }

    fn backup(&self) -> Result<PathBuf, HostsError> {
        let backup = self.backup_path();
        match copy_preserving(&self.path, &backup) {
            Ok(()) => Ok(backup),
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => match &self.privilege {
                Privilege::Helper(program) => {
                    self.elevate(
                        program,
                        &[
                            OsStr::new("cp"),
                            OsStr::new("-p"),
                            self.path.as_os_str(),
                            backup.as_os_str(),
                        ],
                    )?;
                    Ok(backup)
                }
                Privilege::Elevated => Err(HostsError::from_io(err, &backup)),
            },
            Err(err) => Err(HostsError::from_io(err, &self.path)),
        }
    }

    fn elevate(&self, program: &str, args: &[&OsStr]) -> Result<(), HostsError> {
        debug!("{program} {:?}", args);
        let status = Command::new(program).args(args).status().map_err(|err| {
            HostsError::PermissionDenied {
                path: self.path.clone(),
                reason: format!("could not run {program}: {err}"),
            }
        })?;

        if !status.success() {
            return Err(HostsError::PermissionDenied {
                path: self.path.clone(),
                reason: format!(
                    "{program} {} exited with {status}",
                    args.first().map(|a| a.to_string_lossy()).unwrap_or_default()
                ),
            });
        }
        Ok(())
    }
}

fn check_hostname(hostname: &str) -> Result<(), HostsError> {
    if hostname.is_empty() || hostname.contains('#') || hostname.chars().any(char::is_whitespace) {
        return Err(HostsError::InvalidHostname(hostname.to_string()));
    }
    Ok(())
}

/// True when `line` is an entry naming `hostname` as a whole token after the
/// address column. Comment lines never match.
pub fn references(line: &str, hostname: &str) -> bool {
    if line.trim_start().starts_with('#') {
        return false;
    }

    line.match_indices(hostname).any(|(at, _)| {
        let before = line[..at].chars().next_back();
        let after = line[at + hostname.len()..].chars().next();
        before.is_some_and(char::is_whitespace) && after.map_or(true, char::is_whitespace)
    })
}

/// Drops the lines referencing `hostname`, keeping everything else byte for byte.
fn partition(content: &str, hostname: &str) -> (String, bool) {
    let mut kept = String::with_capacity(content.len());
    let mut found = false;

    for line in content.split_inclusive('\n') {
        if references(line, hostname) {
            found = true;
        } else {
            kept.push_str(line);
        }
    }

    (kept, found)
}

fn copy_preserving(from: &Path, to: &Path) -> io::Result<()> {
    fs::copy(from, to)?;
    let meta = fs::metadata(from)?;
    let times = FileTimes::new()
        .set_accessed(meta.accessed()?)
        .set_modified(meta.modified()?);
    fs::File::options().write(true).open(to)?.set_times(times)
}

#[cfg(unix)]
fn owner_of(path: &Path) -> Option<(u32, u32)> {
    use std::os::unix::fs::MetadataExt;

    fs::metadata(path).ok().map(|meta| (meta.uid(), meta.gid()))
}

#[cfg(not(unix))]
fn owner_of(_path: &Path) -> Option<(u32, u32)> {
    None
}

#[cfg(unix)]
fn restore_ownership(path: &Path, owner: Option<(u32, u32)>) -> Result<(), HostsError> {
    if let Some((uid, gid)) = owner {
        std::os::unix::fs::chown(path, Some(uid), Some(gid))
            .map_err(|err| HostsError::from_io(err, path))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn restore_ownership(_path: &Path, _owner: Option<(u32, u32)>) -> Result<(), HostsError> {
    Ok(())
}

#[cfg(unix)]
fn set_world_readable(path: &Path) -> Result<(), HostsError> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(0o644))
        .map_err(|err| HostsError::from_io(err, path))
}

#[cfg(not(unix))]
fn set_world_readable(_path: &Path) -> Result<(), HostsError> {
    Ok(())
}
