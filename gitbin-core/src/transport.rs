//! Version-control transport. `GitTransport` drives the system `git`
//! binary: one bare remote per bin under `remote_location`, one working copy
//! per bin under the backup location.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use tracing::{debug, info};

use crate::config::Settings;
use crate::error::Error;

pub trait Transport {
    /// Create the remote counterpart of a freshly minted bin directory and
    /// bind the directory to it as a working copy.
    fn init_bin(&self, bin: &Path) -> Result<()>;
    /// Move a segment into a bin (copy, then remove the source). Returns
    /// the segment's path inside the bin.
    fn place(&self, segment: &Path, bin: &Path) -> Result<PathBuf>;
    /// Like `place`, always overwriting the bin's copy.
    fn replace(&self, segment: &Path, bin: &Path) -> Result<PathBuf>;
    /// Commit and push whatever changed in the bin.
    fn publish(&self, bin: &Path) -> Result<()>;
    /// Clone or update every remote bin into the restore location and copy
    /// any `manifest_name` found in them next to the clones. Returns the
    /// local mirrors.
    fn fetch_all(&self, manifest_name: &str) -> Result<Vec<PathBuf>>;
}

const DEFAULT_USER_NAME: &str = "gitbin";
const DEFAULT_USER_EMAIL: &str = "gitbin@localhost";

#[derive(Clone, Debug)]
pub struct GitTransport {
    remote_location: PathBuf,
    restore_location: PathBuf,
    naming_convention: String,
    overwrite_on_add: bool,
    user_name: String,
    user_email: String,
    /// Login for remotes, handed to git through a credential helper.
    auth: Option<(String, String)>,
}

const PASSWORD_ENV: &str = "GITBIN_GIT_PASSWORD";
const USER_ENV: &str = "GITBIN_GIT_USER";
/// Answers git's `get` request from the two variables above, so the secret
/// never appears on a command line.
const CREDENTIAL_HELPER: &str = "credential.helper=!f() { test \"$1\" = get && \
echo \"username=$GITBIN_GIT_USER\" && echo \"password=$GITBIN_GIT_PASSWORD\"; }; f";

impl GitTransport {
    pub fn new(settings: &Settings) -> Self {
        Self {
            remote_location: settings.remote_location.clone(),
            restore_location: settings.restore_location.clone(),
            naming_convention: settings.bin_naming_convention.clone(),
            overwrite_on_add: settings.overwrite_on_add,
            user_name: settings
                .git_user_name
                .clone()
                .unwrap_or_else(|| DEFAULT_USER_NAME.to_string()),
            user_email: settings
                .git_user_email
                .clone()
                .unwrap_or_else(|| DEFAULT_USER_EMAIL.to_string()),
            auth: match (&settings.git_user_name, &settings.git_password) {
                (Some(user), Some(pw)) => Some((user.clone(), pw.clone())),
                _ => None,
            },
        }
    }

    /// Extra `-c` options for commands that reach a remote.
    fn credential_args(&self) -> Vec<&'static str> {
        match self.auth {
            // The empty helper drops any configured ones first.
            Some(_) => vec!["-c", "credential.helper=", "-c", CREDENTIAL_HELPER],
            None => Vec::new(),
        }
    }

    /// Run a git command that talks to a remote.
    fn remote_git(&self, dir: Option<&Path>, args: &[&str]) -> Result<Output> {
        let mut full: Vec<&str> = self.credential_args();
        full.extend_from_slice(args);
        let env: Vec<(&str, &str)> = match &self.auth {
            Some((user, pw)) => vec![(USER_ENV, user.as_str()), (PASSWORD_ENV, pw.as_str())],
            None => Vec::new(),
        };
        run_git(dir, &full, &env)
    }

    fn remote_for(&self, bin: &Path) -> Result<PathBuf> {
        let name = bin
            .file_name()
            .ok_or_else(|| Error::Transport(format!("bin path {:?} has no name", bin)))?;
        Ok(self.remote_location.join(name))
    }

    fn copy_into(&self, segment: &Path, bin: &Path, overwrite: bool) -> Result<PathBuf> {
        let name = segment
            .file_name()
            .ok_or_else(|| Error::Transport(format!("segment path {:?} has no name", segment)))?;
        let dest = bin.join(name);
        if !overwrite && dest.exists() {
            return Err(Error::Transport(format!("{:?} already exists", dest)).into());
        }
        std::fs::copy(segment, &dest).with_context(|| format!("copy {:?} -> {:?}", segment, dest))?;
        std::fs::remove_file(segment).with_context(|| format!("remove {:?}", segment))?;
        Ok(dest)
    }
}

/// Run git with `args`, optionally inside `dir`, failing on non-zero exit.
fn git(dir: Option<&Path>, args: &[&str]) -> Result<Output> {
    run_git(dir, args, &[])
}

fn run_git(dir: Option<&Path>, args: &[&str], env: &[(&str, &str)]) -> Result<Output> {
    let mut cmd = Command::new("git");
    if let Some(d) = dir {
        cmd.arg("-C").arg(d);
    }
    cmd.args(args);
    cmd.env("GIT_TERMINAL_PROMPT", "0");
    cmd.envs(env.iter().copied());
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    debug!(?dir, ?args, "spawning git");
    let output = cmd.output().with_context(|| format!("failed to spawn git {}", args.join(" ")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Transport(format!(
            "git {} failed (status {}): {}",
            args.join(" "),
            output.status,
            stderr.trim()
        ))
        .into());
    }
    Ok(output)
}

fn path_arg(p: &Path) -> Result<&str> {
    p.to_str().ok_or_else(|| Error::Transport(format!("non-UTF-8 path {:?}", p)).into())
}

impl Transport for GitTransport {
    fn init_bin(&self, bin: &Path) -> Result<()> {
        let remote = self.remote_for(bin)?;
        std::fs::create_dir_all(&self.remote_location)
            .with_context(|| format!("create dir {:?}", self.remote_location))?;
        git(None, &["init", "--bare", "--quiet", path_arg(&remote)?])?;
        self.remote_git(None, &["clone", "--quiet", path_arg(&remote)?, path_arg(bin)?])?;
        info!(bin = %bin.display(), remote = %remote.display(), "bin initialized");
        Ok(())
    }

    fn place(&self, segment: &Path, bin: &Path) -> Result<PathBuf> {
        self.copy_into(segment, bin, self.overwrite_on_add)
    }

    fn replace(&self, segment: &Path, bin: &Path) -> Result<PathBuf> {
        self.copy_into(segment, bin, true)
    }

    fn publish(&self, bin: &Path) -> Result<()> {
        git(Some(bin), &["add", "--all"])?;
        let status = git(Some(bin), &["status", "--porcelain"])?;
        if !status.stdout.is_empty() {
            let name = format!("user.name={}", self.user_name);
            let email = format!("user.email={}", self.user_email);
            git(
                Some(bin),
                &["-c", &name, "-c", &email, "commit", "--quiet", "-m", "updating files.."],
            )?;
        }
        // A bin that never received a commit has nothing to push.
        if git(Some(bin), &["rev-parse", "--verify", "--quiet", "HEAD"]).is_err() {
            debug!(bin = %bin.display(), "no commits; skipping push");
            return Ok(());
        }
        self.remote_git(Some(bin), &["push", "--quiet", "origin", "HEAD"])?;
        info!(bin = %bin.display(), "bin published");
        Ok(())
    }

    fn fetch_all(&self, manifest_name: &str) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(&self.restore_location)
            .with_context(|| format!("create dir {:?}", self.restore_location))?;
        let mut remotes = Vec::new();
        for ent in std::fs::read_dir(&self.remote_location)
            .with_context(|| format!("read dir {:?}", self.remote_location))?
        {
            let ent = ent?;
            let name = ent.file_name().to_string_lossy().to_string();
            if ent.file_type()?.is_dir() && name.starts_with(&self.naming_convention) {
                remotes.push((name, ent.path()));
            }
        }
        remotes.sort();

        let mut mirrors = Vec::with_capacity(remotes.len());
        for (name, remote) in remotes {
            let local = self.restore_location.join(&name);
            if git(Some(&remote), &["rev-parse", "--verify", "--quiet", "HEAD"]).is_err() {
                debug!(bin = %name, "remote has no commits; skipping");
                continue;
            }
            if local.exists() {
                debug!(bin = %name, "pulling");
                self.remote_git(Some(&local), &["pull", "--quiet", "--ff-only"])?;
            } else {
                debug!(bin = %name, "cloning");
                self.remote_git(None, &["clone", "--quiet", path_arg(&remote)?, path_arg(&local)?])?;
            }
            let candidate = local.join(manifest_name);
            if candidate.exists() {
                info!(bin = %name, "restoring manifest from bin");
                let dest = self.restore_location.join(manifest_name);
                std::fs::copy(&candidate, &dest)
                    .with_context(|| format!("copy {:?} -> {:?}", candidate, dest))?;
            }
            mirrors.push(local);
        }
        Ok(mirrors)
    }
}
