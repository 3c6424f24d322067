//! # Repository Checkout
//!
//! Clones or fetches the configured repository and detaches the working
//! tree at the target commit. Credentials come from the files the mutator
//! mounted; the agent never sees raw Kubernetes secrets.

use anyhow::{bail, Context, Result};
use git2::{
    build::RepoBuilder, CertificateCheckStatus, Cred, CredentialType, FetchOptions, Oid,
    RemoteCallbacks, Repository,
};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Credential files mounted into the agent container
#[derive(Debug, Clone, Default)]
pub struct GitAuthFiles {
    pub token_file: Option<PathBuf>,
    pub ssh_key_file: Option<PathBuf>,
    pub known_hosts_file: Option<PathBuf>,
}

impl GitAuthFiles {
    fn token(&self) -> Option<String> {
        let path = self.token_file.as_ref()?;
        std::fs::read_to_string(path)
            .ok()
            .map(|token| token.trim().to_string())
    }
}

/// Ensure `repo_path` holds a checkout of `commit` (when known) or of the
/// commit `reference` currently points at. Returns the checked-out commit.
pub fn ensure_checkout(
    repo_url: &str,
    reference: &str,
    commit: Option<&str>,
    repo_path: &Path,
    auth: &GitAuthFiles,
) -> Result<String> {
    let repo = open_or_clone(repo_url, repo_path, auth)?;
    fetch_all(&repo, auth).context("fetching from remote")?;

    let oid = match commit {
        Some(sha) => Oid::from_str(sha).with_context(|| format!("invalid commit '{sha}'"))?,
        None => {
            let object = repo
                .revparse_single(reference)
                .with_context(|| format!("ref '{reference}' not found after fetch"))?;
            object
                .peel_to_commit()
                .with_context(|| format!("ref '{reference}' does not point at a commit"))?
                .id()
        }
    };

    if repo.find_commit(oid).is_err() {
        bail!("commit {oid} not present after fetch of '{reference}'");
    }

    repo.set_head_detached(oid)
        .with_context(|| format!("detaching HEAD at {oid}"))?;
    let mut checkout = git2::build::CheckoutBuilder::new();
    checkout.force().remove_untracked(true);
    repo.checkout_head(Some(&mut checkout))
        .with_context(|| format!("checking out {oid}"))?;

    info!(commit = %oid, reference, "checkout complete");
    Ok(oid.to_string())
}

fn open_or_clone(repo_url: &str, repo_path: &Path, auth: &GitAuthFiles) -> Result<Repository> {
    if repo_path.join(".git").exists() {
        debug!(path = %repo_path.display(), "opening existing checkout");
        return Repository::open(repo_path)
            .with_context(|| format!("opening repository at {}", repo_path.display()));
    }
    info!(url = repo_url, path = %repo_path.display(), "cloning repository");
    let mut fetch_options = FetchOptions::new();
    fetch_options.remote_callbacks(callbacks(auth.clone()));
    RepoBuilder::new()
        .fetch_options(fetch_options)
        .clone(repo_url, repo_path)
        .with_context(|| format!("cloning {repo_url}"))
}

fn fetch_all(repo: &Repository, auth: &GitAuthFiles) -> Result<()> {
    let mut remote = repo
        .find_remote("origin")
        .context("repository has no origin remote")?;
    let mut fetch_options = FetchOptions::new();
    fetch_options.remote_callbacks(callbacks(auth.clone()));
    remote.fetch(
        &[
            "+refs/heads/*:refs/remotes/origin/*",
            "+refs/tags/*:refs/tags/*",
        ],
        Some(&mut fetch_options),
        None,
    )?;
    Ok(())
}

fn callbacks(auth: GitAuthFiles) -> RemoteCallbacks<'static> {
    let mut callbacks = RemoteCallbacks::new();
    let cred_auth = auth.clone();
    callbacks.credentials(move |_url, username_from_url, allowed| {
        if allowed.contains(CredentialType::SSH_KEY) {
            if let Some(key_file) = &cred_auth.ssh_key_file {
                return Cred::ssh_key(
                    username_from_url.unwrap_or("git"),
                    None,
                    key_file,
                    None,
                );
            }
        }
        if allowed.contains(CredentialType::USER_PASS_PLAINTEXT) {
            if let Some(token) = cred_auth.token() {
                return Cred::userpass_plaintext("x-access-token", &token);
            }
        }
        Cred::default()
    });
    callbacks.certificate_check(move |cert, host| {
        let Some(known_hosts) = &auth.known_hosts_file else {
            // No pinning configured; the controller raises an advisory
            // condition for this configuration
            return Ok(CertificateCheckStatus::CertificateOk);
        };
        let Some(hostkey) = cert.as_hostkey().and_then(git2::cert::CertHostkey::hostkey)
        else {
            // Not an SSH transport; let the TLS stack decide
            return Ok(CertificateCheckStatus::CertificatePassthrough);
        };
        match hostkey_pinned(known_hosts, host, hostkey) {
            Ok(true) => Ok(CertificateCheckStatus::CertificateOk),
            Ok(false) => {
                warn!(host, "host key not present in known_hosts");
                Err(git2::Error::from_str(&format!(
                    "host key verification failed for {host}"
                )))
            }
            Err(e) => Err(git2::Error::from_str(&format!(
                "reading known_hosts: {e}"
            ))),
        }
    });
    callbacks
}

/// Whether the raw host key appears in the known_hosts file for this host.
/// Hashed (`|1|...`) entries are skipped.
fn hostkey_pinned(known_hosts: &Path, host: &str, hostkey: &[u8]) -> Result<bool> {
    use base64::Engine as _;
    let content = std::fs::read_to_string(known_hosts)
        .with_context(|| format!("reading {}", known_hosts.display()))?;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('|') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(hosts), Some(_keytype), Some(key_b64)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if !hosts.split(',').any(|entry| entry == host) {
            continue;
        }
        if let Ok(key) = base64::engine::general_purpose::STANDARD.decode(key_b64) {
            if key == hostkey {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn pinned_hostkey_matches_exact_host_entry() {
        let key = b"raw-host-key-bytes";
        let encoded = encode_b64(key);
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "# comment").expect("write");
        writeln!(file, "|1|hashed|entry ssh-ed25519 AAAA").expect("write");
        writeln!(file, "github.com,gitlab.com ssh-ed25519 {encoded}").expect("write");

        assert!(hostkey_pinned(file.path(), "github.com", key).expect("reads"));
        assert!(hostkey_pinned(file.path(), "gitlab.com", key).expect("reads"));
        assert!(!hostkey_pinned(file.path(), "example.com", key).expect("reads"));
        assert!(!hostkey_pinned(file.path(), "github.com", b"other-key").expect("reads"));
    }

    fn encode_b64(input: &[u8]) -> String {
        use base64::Engine as _;
        base64::engine::general_purpose::STANDARD.encode(input)
    }
}
