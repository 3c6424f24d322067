//! # Git Ref Resolver
//!
//! Resolves a declared ref (branch, tag, or SHA) to a commit with a single
//! advertise-refs exchange against the remote. No clone, no pack transfer.
//!
//! Resolution precedence for a non-SHA ref:
//! 1. annotated tag's peeled commit (`refs/tags/X^{}`)
//! 2. lightweight tag (`refs/tags/X`)
//! 3. branch head (`refs/heads/X`)
//!
//! Returning the peeled commit for annotated tags is load-bearing: the
//! agent ends up at the tag's commit after checkout, and returning the tag
//! object hash here would make the two sides disagree forever.

use git2::{CertificateCheckStatus, Cred, CredentialType, Direction, RemoteCallbacks};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Credential material already read out of secrets by the reconciler
#[derive(Debug, Clone, Default)]
pub enum GitAuthMaterial {
    /// Anonymous (public repository)
    #[default]
    None,
    /// Token auth; also used for GitHub App installation tokens
    Token { token: String },
    /// SSH key auth with optional known_hosts pinning
    Ssh {
        private_key: String,
        known_hosts: Option<String>,
    },
}

/// Successful resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Full 40-character commit SHA
    pub commit: String,
    /// The ref that actually matched (full name), or the input for SHA
    /// passthrough
    pub effective_ref: String,
}

/// Resolution failure, each variant mapping to a distinct condition reason
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("malformed repository URL '{0}'")]
    MalformedUrl(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("remote unreachable: {0}")]
    Network(String),

    #[error("ref '{reference}' not found in remote")]
    RefNotFound { reference: String },

    #[error("internal resolver error: {0}")]
    Internal(String),
}

impl ResolveError {
    /// Stable condition reason for the RefResolved=False condition
    #[must_use]
    pub fn condition_reason(&self) -> &'static str {
        match self {
            Self::MalformedUrl(_) => "MalformedRepoUrl",
            Self::Auth(_) => "AuthFailed",
            Self::Network(_) => "RemoteUnreachable",
            Self::RefNotFound { .. } => "RefNotFound",
            Self::Internal(_) => "InternalError",
        }
    }
}

/// Bound on the advertise-refs exchange
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolve a ref against a remote.
///
/// A 40-hex input short-circuits without touching the network. The git2
/// exchange is blocking, so it runs on the blocking pool under a timeout.
pub async fn resolve_ref(
    repo_url: &str,
    reference: &str,
    auth: GitAuthMaterial,
) -> Result<Resolution, ResolveError> {
    if is_full_sha(reference) {
        debug!(reference, "SHA passthrough, skipping remote exchange");
        return Ok(Resolution {
            commit: reference.to_ascii_lowercase(),
            effective_ref: reference.to_string(),
        });
    }

    let url = repo_url.to_string();
    let wanted = reference.to_string();
    let start = std::time::Instant::now();
    let task = tokio::task::spawn_blocking(move || resolve_blocking(&url, &wanted, &auth));
    let result = match tokio::time::timeout(RESOLVE_TIMEOUT, task).await {
        Err(_) => Err(ResolveError::Network(format!(
            "advertise-refs exchange timed out after {}s",
            RESOLVE_TIMEOUT.as_secs()
        ))),
        Ok(Err(join)) => Err(ResolveError::Internal(join.to_string())),
        Ok(Ok(result)) => result,
    };
    crate::observability::metrics::observe_ref_resolution_duration(start.elapsed().as_secs_f64());
    match &result {
        Ok(resolution) => {
            crate::observability::metrics::increment_ref_resolutions("resolved");
            info!(
                reference,
                commit = resolution.commit.as_str(),
                effective_ref = resolution.effective_ref.as_str(),
                "ref resolved"
            );
        }
        Err(e) => {
            crate::observability::metrics::increment_ref_resolutions(e.condition_reason());
        }
    }
    result
}

/// Whether the input is a full commit SHA
#[must_use]
pub fn is_full_sha(reference: &str) -> bool {
    reference.len() == 40 && reference.chars().all(|c| c.is_ascii_hexdigit())
}

fn resolve_blocking(
    repo_url: &str,
    reference: &str,
    auth: &GitAuthMaterial,
) -> Result<Resolution, ResolveError> {
    validate_url(repo_url)?;

    let mut remote = git2::Remote::create_detached(repo_url)
        .map_err(|e| ResolveError::MalformedUrl(format!("{repo_url}: {e}")))?;
    let connection = remote
        .connect_auth(Direction::Fetch, Some(callbacks(auth.clone())), None)
        .map_err(classify_connect_error)?;
    let advertised: Vec<(String, String)> = connection
        .list()
        .map_err(classify_connect_error)?
        .iter()
        .map(|head| (head.name().to_string(), head.oid().to_string()))
        .collect();
    select_ref(&advertised, reference)
}

/// Pick the winning ref from an advertised ref list
///
/// Pure so precedence is testable without a remote.
pub fn select_ref(
    advertised: &[(String, String)],
    reference: &str,
) -> Result<Resolution, ResolveError> {
    let lookup = |name: &str| -> Option<&str> {
        advertised
            .iter()
            .find(|(advertised_name, _)| advertised_name == name)
            .map(|(_, oid)| oid.as_str())
    };

    let candidates: Vec<(String, String)> = if reference.starts_with("refs/") {
        vec![
            (format!("{reference}^{{}}"), reference.to_string()),
            (reference.to_string(), reference.to_string()),
        ]
    } else {
        vec![
            // Annotated tag peels win over everything
            (
                format!("refs/tags/{reference}^{{}}"),
                format!("refs/tags/{reference}"),
            ),
            (
                format!("refs/tags/{reference}"),
                format!("refs/tags/{reference}"),
            ),
            (
                format!("refs/heads/{reference}"),
                format!("refs/heads/{reference}"),
            ),
        ]
    };

    for (lookup_name, effective_ref) in candidates {
        if let Some(oid) = lookup(&lookup_name) {
            return Ok(Resolution {
                commit: oid.to_string(),
                effective_ref,
            });
        }
    }
    Err(ResolveError::RefNotFound {
        reference: reference.to_string(),
    })
}

fn validate_url(repo_url: &str) -> Result<(), ResolveError> {
    let ok = repo_url.starts_with("https://")
        || repo_url.starts_with("http://")
        || repo_url.starts_with("ssh://")
        || repo_url.starts_with("git@");
    if ok && repo_url.len() > repo_url.find("://").map_or(4, |i| i + 3) {
        Ok(())
    } else {
        Err(ResolveError::MalformedUrl(repo_url.to_string()))
    }
}

fn callbacks(auth: GitAuthMaterial) -> RemoteCallbacks<'static> {
    let mut callbacks = RemoteCallbacks::new();
    let cred_auth = auth.clone();
    callbacks.credentials(move |_url, username_from_url, allowed| {
        match &cred_auth {
            GitAuthMaterial::Ssh { private_key, .. }
                if allowed.contains(CredentialType::SSH_KEY) =>
            {
                Cred::ssh_key_from_memory(
                    username_from_url.unwrap_or("git"),
                    None,
                    private_key,
                    None,
                )
            }
            GitAuthMaterial::Token { token }
                if allowed.contains(CredentialType::USER_PASS_PLAINTEXT) =>
            {
                Cred::userpass_plaintext("x-access-token", token)
            }
            _ => Cred::default(),
        }
    });
    callbacks.certificate_check(move |cert, host| {
        let known_hosts = match &auth {
            GitAuthMaterial::Ssh { known_hosts, .. } => known_hosts.as_deref(),
            _ => None,
        };
        let Some(known_hosts) = known_hosts else {
            // Pinning not configured; the reconciler raises the advisory
            // SSHHostKeyVerification condition for this case
            return Ok(CertificateCheckStatus::CertificateOk);
        };
        let Some(hostkey) = cert.as_hostkey().and_then(git2::cert::CertHostkey::hostkey)
        else {
            return Ok(CertificateCheckStatus::CertificatePassthrough);
        };
        if hostkey_pinned(known_hosts, host, hostkey) {
            Ok(CertificateCheckStatus::CertificateOk)
        } else {
            Err(git2::Error::from_str(&format!(
                "host key verification failed for {host}"
            )))
        }
    });
    callbacks
}

/// Whether the raw host key appears in the known_hosts content for this
/// host. Hashed (`|1|...`) entries are skipped.
fn hostkey_pinned(known_hosts: &str, host: &str, hostkey: &[u8]) -> bool {
    use base64::Engine as _;
    for line in known_hosts.lines() {
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
                return true;
            }
        }
    }
    false
}

fn classify_connect_error(error: git2::Error) -> ResolveError {
    let message = error.message().to_string();
    let lowered = message.to_lowercase();
    if lowered.contains("auth")
        || lowered.contains("401")
        || lowered.contains("403")
        || lowered.contains("credential")
        || error.class() == git2::ErrorClass::Ssh
    {
        return ResolveError::Auth(message);
    }
    match error.class() {
        git2::ErrorClass::Net | git2::ErrorClass::Http | git2::ErrorClass::Os => {
            ResolveError::Network(message)
        }
        git2::ErrorClass::Invalid => ResolveError::MalformedUrl(message),
        _ => ResolveError::Network(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COMMIT_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const COMMIT_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
    const TAG_OBJECT: &str = "cccccccccccccccccccccccccccccccccccccccc";

    fn advertised() -> Vec<(String, String)> {
        vec![
            ("HEAD".to_string(), COMMIT_A.to_string()),
            ("refs/heads/main".to_string(), COMMIT_A.to_string()),
            ("refs/heads/v2".to_string(), COMMIT_B.to_string()),
            ("refs/tags/v2".to_string(), TAG_OBJECT.to_string()),
            ("refs/tags/v2^{}".to_string(), COMMIT_B.to_string()),
            ("refs/tags/light".to_string(), COMMIT_A.to_string()),
        ]
    }

    #[test]
    fn annotated_tag_resolves_to_the_peeled_commit() {
        let resolution = select_ref(&advertised(), "v2").expect("resolves");
        assert_eq!(resolution.commit, COMMIT_B, "must be the peel, not the tag object");
        assert_eq!(resolution.effective_ref, "refs/tags/v2");
    }

    #[test]
    fn lightweight_tag_resolves_directly() {
        let resolution = select_ref(&advertised(), "light").expect("resolves");
        assert_eq!(resolution.commit, COMMIT_A);
        assert_eq!(resolution.effective_ref, "refs/tags/light");
    }

    #[test]
    fn branch_resolves_when_no_tag_shadows_it() {
        let resolution = select_ref(&advertised(), "main").expect("resolves");
        assert_eq!(resolution.commit, COMMIT_A);
        assert_eq!(resolution.effective_ref, "refs/heads/main");
    }

    #[test]
    fn tag_wins_over_branch_of_the_same_name() {
        // Both refs/heads/v2 and refs/tags/v2 exist; the tag takes priority
        let resolution = select_ref(&advertised(), "v2").expect("resolves");
        assert_eq!(resolution.effective_ref, "refs/tags/v2");
    }

    #[test]
    fn full_ref_names_resolve_verbatim_with_peel_preference() {
        let resolution = select_ref(&advertised(), "refs/tags/v2").expect("resolves");
        assert_eq!(resolution.commit, COMMIT_B);
        let resolution = select_ref(&advertised(), "refs/heads/main").expect("resolves");
        assert_eq!(resolution.commit, COMMIT_A);
    }

    #[test]
    fn missing_ref_is_a_distinct_error() {
        let err = select_ref(&advertised(), "nope").expect_err("must fail");
        assert!(matches!(err, ResolveError::RefNotFound { .. }));
        assert_eq!(err.condition_reason(), "RefNotFound");
    }

    #[test]
    fn full_sha_detection() {
        assert!(is_full_sha(COMMIT_A));
        assert!(!is_full_sha("abc1234"));
        assert!(!is_full_sha(&format!("{COMMIT_A}0")));
        assert!(!is_full_sha("zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz"));
    }

    #[tokio::test]
    async fn sha_passthrough_never_touches_the_network() {
        let resolution = resolve_ref("https://invalid.invalid/repo.git", COMMIT_A, GitAuthMaterial::None)
            .await
            .expect("passthrough");
        assert_eq!(resolution.commit, COMMIT_A);
        assert_eq!(resolution.effective_ref, COMMIT_A);
    }

    #[test]
    fn malformed_urls_are_rejected() {
        assert!(matches!(
            validate_url("not-a-url"),
            Err(ResolveError::MalformedUrl(_))
        ));
        assert!(validate_url("https://example.com/repo.git").is_ok());
        assert!(validate_url("git@github.com:org/repo.git").is_ok());
        assert!(validate_url("ssh://git@example.com/repo.git").is_ok());
    }
}
