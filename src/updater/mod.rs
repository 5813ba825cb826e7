//! Discovers newer remote artifact versions for `@update`-annotated fields
//! and rewrites the declarative source with commit (+ push) (spec §4.9).
//! Grounded on `paritytech-cargo-unleash`'s release workflow (`src/util.rs`'s
//! `edit_each`/`edit_each_dep`: locate a manifest field, mutate it in place,
//! write the file back) generalized from editing `Cargo.toml` dependency
//! tables to rewriting a single source line of a `.cue` package file, and on
//! qovery-engine's `git.rs` for the commit/push mechanics (`src/git.rs`,
//! adapted in [`crate::git`]).

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use retry::delay::Exponential;
use semver::{Version, VersionReq};
use thiserror::Error;

use crate::chart::fetcher::{Credential, RepoIndex};
use crate::errors::ErrorClass;
use crate::git::{GitError, WorkingTree};
use crate::model::{IntegrationMode, UpdateInstruction, UpdateStrategy, UpdateTarget};

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error(transparent)]
    Git(#[from] GitError),

    #[error("registry request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("secret `{0}` referenced by @update auth not found in namespace `{1}`")]
    SecretNotFound(String, String),

    #[error("secret `{0}` is missing a `{1}` key")]
    SecretMissingKey(String, &'static str),

    #[error("malformed constraint `{0}`: {1}")]
    InvalidConstraint(String, #[source] semver::Error),

    #[error("current version `{0}` on `{1}` is not valid semver")]
    InvalidCurrentVersion(String, String),

    #[error("malformed repository index: {0}")]
    MalformedIndex(#[from] serde_yaml::Error),

    #[error("malformed tag list response: {0}")]
    MalformedTagList(#[from] serde_json::Error),

    #[error("image reference `{0}` could not be parsed")]
    InvalidImageReference(String),

    #[error("opening pull request failed: {0}")]
    PullRequest(String),
}

impl UpdateError {
    pub fn class(&self) -> ErrorClass {
        match self {
            UpdateError::SecretNotFound(..) | UpdateError::SecretMissingKey(..) => ErrorClass::Security,
            UpdateError::InvalidConstraint(..)
            | UpdateError::InvalidCurrentVersion(..)
            | UpdateError::InvalidImageReference(_) => ErrorClass::Declarative,
            UpdateError::Git(e) => e.class(),
            UpdateError::Http(_) | UpdateError::MalformedIndex(_) | UpdateError::MalformedTagList(_) => {
                ErrorClass::TransientInfra
            }
            UpdateError::PullRequest(_) => ErrorClass::TransientInfra,
        }
    }
}

/// External collaborator for opening pull requests (spec §1 excludes any
/// concrete VCS hosting API; this is an interface-only contract exactly like
/// [`crate::decl_compiler::DeclCompiler`]'s external binary). `integration =
/// pr` instructions require a client to be configured; `direct` never calls
/// this trait.
#[async_trait]
pub trait PullRequestClient: Send + Sync {
    async fn open_pull_request(&self, branch: &str, base: &str, title: &str, body: &str) -> Result<(), UpdateError>;
}

/// One committed version bump, returned per instruction that produced a commit.
#[derive(Debug, Clone)]
pub struct CommittedUpdate {
    pub file: String,
    pub line: usize,
    pub new_version: String,
    pub commit_hash: String,
}

/// Extends `(current, candidates) -> Option<newest-strictly-greater>` so
/// alternate strategies can be added later without touching the driver loop
/// (spec §4.9: "the design allows adding further strategies by implementing
/// a `has_newer_remote_version` contract"). `Semver` is the only strategy
/// implemented today.
pub trait UpdateStrategyImpl {
    fn has_newer_remote_version<'a>(
        &self,
        current: &str,
        constraint: &str,
        candidates: impl Iterator<Item = &'a str>,
    ) -> Result<Option<String>, UpdateError>;
}

pub struct SemverStrategy;

impl UpdateStrategyImpl for SemverStrategy {
    fn has_newer_remote_version<'a>(
        &self,
        current: &str,
        constraint: &str,
        candidates: impl Iterator<Item = &'a str>,
    ) -> Result<Option<String>, UpdateError> {
        let current_version = Version::parse(current.trim_start_matches('v'))
            .map_err(|_| UpdateError::InvalidCurrentVersion(current.to_string(), constraint.to_string()))?;
        let req = VersionReq::parse(constraint).map_err(|e| UpdateError::InvalidConstraint(constraint.to_string(), e))?;

        let best = candidates
            .filter_map(|c| Version::parse(c.trim_start_matches('v')).ok())
            .filter(|v| req.matches(v))
            .max();

        Ok(match best {
            Some(best) if best > current_version => Some(best.to_string()),
            _ => None,
        })
    }
}

fn strategy_for(strategy: UpdateStrategy) -> SemverStrategy {
    match strategy {
        UpdateStrategy::Semver => SemverStrategy,
    }
}

pub struct Updater {
    http: reqwest::Client,
    kube: kube::Client,
    project_root: PathBuf,
    remote_name: String,
    tracked_branch: String,
    vcs: Option<Arc<dyn PullRequestClient>>,
}

impl Updater {
    pub fn new(
        http: reqwest::Client,
        kube: kube::Client,
        project_root: impl Into<PathBuf>,
        remote_name: impl Into<String>,
        tracked_branch: impl Into<String>,
        vcs: Option<Arc<dyn PullRequestClient>>,
    ) -> Self {
        Updater {
            http,
            kube,
            project_root: project_root.into(),
            remote_name: remote_name.into(),
            tracked_branch: tracked_branch.into(),
            vcs,
        }
    }

    /// Runs every update instruction to completion: discover (async, over
    /// the network), decide, rewrite + commit (sync, via `git2`), then push
    /// each touched branch exactly once (spec §4.9 step 5). `direct`
    /// instructions land on the tracked branch; `pr` instructions share one
    /// freshly created branch per run, pushed and opened as a single pull
    /// request summarizing every bump it carries.
    #[instrument(skip(self, instructions), fields(count = instructions.len()))]
    pub async fn run(
        &self,
        instructions: &[UpdateInstruction],
        get_credentials: &impl Fn(&str) -> Vec<(git2::CredentialType, git2::Cred)>,
    ) -> Result<Vec<CommittedUpdate>, UpdateError> {
        let mut direct_bumps = Vec::new();
        let mut pr_bumps = Vec::new();

        for instruction in instructions {
            if let Some(decision) = self.decide(instruction).await? {
                match instruction.integration {
                    IntegrationMode::Direct => direct_bumps.push(decision),
                    IntegrationMode::Pr => pr_bumps.push(decision),
                }
            }
        }

        let mut committed = Vec::new();

        if !direct_bumps.is_empty() {
            let tree = WorkingTree::open(&self.project_root)?;
            tree.checkout_branch(&self.tracked_branch)?;
            for bump in &direct_bumps {
                committed.push(self.commit_one(&tree, bump)?);
            }
            tree.push(&self.tracked_branch, &self.remote_name, get_credentials)?;
        }

        if !pr_bumps.is_empty() {
            let branch = format!("declcd-update/{}", short_summary_token(&pr_bumps));
            let tree = WorkingTree::open(&self.project_root)?;
            tree.checkout_branch(&branch)?;
            for bump in &pr_bumps {
                committed.push(self.commit_one(&tree, bump)?);
            }
            tree.push(&branch, &self.remote_name, get_credentials)?;

            if let Some(vcs) = &self.vcs {
                let title = format!("chore(update): bump {} component(s)", pr_bumps.len());
                let body = pr_bumps
                    .iter()
                    .map(|b| format!("- `{}` -> `{}`", b.target_label, b.new_version))
                    .collect::<Vec<_>>()
                    .join("\n");
                vcs.open_pull_request(&branch, &self.tracked_branch, &title, &body).await?;
            }
        }

        Ok(committed)
    }

    /// Determines whether `instruction` has a newer satisfying remote
    /// version, returning `None` when no commit should be produced (spec
    /// §4.9 step 4's guard, and P5).
    async fn decide(&self, instruction: &UpdateInstruction) -> Result<Option<PendingBump>, UpdateError> {
        let strategy = strategy_for(instruction.strategy);

        let (current, candidates, target_label) = match &instruction.target {
            UpdateTarget::ContainerImage { image, .. } => {
                let parsed = parse_image_reference(image)?;
                let credential = self.resolve_credential(instruction).await?;
                let tags = self.list_oci_tags(&parsed.registry, &parsed.repository, &credential).await?;
                (parsed.tag, tags, image.clone())
            }
            UpdateTarget::ChartVersion { chart } => {
                let (current, _digest) = chart.version_and_digest();
                let credential = self.resolve_credential(instruction).await?;
                let versions = if let Some(rest) = chart.repo_url.strip_prefix("oci://") {
                    let (registry, repository) = rest.split_once('/').unwrap_or((rest, ""));
                    self.list_oci_tags(registry, repository, &credential).await?
                } else {
                    self.list_http_chart_versions(&chart.repo_url, &chart.name, &credential).await?
                };
                (current.to_string(), versions, chart.name.clone())
            }
        };

        let newer = strategy.has_newer_remote_version(&current, &instruction.constraint, candidates.iter().map(String::as_str))?;
        let Some(new_version) = newer else { return Ok(None) };

        Ok(Some(PendingBump {
            file: instruction.file.clone(),
            line: instruction.line,
            old_value: current,
            new_version,
            target_label,
        }))
    }

    fn commit_one(&self, tree: &WorkingTree, bump: &PendingBump) -> Result<CommittedUpdate, UpdateError> {
        let message = format!("chore(update): bump {} to {}", bump.target_label, bump.new_version);
        let oid = tree.rewrite_and_commit(&bump.file, bump.line, &bump.old_value, &bump.new_version, &message)?;
        Ok(CommittedUpdate {
            file: bump.file.clone(),
            line: bump.line,
            new_version: bump.new_version.clone(),
            commit_hash: oid.to_string(),
        })
    }

    async fn resolve_credential(&self, instruction: &UpdateInstruction) -> Result<Credential, UpdateError> {
        let Some(secret_ref) = &instruction.auth else { return Ok(Credential::Anonymous) };
        // Update-instruction secrets live in the controller's own namespace
        // rather than a per-release target namespace, since an instruction
        // is attached to a source field, not a deployed release.
        let api: Api<Secret> = Api::default_namespaced(self.kube.clone());
        let secret = api
            .get(secret_ref)
            .await
            .map_err(|_| UpdateError::SecretNotFound(secret_ref.clone(), "default".to_string()))?;
        let data = secret.data.unwrap_or_default();
        if let Some(token) = data.get("token") {
            return Ok(Credential::Bearer(String::from_utf8_lossy(&token.0).into_owned()));
        }
        let username = data.get("username").ok_or(UpdateError::SecretMissingKey(secret_ref.clone(), "username"))?;
        let password = data.get("password").ok_or(UpdateError::SecretMissingKey(secret_ref.clone(), "password"))?;
        Ok(Credential::Basic {
            username: String::from_utf8_lossy(&username.0).into_owned(),
            password: String::from_utf8_lossy(&password.0).into_owned(),
        })
    }

    async fn list_oci_tags(&self, registry: &str, repository: &str, credential: &Credential) -> Result<Vec<String>, UpdateError> {
        let url = format!("https://{registry}/v2/{repository}/tags/list");
        let mut backoff = Exponential::from_millis(200).take(3);
        loop {
            let mut req = self.http.get(&url);
            req = match credential {
                Credential::Anonymous => req,
                Credential::Bearer(token) => req.bearer_auth(token),
                Credential::Basic { username, password } => req.basic_auth(username, Some(password)),
            };
            match req.send().await {
                Ok(resp) if resp.status().is_server_error() || resp.status().as_u16() == 429 => match backoff.next() {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => return Err(resp.error_for_status().unwrap_err().into()),
                },
                Ok(resp) => {
                    let resp = resp.error_for_status()?;
                    let body: TagList = resp.json().await?;
                    return Ok(body.tags);
                }
                Err(e) if e.is_connect() || e.is_timeout() => match backoff.next() {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => return Err(e.into()),
                },
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn list_http_chart_versions(&self, repo_url: &str, name: &str, credential: &Credential) -> Result<Vec<String>, UpdateError> {
        let index_url = format!("{}/index.yaml", repo_url.trim_end_matches('/'));
        let mut req = self.http.get(&index_url);
        req = match credential {
            Credential::Anonymous => req,
            Credential::Bearer(token) => req.bearer_auth(token),
            Credential::Basic { username, password } => req.basic_auth(username, Some(password)),
        };
        let body = req.send().await?.error_for_status()?.text().await?;
        let index: RepoIndex = serde_yaml::from_str(&body)?;
        Ok(index
            .entries
            .get(name)
            .map(|versions| versions.iter().map(|v| v.version.clone()).collect())
            .unwrap_or_default())
    }
}

#[derive(Debug, serde::Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Vec<String>,
}

struct PendingBump {
    file: String,
    line: usize,
    old_value: String,
    new_version: String,
    target_label: String,
}

fn short_summary_token(bumps: &[PendingBump]) -> String {
    bumps
        .first()
        .map(|b| b.target_label.replace(['/', ':', '@'], "-"))
        .unwrap_or_else(|| "batch".to_string())
}

struct ParsedImage {
    registry: String,
    repository: String,
    tag: String,
}

/// Splits an image reference into registry host, repository path, and tag,
/// the equivalent of the original system's `parsers.ParseImageName` (spec
/// §4.9 step 1). Defaults to Docker Hub's registry and the `library/`
/// namespace when the reference carries neither, and to the `latest` tag
/// when none is given.
fn parse_image_reference(image: &str) -> Result<ParsedImage, UpdateError> {
    let last_slash = image.rfind('/');
    let last_colon = image.rfind(':');

    let (name_part, tag) = match last_colon {
        Some(idx) if last_slash.map(|s| idx > s).unwrap_or(true) => (&image[..idx], image[idx + 1..].to_string()),
        _ => (image, "latest".to_string()),
    };
    if name_part.is_empty() {
        return Err(UpdateError::InvalidImageReference(image.to_string()));
    }

    let (registry, repository) = match name_part.split_once('/') {
        Some((first, rest)) if first.contains('.') || first.contains(':') || first == "localhost" => {
            (first.to_string(), rest.to_string())
        }
        Some(_) => ("registry-1.docker.io".to_string(), name_part.to_string()),
        None => ("registry-1.docker.io".to_string(), format!("library/{name_part}")),
    };

    Ok(ParsedImage { registry, repository, tag })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fully_qualified_image_reference() {
        let parsed = parse_image_reference("ghcr.io/acme/app:1.14.2").unwrap();
        assert_eq!(parsed.registry, "ghcr.io");
        assert_eq!(parsed.repository, "acme/app");
        assert_eq!(parsed.tag, "1.14.2");
    }

    #[test]
    fn defaults_to_docker_hub_library_namespace() {
        let parsed = parse_image_reference("redis:7.2.4").unwrap();
        assert_eq!(parsed.registry, "registry-1.docker.io");
        assert_eq!(parsed.repository, "library/redis");
        assert_eq!(parsed.tag, "7.2.4");
    }

    #[test]
    fn defaults_tag_to_latest_when_absent() {
        let parsed = parse_image_reference("acme/app").unwrap();
        assert_eq!(parsed.tag, "latest");
        assert_eq!(parsed.repository, "acme/app");
    }

    #[test]
    fn semver_strategy_picks_greatest_satisfying_version_scenario_5() {
        let strategy = SemverStrategy;
        let candidates = ["1.14.3", "1.15.0", "notsemver", "1.2.6", "3.6.4", "2.0.0"];
        let newer = strategy
            .has_newer_remote_version("1.14.2", "<=1.15.3, >=1.4", candidates.iter().copied())
            .unwrap();
        assert_eq!(newer, Some("1.15.0".to_string()));
    }

    #[test]
    fn semver_strategy_is_a_no_op_when_constraint_excludes_all_candidates_scenario_6() {
        let strategy = SemverStrategy;
        let candidates = ["1.14.3", "1.15.0", "notsemver", "1.2.6", "3.6.4", "2.0.0"];
        let newer = strategy
            .has_newer_remote_version("1.14.2", "<1.1.3", candidates.iter().copied())
            .unwrap();
        assert_eq!(newer, None);
    }

    #[test]
    fn semver_strategy_is_a_no_op_when_nothing_is_strictly_greater() {
        let strategy = SemverStrategy;
        let candidates = ["4.9.9", "4.0.0"];
        let newer = strategy.has_newer_remote_version("4.9.9", "<5.0.0", candidates.iter().copied()).unwrap();
        assert_eq!(newer, None);
    }
}
