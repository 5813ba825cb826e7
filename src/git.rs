//! Git plumbing for the [`crate::updater`]'s exact-line rewrite + commit +
//! push (spec §4.9). Grounded on qovery-engine's `src/git.rs`: the same
//! `git2::RemoteCallbacks` + `authentication_callback` credential-retry loop
//! used there for `fetch`, generalized here from read-only clone to the
//! write path (stage, commit, create branch, push). Cloning the source
//! repository into a working tree is itself out of scope (spec §1 excludes
//! the Git client beyond what the Updater needs); this module assumes a
//! working tree already checked out at `project_root` and only adds commits
//! to it.

use std::path::{Path, PathBuf};

use git2::{Cred, CredentialType, Error as Git2Error, PushOptions, RemoteCallbacks, Repository, Signature};
use thiserror::Error;

use crate::errors::ErrorClass;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("{0}")]
    Git2(#[from] Git2Error),

    #[error("i/o error on `{path}`: {source}")]
    Io { path: PathBuf, #[source] source: std::io::Error },

    #[error("{file}:{line}: value `{old}` does not appear on the named line as a single token; multi-line field layouts are unsupported")]
    UnsupportedFieldLayout { file: String, line: usize, old: String },
}

impl GitError {
    pub fn class(&self) -> ErrorClass {
        match self {
            GitError::UnsupportedFieldLayout { .. } => ErrorClass::Declarative,
            GitError::Git2(_) | GitError::Io { .. } => ErrorClass::TransientInfra,
        }
    }
}

/// A working tree the Updater is allowed to mutate. Every rewrite is a
/// single-file, single-line substring substitution (spec §4.9 step 4 /
/// §9 Design Notes' documented fragility): if the current value does not
/// appear verbatim on the named line, the field's value spans more than one
/// source line and we refuse to guess, surfacing [`GitError::UnsupportedFieldLayout`]
/// rather than silently miscorrecting (spec §9's decided Open Question).
pub struct WorkingTree {
    repo: Repository,
    root: PathBuf,
}

impl WorkingTree {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, GitError> {
        let root = root.into();
        let repo = Repository::open(&root)?;
        Ok(WorkingTree { repo, root })
    }

    pub fn current_branch(&self) -> Result<String, GitError> {
        let head = self.repo.head()?;
        Ok(head.shorthand().unwrap_or("HEAD").to_string())
    }

    /// Creates `name` from the current `HEAD` if it doesn't already exist,
    /// then checks it out.
    pub fn checkout_branch(&self, name: &str) -> Result<(), GitError> {
        let head_commit = self.repo.head()?.peel_to_commit()?;
        if self.repo.find_branch(name, git2::BranchType::Local).is_err() {
            self.repo.branch(name, &head_commit, false)?;
        }
        let refname = format!("refs/heads/{name}");
        self.repo.set_head(&refname)?;
        self.repo.checkout_head(Some(git2::build::CheckoutBuilder::new().force()))?;
        Ok(())
    }

    /// Rewrites the sole occurrence of `old_value` on `line` (1-indexed) of
    /// `relative_file` to `new_value`, stages the file, and commits with
    /// `message`. Returns the new commit's oid.
    #[instrument(skip(self), fields(file = %relative_file, line, %old_value, %new_value))]
    pub fn rewrite_and_commit(
        &self,
        relative_file: &str,
        line: usize,
        old_value: &str,
        new_value: &str,
        message: &str,
    ) -> Result<git2::Oid, GitError> {
        let path = self.root.join(relative_file);
        let contents = std::fs::read_to_string(&path).map_err(|source| GitError::Io { path: path.clone(), source })?;
        let mut lines: Vec<&str> = contents.split_inclusive('\n').collect();
        let idx = line.checked_sub(1).filter(|i| *i < lines.len()).ok_or_else(|| GitError::UnsupportedFieldLayout {
            file: relative_file.to_string(),
            line,
            old: old_value.to_string(),
        })?;

        let original_line = lines[idx];
        if original_line.matches(old_value).count() != 1 {
            return Err(GitError::UnsupportedFieldLayout {
                file: relative_file.to_string(),
                line,
                old: old_value.to_string(),
            });
        }
        let rewritten_owned = original_line.replacen(old_value, new_value, 1);
        lines[idx] = &rewritten_owned;
        let new_contents = lines.concat();
        std::fs::write(&path, &new_contents).map_err(|source| GitError::Io { path: path.clone(), source })?;

        self.stage_and_commit(Path::new(relative_file), message)
    }

    fn stage_and_commit(&self, relative_path: &Path, message: &str) -> Result<git2::Oid, GitError> {
        let mut index = self.repo.index()?;
        index.add_path(relative_path)?;
        index.write()?;
        let tree_oid = index.write_tree()?;
        let tree = self.repo.find_tree(tree_oid)?;
        let signature = bot_signature()?;
        let parent = self.repo.head()?.peel_to_commit()?;
        let oid = self
            .repo
            .commit(Some("HEAD"), &signature, &signature, message, &tree, &[&parent])?;
        Ok(oid)
    }

    /// Pushes `branch` to `remote_name`, retrying credential offers exactly
    /// like qovery-engine's `authentication_callback`: each rejected
    /// attempt pops the next candidate until one matches libgit2's allowed
    /// types or the list is exhausted.
    #[instrument(skip(self, get_credentials), fields(%branch, %remote_name))]
    pub fn push(
        &self,
        branch: &str,
        remote_name: &str,
        get_credentials: &impl Fn(&str) -> Vec<(CredentialType, Cred)>,
    ) -> Result<(), GitError> {
        let mut remote = self.repo.find_remote(remote_name).or_else(|_| {
            let url = self.repo.find_remote("origin").and_then(|r| Ok(r.url().unwrap_or_default().to_string()))?;
            self.repo.remote(remote_name, &url)
        })?;

        let mut callbacks = RemoteCallbacks::new();
        callbacks.credentials(authentication_callback(get_credentials));

        let mut push_opts = PushOptions::new();
        push_opts.remote_callbacks(callbacks);

        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
        remote.push(&[refspec.as_str()], Some(&mut push_opts))?;
        Ok(())
    }
}

fn bot_signature() -> Result<Signature<'static>, GitError> {
    Signature::now("declcd-bot", "declcd-bot@users.noreply").map_err(GitError::from)
}

/// Identical retry contract to qovery-engine's `git::authentication_callback`:
/// on a remote change, refresh the candidate list from `get_credentials`,
/// then pop candidates until one matches libgit2's currently-allowed types.
fn authentication_callback(
    get_credentials: &impl Fn(&str) -> Vec<(CredentialType, Cred)>,
) -> impl FnMut(&str, Option<&str>, CredentialType) -> Result<Cred, Git2Error> + '_ {
    let mut current: (String, Vec<(CredentialType, Cred)>) = (String::new(), vec![]);
    move |remote_url, username_from_url, allowed_types| {
        if remote_url != current.0 {
            current = (remote_url.to_string(), get_credentials(username_from_url.unwrap_or("git")));
        }
        loop {
            let (cred_type, credential) = match current.1.pop() {
                Some(c) => c,
                None => {
                    let mut error = Git2Error::from_str(&format!(
                        "exhausted all available auth methods to push to {remote_url}"
                    ));
                    error.set_code(git2::ErrorCode::Auth);
                    return Err(error);
                }
            };
            if allowed_types.contains(cred_type) {
                return Ok(credential);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_repo_with_file(dir: &Path, relative: &str, contents: &str) -> Repository {
        let repo = Repository::init(dir).unwrap();
        let file_path = dir.join(relative);
        std::fs::create_dir_all(file_path.parent().unwrap()).unwrap();
        std::fs::write(&file_path, contents).unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new(relative)).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = Signature::now("test", "test@example.com").unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[]).unwrap();
        repo
    }

    #[test]
    fn rewrites_single_occurrence_and_commits() {
        let dir = tempfile::tempdir().unwrap();
        init_repo_with_file(
            dir.path(),
            "infra/app.cue",
            "chart: {\n  version: \"1.0.0\"\n}\n",
        );
        let tree = WorkingTree::open(dir.path()).unwrap();
        let oid = tree
            .rewrite_and_commit("infra/app.cue", 2, "1.0.0", "1.1.0", "chore(update): bump app to 1.1.0")
            .unwrap();
        assert_ne!(oid, git2::Oid::zero());
        let contents = std::fs::read_to_string(dir.path().join("infra/app.cue")).unwrap();
        assert!(contents.contains("1.1.0"));
        assert!(!contents.contains("1.0.0"));
    }

    #[test]
    fn ambiguous_line_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        init_repo_with_file(dir.path(), "infra/app.cue", "x: \"1.0.0\" // was 1.0.0\n");
        let tree = WorkingTree::open(dir.path()).unwrap();
        let err = tree
            .rewrite_and_commit("infra/app.cue", 1, "1.0.0", "1.1.0", "chore(update): bump app to 1.1.0")
            .unwrap_err();
        assert!(matches!(err, GitError::UnsupportedFieldLayout { .. }));
    }
}
