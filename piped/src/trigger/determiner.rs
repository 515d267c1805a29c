use tracing::debug;

use crate::config::application::ApplicationConfig;
use crate::errors::PipedError;
use crate::filematcher::PatternMatcher;
use crate::git::Repo;
use crate::model::Application;

/// Tells whether `target_commit` of `repo` touches an application
pub struct Determiner<'a> {
    repo: &'a dyn Repo,
    target_commit: &'a str,
}

impl<'a> Determiner<'a> {
    pub fn new(repo: &'a dyn Repo, target_commit: &'a str) -> Self {
        Self { repo, target_commit }
    }

    /// `previous_commit` is the commit the application was last deployed at,
    /// empty when it never was
    pub async fn should_trigger(&self, app: &Application, previous_commit: &str) -> Result<bool, PipedError> {
        let config_path = self.repo.path().join(app.git_path.config_file_path());
        let config = ApplicationConfig::load_for(&config_path, app.kind).await?;
        let on_commit = &config.generic.trigger.on_commit;

        if on_commit.disabled {
            debug!("Trigger on commit is disabled for application {}", app.id);
            return Ok(false);
        }
        if previous_commit.is_empty() {
            debug!("Application {} has never been deployed, it will be triggered", app.id);
            return Ok(true);
        }
        if previous_commit == self.target_commit {
            return Ok(false);
        }

        let changed = self.repo.changed_files(previous_commit, self.target_commit).await?;
        let touched = touched_by_changes(&app.git_path.path, &on_commit.paths, &changed)?;
        debug!(
            "Application {} touched={} by {} files changed between {} and {}",
            app.id,
            touched,
            changed.len(),
            previous_commit,
            self.target_commit
        );
        Ok(touched)
    }
}

/// True when a changed file lives under `app_dir` or matches one of `paths`
pub fn touched_by_changes(app_dir: &str, paths: &[String], changed: &[String]) -> Result<bool, PipedError> {
    let dir = app_dir.trim_start_matches("./").trim_end_matches('/');
    if dir.is_empty() || dir == "." {
        return Ok(!changed.is_empty());
    }
    let prefix = format!("{}/", dir);
    if changed.iter().any(|f| f.starts_with(&prefix)) {
        return Ok(true);
    }
    if paths.is_empty() {
        return Ok(false);
    }
    Ok(PatternMatcher::new(paths)?.matches_any(changed))
}
