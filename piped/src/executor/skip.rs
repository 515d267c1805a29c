use crate::config::stage::SkipOptions;
use crate::errors::PipedError;
use crate::filematcher::PatternMatcher;

/// Whether a stage configured with `options` should be skipped for a commit
/// with `commit_message` changing `changed_files` since the running commit.
///
/// Either condition is enough. The path condition needs at least one changed
/// file and every changed file matching a pattern.
pub fn check_skip<S: AsRef<str>>(
    options: &SkipOptions,
    changed_files: &[S],
    commit_message: &str,
) -> Result<bool, PipedError> {
    if options.is_empty() {
        return Ok(false);
    }
    if !options.commit_message_prefix.is_empty()
        && commit_message.starts_with(&options.commit_message_prefix)
    {
        return Ok(true);
    }
    if options.paths.is_empty() || changed_files.is_empty() {
        return Ok(false);
    }
    let matcher = PatternMatcher::new(&options.paths)?;
    Ok(changed_files.iter().all(|f| matcher.matches(f.as_ref())))
}
