//! Per-service argument files (`args/<service>`).
//!
//! One argument per line, either `--key=value` or `--key value`.

use muster_common::ClusterError;

use super::files;
use crate::paths::Paths;

/// Split a line into its key and (optional) value
pub fn parse_argument(line: &str) -> Option<(&str, Option<&str>)> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match line.find(['=', ' ', '\t']) {
        Some(idx) => {
            let value = line[idx + 1..].trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            Some((&line[..idx], Some(value)))
        }
        None => Some((line, None)),
    }
}

/// Reads and rewrites service argument files
#[derive(Debug, Clone)]
pub struct ServiceArgs {
    paths: Paths,
}

impl ServiceArgs {
    pub fn new(paths: Paths) -> Self {
        Self { paths }
    }

    /// Raw file contents; a missing file is a local state error
    pub fn read(&self, service: &str) -> Result<String, ClusterError> {
        files::read_required(&self.paths.args(service))
    }

    /// Value of `key` in `service`'s arguments
    pub fn get(&self, service: &str, key: &str) -> Result<Option<String>, ClusterError> {
        let Some(contents) = files::read_optional(&self.paths.args(service))? else {
            return Ok(None);
        };
        Ok(contents
            .lines()
            .filter_map(parse_argument)
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.unwrap_or_default().to_string()))
    }

    pub fn has(&self, service: &str, key: &str) -> Result<bool, ClusterError> {
        Ok(self.get(service, key)?.is_some())
    }

    /// Apply updates and removals.
    ///
    /// Updated keys are rewritten as `key=value`, missing keys appended,
    /// removed keys dropped. Blank lines are dropped and the file always
    /// ends with a newline.
    pub fn update(
        &self,
        service: &str,
        updates: &[(String, String)],
        removals: &[String],
    ) -> Result<(), ClusterError> {
        let path = self.paths.args(service);
        let contents = files::read_optional(&path)?.unwrap_or_default();

        let mut applied = vec![false; updates.len()];
        let mut lines: Vec<String> = Vec::new();
        for line in contents.lines() {
            let Some((key, _)) = parse_argument(line) else {
                continue;
            };
            if removals.iter().any(|r| r == key) {
                continue;
            }
            match updates.iter().position(|(k, _)| k == key) {
                Some(idx) => {
                    lines.push(format!("{}={}", updates[idx].0, updates[idx].1));
                    applied[idx] = true;
                }
                None => lines.push(line.trim_end().to_string()),
            }
        }
        for ((key, value), done) in updates.iter().zip(applied) {
            if !done && !removals.contains(key) {
                lines.push(format!("{key}={value}"));
            }
        }

        let mut rendered = lines.join("\n");
        rendered.push('\n');
        files::replace_with_backup(&path, rendered)?;
        tracing::debug!(service, updates = updates.len(), removals = removals.len(), "Service arguments updated");
        Ok(())
    }

    /// Set (`Some`) or remove (`None`) a single argument
    pub fn set(&self, service: &str, key: &str, value: Option<&str>) -> Result<(), ClusterError> {
        match value {
            Some(value) => self.update(service, &[(key.to_string(), value.to_string())], &[]),
            None => self.update(service, &[], &[key.to_string()]),
        }
    }

    /// Overwrite the whole file
    pub fn replace_all(&self, service: &str, contents: &str) -> Result<(), ClusterError> {
        files::replace_with_backup(&self.paths.args(service), contents)
    }

    /// Restore the packaged defaults for `service`
    pub fn restore_default(&self, service: &str) -> Result<(), ClusterError> {
        files::copy_with_backup(&self.paths.default_args(service), &self.paths.args(service))
    }
}
