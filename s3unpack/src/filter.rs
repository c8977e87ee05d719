//! Ignore rules that decide which archive entries are skipped instead of uploaded.
use crate::Result;
use regex::Regex;
use snafu::prelude::*;

/// An ordered set of regular expressions matched against archive entry paths.
///
/// A path is ignored if any of the expressions matches anywhere in it; the expressions are not
/// implicitly anchored, so use `^` and `$` to match whole paths.  An empty filter ignores nothing.
#[derive(Clone, Debug, Default)]
pub struct EntryFilter {
    rules: Vec<Regex>,
}

impl EntryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `pattern` as a regular expression and append it to the rules
    pub fn add_pattern(&mut self, pattern: impl AsRef<str>) -> Result<()> {
        let pattern = pattern.as_ref();
        let rule = Regex::new(pattern).with_context(|_| crate::error::InvalidIgnorePatternSnafu {
            pattern: pattern.to_string(),
        })?;

        self.rules.push(rule);

        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// The first rule that matches `path`, if any
    fn matching_rule(&self, path: &str) -> Option<&Regex> {
        self.rules.iter().find(|rule| rule.is_match(path))
    }

    /// `true` if the entry at `path` should be skipped.
    ///
    /// `path` is the entry path exactly as the archive reports it, before any normalization.
    pub fn ignore(&self, path: &str) -> bool {
        self.matching_rule(path).is_some()
    }
}
