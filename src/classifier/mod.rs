//! Result classifier -- turns a script's free-text output into a verdict.
//!
//! Scripts report their outcome by printing a pass or fail token. The fail
//! token usually contains the pass token ("NOT-OK" contains "OK"), so every
//! line is checked for the fail token first. The last matching line wins.

pub mod verdict;

use std::sync::Arc;

use anyhow::{Context, Result};
use regex::Regex;

use crate::config::ClassifierConfig;

pub use verdict::Verdict;

/// Compiled token rules shared by every classifier of a run.
#[derive(Debug)]
pub struct ClassifierRules {
    pass_token: String,
    fail_token: String,
    noise_markers: Vec<String>,
    end_marker: Option<Regex>,
    token_pattern: Regex,
}

impl ClassifierRules {
    pub fn new(config: &ClassifierConfig) -> Result<Self> {
        if config.pass_token.is_empty() || config.fail_token.is_empty() {
            anyhow::bail!("pass and fail tokens must not be empty");
        }

        // Fail alternative first: at equal start positions the leftmost-first
        // engine prefers it, so "not-ok" never reads as "ok".
        let token_pattern = Regex::new(&format!(
            "(?i)(?:{}|{})",
            regex::escape(&config.fail_token),
            regex::escape(&config.pass_token)
        ))
        .context("failed to compile token pattern")?;

        let end_marker = if config.end_markers.is_empty() {
            None
        } else {
            let alternatives: Vec<String> = config
                .end_markers
                .iter()
                .map(|m| regex::escape(m))
                .collect();
            Some(
                Regex::new(&format!("(?i)(?:{})", alternatives.join("|")))
                    .context("failed to compile end-marker pattern")?,
            )
        };

        Ok(Self {
            pass_token: config.pass_token.clone(),
            fail_token: config.fail_token.clone(),
            noise_markers: config.noise_markers.clone(),
            end_marker,
            token_pattern,
        })
    }

    fn is_noise(&self, line: &str) -> bool {
        let trimmed = line.trim_start();
        self.noise_markers
            .iter()
            .any(|m| !m.is_empty() && trimmed.starts_with(m.as_str()))
    }

    /// Verdict stated by a single line, if any.
    pub fn match_line(&self, line: &str) -> Option<Verdict> {
        if self.is_noise(line) {
            return None;
        }
        if line.contains(&self.fail_token) {
            return Some(Verdict::Fail);
        }
        if line.contains(&self.pass_token) {
            return Some(Verdict::Pass);
        }

        let end_marker = self.end_marker.as_ref()?;
        if !end_marker.is_match(line) {
            return None;
        }
        let token = self.token_pattern.find(line)?;
        if token.as_str().eq_ignore_ascii_case(&self.fail_token) {
            Some(Verdict::Fail)
        } else {
            Some(Verdict::Pass)
        }
    }
}

/// Running verdict for one script's output stream.
#[derive(Debug)]
pub struct Classifier {
    rules: Arc<ClassifierRules>,
    current: Verdict,
}

impl Classifier {
    pub fn new(rules: Arc<ClassifierRules>) -> Self {
        Self {
            rules,
            current: Verdict::Pending,
        }
    }

    /// Feed one output line. Returns true when the line carried a verdict.
    pub fn observe(&mut self, line: &str) -> bool {
        match self.rules.match_line(line) {
            Some(v) => {
                self.current = v;
                true
            }
            None => false,
        }
    }

    pub fn current(&self) -> &Verdict {
        &self.current
    }

    /// Final verdict at end of stream. Stays `Pending` when nothing matched.
    pub fn finish(self) -> Verdict {
        self.current
    }
}

/// Classify a complete list of lines.
pub fn classify_lines<'a, I>(rules: &Arc<ClassifierRules>, lines: I) -> Verdict
where
    I: IntoIterator<Item = &'a str>,
{
    let mut classifier = Classifier::new(rules.clone());
    for line in lines {
        classifier.observe(line);
    }
    classifier.finish()
}
