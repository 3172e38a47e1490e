//! Script verdicts and their stored text form.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classified outcome of one script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
    /// No recognizable token was observed.
    Pending,
    /// The process could not start or died before producing usable output.
    Error(String),
}

impl Verdict {
    /// Short upper-case label used in tables and SQL grouping.
    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Pass => "PASS",
            Verdict::Fail => "FAIL",
            Verdict::Pending => "PENDING",
            Verdict::Error(_) => "ERROR",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Verdict::Error(_))
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Error(reason) if !reason.is_empty() => write!(f, "ERROR: {}", reason),
            other => f.write_str(other.label()),
        }
    }
}

#[derive(Debug, Error)]
#[error("unrecognized verdict '{0}'")]
pub struct ParseVerdictError(String);

impl FromStr for Verdict {
    type Err = ParseVerdictError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PASS" => Ok(Verdict::Pass),
            "FAIL" => Ok(Verdict::Fail),
            "PENDING" => Ok(Verdict::Pending),
            "ERROR" => Ok(Verdict::Error(String::new())),
            _ => match s.strip_prefix("ERROR: ") {
                Some(reason) => Ok(Verdict::Error(reason.to_string())),
                None => Err(ParseVerdictError(s.to_string())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_parses_back() {
        for v in [
            Verdict::Pass,
            Verdict::Fail,
            Verdict::Pending,
            Verdict::Error("exit code 127".into()),
            Verdict::Error(String::new()),
        ] {
            let parsed: Verdict = v.to_string().parse().unwrap();
            assert_eq!(parsed, v);
        }
    }

    #[test]
    fn test_unknown_label_rejected() {
        assert!("MAYBE".parse::<Verdict>().is_err());
    }
}
