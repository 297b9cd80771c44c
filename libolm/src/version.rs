//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

//! Version ranges as they appear in operator catalogs.
//!
//! `olm.skipRange` annotations and `olm.package.required` properties use the
//! range grammar of the blang semver library rather than the cargo grammar
//! understood by [`semver::VersionReq`]:
//!
//! - comparators are separated by whitespace and must all hold (`>=1.0.0 <2.0.0`)
//! - alternatives are separated by `||` and any of them may hold
//! - operators are `>`, `>=`, `<`, `<=`, `=`, `==` and `!=`; a bare version means `=`
//! - comparison uses full semver precedence, so pre-releases are ordinary points
//!   on the line (`<1.2.0-0` excludes every 1.2.0 pre-release)
//!
//! # Examples
//!
//! ```
//! use libolm::version::VersionRange;
//! use semver::Version;
//!
//! let range: VersionRange = ">=1.0.0 <1.3.0 || 2.0.0".parse().unwrap();
//! assert!(range.matches(&Version::parse("1.2.9").unwrap()));
//! assert!(range.matches(&Version::parse("2.0.0").unwrap()));
//! assert!(!range.matches(&Version::parse("1.3.0").unwrap()));
//! ```

use miette::Diagnostic;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur when parsing a version range
#[derive(Debug, Error, Diagnostic, PartialEq, Eq, Clone)]
pub enum RangeError {
    #[error("empty version range")]
    #[diagnostic(
        code(olm::range_error::empty),
        help("Provide at least one comparator, e.g. '>=1.0.0 <2.0.0'")
    )]
    Empty,

    #[error("dangling operator '{0}' in version range")]
    #[diagnostic(
        code(olm::range_error::dangling_operator),
        help("Every operator must be followed by a version")
    )]
    DanglingOperator(String),

    #[error("invalid version '{version}' in range: {reason}")]
    #[diagnostic(
        code(olm::range_error::invalid_version),
        help("Versions in ranges must be full semantic versions (MAJOR.MINOR.PATCH)")
    )]
    InvalidVersion { version: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl Op {
    fn split(token: &str) -> (Op, &str) {
        // Longest operators first so ">=" is not read as ">"
        for (prefix, op) in [
            (">=", Op::Ge),
            ("<=", Op::Le),
            ("==", Op::Eq),
            ("!=", Op::Ne),
            (">", Op::Gt),
            ("<", Op::Lt),
            ("=", Op::Eq),
        ] {
            if let Some(rest) = token.strip_prefix(prefix) {
                return (op, rest);
            }
        }
        (Op::Eq, token)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Comparator {
    op: Op,
    version: Version,
}

impl Comparator {
    fn matches(&self, v: &Version) -> bool {
        match self.op {
            Op::Eq => v == &self.version,
            Op::Ne => v != &self.version,
            Op::Gt => v > &self.version,
            Op::Ge => v >= &self.version,
            Op::Lt => v < &self.version,
            Op::Le => v <= &self.version,
        }
    }
}

/// A parsed version range: a disjunction of conjunctions of comparators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionRange {
    raw: String,
    alternatives: Vec<Vec<Comparator>>,
}

impl VersionRange {
    /// Parse a range expression
    pub fn parse(input: &str) -> Result<Self, RangeError> {
        let mut alternatives = Vec::new();
        for alternative in input.split("||") {
            let mut comparators = Vec::new();
            let mut pending_op: Option<String> = None;
            for raw in alternative.split_whitespace() {
                // Tolerate a space between an operator and its version (">= 1.0.0")
                let token = match pending_op.take() {
                    Some(op) => format!("{}{}", op, raw),
                    None => raw.to_string(),
                };
                let (op, version) = Op::split(&token);
                if version.is_empty() {
                    pending_op = Some(token.clone());
                    continue;
                }
                let version =
                    Version::parse(version).map_err(|e| RangeError::InvalidVersion {
                        version: version.to_string(),
                        reason: e.to_string(),
                    })?;
                comparators.push(Comparator { op, version });
            }
            if let Some(op) = pending_op {
                return Err(RangeError::DanglingOperator(op));
            }
            if !comparators.is_empty() {
                alternatives.push(comparators);
            }
        }
        if alternatives.is_empty() {
            return Err(RangeError::Empty);
        }
        Ok(VersionRange {
            raw: input.trim().to_string(),
            alternatives,
        })
    }

    /// Returns true if the version lies inside the range
    pub fn matches(&self, version: &Version) -> bool {
        self.alternatives
            .iter()
            .any(|all| all.iter().all(|c| c.matches(version)))
    }

    /// The range as it was written
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for VersionRange {
    type Err = RangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VersionRange::parse(s)
    }
}

impl TryFrom<String> for VersionRange {
    type Error = RangeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        VersionRange::parse(&value)
    }
}

impl From<VersionRange> for String {
    fn from(range: VersionRange) -> Self {
        range.raw
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Parse a version that may carry a leading `v`, as some CSVs do.
pub fn parse_lenient(input: &str) -> Result<Version, semver::Error> {
    let trimmed = input.trim();
    Version::parse(trimmed.strip_prefix('v').unwrap_or(trimmed))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn conjunction_of_comparators() {
        let r = VersionRange::parse(">=1.0.0 <1.3.0").unwrap();
        assert!(r.matches(&v("1.0.0")));
        assert!(r.matches(&v("1.2.99")));
        assert!(!r.matches(&v("1.3.0")));
        assert!(!r.matches(&v("0.9.0")));
    }

    #[test]
    fn prerelease_upper_bound_excludes_prereleases() {
        let r = VersionRange::parse(">=4.1.0 <4.2.0-0").unwrap();
        assert!(r.matches(&v("4.1.7")));
        assert!(!r.matches(&v("4.2.0-alpha")));
        assert!(!r.matches(&v("4.2.0")));
    }

    #[test]
    fn alternatives_and_bare_versions() {
        let r = VersionRange::parse("<0.5.0 || 1.0.0 || !=2.0.0 >1.5.0").unwrap();
        assert!(r.matches(&v("0.4.0")));
        assert!(r.matches(&v("1.0.0")));
        assert!(r.matches(&v("2.1.0")));
        assert!(!r.matches(&v("2.0.0")));
        assert!(!r.matches(&v("1.2.0")));
    }

    #[test]
    fn operator_separated_from_version() {
        let r = VersionRange::parse(">= 1.0.0 < 2.0.0").unwrap();
        assert!(r.matches(&v("1.5.0")));
        assert!(!r.matches(&v("2.0.0")));
    }

    #[test]
    fn rejects_malformed_ranges() {
        assert_eq!(VersionRange::parse("  "), Err(RangeError::Empty));
        assert!(matches!(
            VersionRange::parse(">=1.0"),
            Err(RangeError::InvalidVersion { .. })
        ));
        assert_eq!(
            VersionRange::parse(">=1.0.0 <"),
            Err(RangeError::DanglingOperator("<".to_string()))
        );
    }

    #[test]
    fn serde_uses_the_written_form() {
        let r: VersionRange = serde_json::from_str("\">=1.0.0 <2.0.0\"").unwrap();
        assert_eq!(r.as_str(), ">=1.0.0 <2.0.0");
        assert_eq!(serde_json::to_string(&r).unwrap(), "\">=1.0.0 <2.0.0\"");
    }

    #[test]
    fn lenient_parse_strips_v_prefix() {
        assert_eq!(parse_lenient("v1.2.3").unwrap(), v("1.2.3"));
        assert_eq!(parse_lenient("1.2.3").unwrap(), v("1.2.3"));
    }
}
