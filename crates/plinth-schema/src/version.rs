//! Version model: semantic versions and constraint algebra.
//!
//! Versions are plain [`semver::Version`] values. Constraints are parsed from
//! the grammar below and evaluated as pure predicates:
//!
//! | Form                | Meaning                                   |
//! |---------------------|-------------------------------------------|
//! | `1.2.3`, `=1.2.3`   | exactly that version                      |
//! | `>=1.2.3`           | at least that version                     |
//! | `^1.2.3`            | `>=1.2.3, <2.0.0` (first nonzero pinned)  |
//! | `~1.2.3`            | `>=1.2.3, <1.3.0`                         |
//! | `*`, `1.*`, `1.2.*` | wildcard                                  |
//! | `>=1.0.0, <2.0.0`   | explicit range                            |
//!
//! Pre-release versions only ever match an exact pin; writing a pre-release
//! into any other form is rejected rather than half-honored.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::str::FromStr;

pub use semver::Version;

use crate::error::ParseError;

/// Parse a full semantic version (`major.minor.patch[-pre][+build]`).
///
/// # Errors
///
/// Returns [`ParseError::Version`] if `input` is not valid `SemVer`.
pub fn parse_version(input: &str) -> Result<Version, ParseError> {
    Version::parse(input.trim()).map_err(|e| ParseError::version(input, e.to_string()))
}

/// Parse a constraint expression.
///
/// # Errors
///
/// Returns [`ParseError::Constraint`] for anything outside the grammar.
pub fn parse_constraint(input: &str) -> Result<VersionConstraint, ParseError> {
    input.parse()
}

/// Total order over versions (build metadata is only a tiebreaker).
pub fn compare(a: &Version, b: &Version) -> Ordering {
    a.cmp(b)
}

/// Whether `version` satisfies `constraint`.
pub fn satisfies(version: &Version, constraint: &VersionConstraint) -> bool {
    constraint.matches(version)
}

/// The highest version in `versions` that satisfies `constraint`.
pub fn highest_satisfying<'a, I>(versions: I, constraint: &VersionConstraint) -> Option<&'a Version>
where
    I: IntoIterator<Item = &'a Version>,
{
    versions
        .into_iter()
        .filter(|v| constraint.matches(v))
        .max_by(|a, b| compare(a, b))
}

/// `SemVer` precedence: ignores build metadata entirely.
fn precedence(a: &Version, b: &Version) -> Ordering {
    (a.major, a.minor, a.patch)
        .cmp(&(b.major, b.minor, b.patch))
        .then_with(|| a.pre.cmp(&b.pre))
}

/// A version with possibly missing trailing components, as written after
/// `^`, `~`, or before `.*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PartialVersion {
    /// Major component (always present).
    pub major: u64,
    /// Minor component, if written.
    pub minor: Option<u64>,
    /// Patch component, if written.
    pub patch: Option<u64>,
}

impl PartialVersion {
    fn parse(input: &str, text: &str) -> Result<Self, ParseError> {
        let mut parts = text.split('.');
        let major = parse_component(input, parts.next().unwrap_or(""))?;
        let minor = parts.next().map(|p| parse_component(input, p)).transpose()?;
        let patch = parts.next().map(|p| parse_component(input, p)).transpose()?;
        if parts.next().is_some() {
            return Err(ParseError::constraint(input, "too many version components"));
        }
        Ok(Self {
            major,
            minor,
            patch,
        })
    }

    /// Lowest version this partial version denotes (missing parts are zero).
    pub fn floor(&self) -> Version {
        Version::new(self.major, self.minor.unwrap_or(0), self.patch.unwrap_or(0))
    }
}

impl std::fmt::Display for PartialVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.major)?;
        if let Some(minor) = self.minor {
            write!(f, ".{minor}")?;
            if let Some(patch) = self.patch {
                write!(f, ".{patch}")?;
            }
        }
        Ok(())
    }
}

fn parse_component(input: &str, part: &str) -> Result<u64, ParseError> {
    if part.contains(['-', '+']) {
        return Err(ParseError::constraint(
            input,
            "pre-release and build metadata are only allowed in exact pins",
        ));
    }
    if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
        return Err(ParseError::constraint(
            input,
            format!("'{part}' is not a version number"),
        ));
    }
    if part.len() > 1 && part.starts_with('0') {
        return Err(ParseError::constraint(
            input,
            format!("'{part}' has a leading zero"),
        ));
    }
    part.parse()
        .map_err(|_| ParseError::constraint(input, format!("'{part}' is out of range")))
}

/// Comparison operator in an explicit range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// `=`
    Eq,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `<`
    Lt,
    /// `<=`
    Le,
}

impl Op {
    fn as_str(self) -> &'static str {
        match self {
            Op::Eq => "=",
            Op::Gt => ">",
            Op::Ge => ">=",
            Op::Lt => "<",
            Op::Le => "<=",
        }
    }
}

/// One `op version` term of an explicit range.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Comparator {
    /// Operator.
    pub op: Op,
    /// Operand.
    pub version: Version,
}

impl Comparator {
    fn parse(input: &str, term: &str) -> Result<Self, ParseError> {
        let term = term.trim();
        let (op, rest) = if let Some(r) = term.strip_prefix(">=") {
            (Op::Ge, r)
        } else if let Some(r) = term.strip_prefix("<=") {
            (Op::Le, r)
        } else if let Some(r) = term.strip_prefix('>') {
            (Op::Gt, r)
        } else if let Some(r) = term.strip_prefix('<') {
            (Op::Lt, r)
        } else if let Some(r) = term.strip_prefix('=') {
            (Op::Eq, r)
        } else {
            return Err(ParseError::constraint(
                input,
                format!("range term '{term}' must start with an operator"),
            ));
        };
        let version = Version::parse(rest.trim())
            .map_err(|e| ParseError::constraint(input, format!("'{}': {e}", rest.trim())))?;
        if !version.pre.is_empty() || !version.build.is_empty() {
            return Err(ParseError::constraint(
                input,
                "pre-release and build metadata are only allowed in exact pins",
            ));
        }
        Ok(Self { op, version })
    }

    fn matches(&self, v: &Version) -> bool {
        let ord = precedence(v, &self.version);
        match self.op {
            Op::Eq => ord == Ordering::Equal,
            Op::Gt => ord == Ordering::Greater,
            Op::Ge => ord != Ordering::Less,
            Op::Lt => ord == Ordering::Less,
            Op::Le => ord != Ordering::Greater,
        }
    }
}

impl std::fmt::Display for Comparator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.op.as_str(), self.version)
    }
}

/// A predicate over versions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum VersionConstraint {
    /// `1.2.3` or `=1.2.3`.
    Exact(Version),
    /// `>=1.2.3`.
    Minimum(Version),
    /// `^1.2.3`.
    Compatible(PartialVersion),
    /// `~1.2.3`.
    Approximate(PartialVersion),
    /// `*`, `1.*`, `1.2.*`. `None` means any version.
    Wildcard(Option<PartialVersion>),
    /// Comma-joined comparators, all of which must hold.
    Range(Vec<Comparator>),
}

impl VersionConstraint {
    /// Whether `v` satisfies this constraint.
    pub fn matches(&self, v: &Version) -> bool {
        match self {
            Self::Exact(pin) if pin.build.is_empty() => precedence(v, pin) == Ordering::Equal,
            Self::Exact(pin) => v == pin,
            _ if !v.pre.is_empty() => false,
            Self::Minimum(min) => precedence(v, min) != Ordering::Less,
            Self::Range(terms) => terms.iter().all(|t| t.matches(v)),
            Self::Compatible(_) | Self::Approximate(_) | Self::Wildcard(_) => {
                let (lower, upper) = self.bounds();
                precedence(v, &lower) != Ordering::Less
                    && upper.is_none_or(|u| precedence(v, &u) == Ordering::Less)
            }
        }
    }

    /// The exact version this constraint pins, if it is an exact pin.
    pub fn exact(&self) -> Option<&Version> {
        match self {
            Self::Exact(v) => Some(v),
            _ => None,
        }
    }

    /// Lowest version the constraint was written around, when it has one.
    ///
    /// Every constraint with an anchor is satisfied by it.
    pub fn anchor(&self) -> Option<Version> {
        match self {
            Self::Exact(v) | Self::Minimum(v) => Some(v.clone()),
            Self::Compatible(_) | Self::Approximate(_) | Self::Wildcard(_) => Some(self.bounds().0),
            Self::Range(terms) => {
                let floor = terms
                    .iter()
                    .filter(|t| matches!(t.op, Op::Ge | Op::Eq))
                    .map(|t| t.version.clone())
                    .max()
                    .unwrap_or_else(|| Version::new(0, 0, 0));
                self.matches(&floor).then_some(floor)
            }
        }
    }

    /// Half-open `[lower, upper)` bounds for the sugar forms.
    ///
    /// An upper bound past `u64::MAX` in every component is `None`.
    fn bounds(&self) -> (Version, Option<Version>) {
        match self {
            Self::Compatible(p) => {
                let upper = match (p.major, p.minor, p.patch) {
                    (0, None, _) => after_major(0),
                    (0, Some(0), None) => after_minor(0, 0),
                    (0, Some(0), Some(patch)) => after_patch(0, 0, patch),
                    (0, Some(minor), _) => after_minor(0, minor),
                    (major, _, _) => after_major(major),
                };
                (p.floor(), upper)
            }
            Self::Approximate(p) | Self::Wildcard(Some(p)) => {
                let upper = match p.minor {
                    None => after_major(p.major),
                    Some(minor) => after_minor(p.major, minor),
                };
                (p.floor(), upper)
            }
            Self::Wildcard(None) => (Version::new(0, 0, 0), None),
            Self::Exact(v) | Self::Minimum(v) => (v.clone(), None),
            Self::Range(_) => (Version::new(0, 0, 0), None),
        }
    }
}

/// Smallest version above every `major.*.*`.
fn after_major(major: u64) -> Option<Version> {
    major.checked_add(1).map(|next| Version::new(next, 0, 0))
}

/// Smallest version above every `major.minor.*`.
fn after_minor(major: u64, minor: u64) -> Option<Version> {
    match minor.checked_add(1) {
        Some(next) => Some(Version::new(major, next, 0)),
        None => after_major(major),
    }
}

fn after_patch(major: u64, minor: u64, patch: u64) -> Option<Version> {
    match patch.checked_add(1) {
        Some(next) => Some(Version::new(major, minor, next)),
        None => after_minor(major, minor),
    }
}

impl FromStr for VersionConstraint {
    type Err = ParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let text = input.trim();
        if text.is_empty() {
            return Err(ParseError::constraint(input, "empty constraint"));
        }

        if text.contains(',') {
            let terms = text
                .split(',')
                .map(|term| {
                    if term.trim().is_empty() {
                        Err(ParseError::constraint(input, "empty range term"))
                    } else {
                        Comparator::parse(input, term)
                    }
                })
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Self::Range(terms));
        }

        if text == "*" {
            return Ok(Self::Wildcard(None));
        }
        if let Some(rest) = text.strip_prefix('^') {
            return Ok(Self::Compatible(PartialVersion::parse(input, rest.trim())?));
        }
        if let Some(rest) = text.strip_prefix('~') {
            return Ok(Self::Approximate(PartialVersion::parse(input, rest.trim())?));
        }
        if let Some(rest) = text.strip_suffix(".*") {
            let partial = PartialVersion::parse(input, rest)?;
            if partial.patch.is_some() {
                return Err(ParseError::constraint(input, "wildcard after patch component"));
            }
            return Ok(Self::Wildcard(Some(partial)));
        }
        if text.starts_with(['>', '<', '=']) {
            // Exact pins may carry pre-release tags, so `=` is handled here.
            if let Some(rest) = text.strip_prefix('=') {
                let pinned = Version::parse(rest.trim())
                    .map_err(|e| ParseError::constraint(input, e.to_string()))?;
                return Ok(Self::Exact(pinned));
            }
            let term = Comparator::parse(input, text)?;
            return Ok(match term.op {
                Op::Ge => Self::Minimum(term.version),
                _ => Self::Range(vec![term]),
            });
        }

        Version::parse(text)
            .map(Self::Exact)
            .map_err(|e| ParseError::constraint(input, e.to_string()))
    }
}

impl std::fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exact(v) => write!(f, "{v}"),
            Self::Minimum(v) => write!(f, ">={v}"),
            Self::Compatible(p) => write!(f, "^{p}"),
            Self::Approximate(p) => write!(f, "~{p}"),
            Self::Wildcard(None) => write!(f, "*"),
            Self::Wildcard(Some(p)) => write!(f, "{p}.*"),
            Self::Range(terms) => {
                let rendered: Vec<String> = terms.iter().map(ToString::to_string).collect();
                write!(f, "{}", rendered.join(", "))
            }
        }
    }
}

impl TryFrom<String> for VersionConstraint {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<VersionConstraint> for String {
    fn from(c: VersionConstraint) -> Self {
        c.to_string()
    }
}
