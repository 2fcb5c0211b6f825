//! Dotted version numbers and requirement-style constraints.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A dotted version such as `2.0.1`.  Non-numeric suffixes in a segment
/// (`1.0rc1`) compare after the numeric prefix, lexically.
#[derive(Debug, Clone)]
pub struct Version {
    raw: String,
    segments: Vec<(u64, String)>,
}

impl Version {
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for Version {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        if raw.is_empty() {
            return Err("empty version".to_string());
        }
        let mut segments = Vec::new();
        for part in raw.split('.') {
            let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
            if digits.is_empty() {
                return Err(format!("invalid version '{raw}'"));
            }
            let number = digits
                .parse::<u64>()
                .map_err(|_| format!("version segment too large in '{raw}'"))?;
            segments.push((number, part[digits.len()..].to_string()));
        }
        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.segments.len().max(other.segments.len());
        let zero = (0u64, String::new());
        for i in 0..len {
            let a = self.segments.get(i).unwrap_or(&zero);
            let b = other.segments.get(i).unwrap_or(&zero);
            let ord = a.0.cmp(&b.0).then_with(|| match (a.1.is_empty(), b.1.is_empty()) {
                // a release sorts after its pre-releases
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                _ => a.1.cmp(&b.1),
            });
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
    Compatible,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Clause {
    op: Op,
    version: Version,
}

impl Clause {
    fn matches(&self, candidate: &Version) -> bool {
        match self.op {
            Op::Eq => candidate == &self.version,
            Op::Ne => candidate != &self.version,
            Op::Ge => candidate >= &self.version,
            Op::Le => candidate <= &self.version,
            Op::Gt => candidate > &self.version,
            Op::Lt => candidate < &self.version,
            Op::Compatible => {
                // ~=X.Y means >=X.Y and ==X.*
                if candidate < &self.version {
                    return false;
                }
                let keep = self.version.segments.len().saturating_sub(1).max(1);
                self.version
                    .segments
                    .iter()
                    .take(keep)
                    .zip(candidate.segments.iter())
                    .all(|(a, b)| a.0 == b.0)
            }
        }
    }
}

/// Comma-joined clauses, all of which must hold.  `*` or an empty string
/// accepts any version; a bare version means `==`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionConstraint {
    raw: String,
    clauses: Vec<Clause>,
}

impl VersionConstraint {
    pub fn any() -> Self {
        Self {
            raw: "*".to_string(),
            clauses: Vec::new(),
        }
    }

    pub fn matches(&self, candidate: &Version) -> bool {
        self.clauses.iter().all(|c| c.matches(candidate))
    }

    /// `true` when the constraint admits any version.
    pub fn is_any(&self) -> bool {
        self.clauses.is_empty()
    }

    /// The pinned version when the constraint is a single `==` clause.
    pub fn exact(&self) -> Option<&Version> {
        match self.clauses.as_slice() {
            [Clause { op: Op::Eq, version }] => Some(version),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for VersionConstraint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        if raw.is_empty() || raw == "*" {
            return Ok(Self::any());
        }
        let mut clauses = Vec::new();
        for part in raw.split(',') {
            let part = part.trim();
            let (op, rest) = if let Some(rest) = part.strip_prefix("~=") {
                (Op::Compatible, rest)
            } else if let Some(rest) = part.strip_prefix("==") {
                (Op::Eq, rest)
            } else if let Some(rest) = part.strip_prefix("!=") {
                (Op::Ne, rest)
            } else if let Some(rest) = part.strip_prefix(">=") {
                (Op::Ge, rest)
            } else if let Some(rest) = part.strip_prefix("<=") {
                (Op::Le, rest)
            } else if let Some(rest) = part.strip_prefix('>') {
                (Op::Gt, rest)
            } else if let Some(rest) = part.strip_prefix('<') {
                (Op::Lt, rest)
            } else {
                (Op::Eq, part)
            };
            let version = rest
                .parse::<Version>()
                .map_err(|e| format!("invalid constraint '{raw}': {e}"))?;
            clauses.push(Clause { op, version });
        }
        Ok(Self {
            raw: raw.to_string(),
            clauses,
        })
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
