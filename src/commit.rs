//! The commit id: an opaque token supplied by the observer, naming a
//! repository state. We don't interpret it beyond the wire-format
//! constraints: non-empty, printable ASCII, no `:` or newline.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommitId(String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidCommitId(pub String);

impl fmt::Display for InvalidCommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid commit id {:?}", self.0)
    }
}

impl std::error::Error for InvalidCommitId {}

impl CommitId {
    pub fn parse(s: &str) -> Result<Self, InvalidCommitId> {
        if s.is_empty()
            || s.contains(':')
            || s.contains('\n')
            || !s.chars().all(|c| c.is_ascii_graphic())
        {
            return Err(InvalidCommitId(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for CommitId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("abc123" => true; "plain hex")]
    #[test_case("" => false; "empty")]
    #[test_case("has:colon" => false; "colon")]
    #[test_case("has\nnewline" => false; "newline")]
    #[test_case("has space" => false; "space not graphic")]
    fn parse_validity(s: &str) -> bool {
        CommitId::parse(s).is_ok()
    }

    #[test]
    fn display_roundtrips() {
        let c = CommitId::parse("deadbeef").unwrap();
        assert_eq!(c.to_string(), "deadbeef");
        assert_eq!(c.as_str(), "deadbeef");
    }
}
