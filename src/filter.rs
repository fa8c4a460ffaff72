//! Logging policy and account filters.

use crate::error::AuditError;
use crate::event::EventClass;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which event classes are logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    #[default]
    All,
    None,
    Logins,
    Queries,
}

impl Policy {
    /// Class mask for this policy.
    pub const fn class_mask(self) -> u8 {
        match self {
            Self::All => EventClass::General.mask() | EventClass::Connection.mask(),
            Self::None => 0,
            Self::Logins => EventClass::Connection.mask(),
            Self::Queries => EventClass::General.mask(),
        }
    }

    pub fn allows(self, class: EventClass) -> bool {
        self.class_mask() & class.mask() != 0
    }
}

/// One `user@host` pattern. `%` matches any run, `_` one character.
#[derive(Debug, Clone)]
pub struct AccountPattern {
    source: String,
    user: Regex,
    host: Regex,
}

impl AccountPattern {
    pub fn parse(account: &str) -> Result<Self, AuditError> {
        let account = account.trim();
        let (user, host) = match account.rfind('@') {
            Some(at) => (&account[..at], &account[at + 1..]),
            None => (account, "%"),
        };
        let user = unquote(user.trim());
        let host = unquote(host.trim());
        if user.is_empty() && host.is_empty() {
            return Err(AuditError::InvalidAccount(account.to_string()));
        }

        Ok(Self {
            source: account.to_string(),
            user: compile(user, false, account)?,
            host: compile(host, true, account)?,
        })
    }

    pub fn matches(&self, user: &str, host: &str) -> bool {
        self.user.is_match(user) && self.host.is_match(host)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

fn unquote(part: &str) -> &str {
    for quote in ['\'', '"', '`'] {
        if part.len() >= 2 && part.starts_with(quote) && part.ends_with(quote) {
            return &part[1..part.len() - 1];
        }
    }
    part
}

fn compile(pattern: &str, case_insensitive: bool, account: &str) -> Result<Regex, AuditError> {
    let mut re = String::with_capacity(pattern.len() + 8);
    if case_insensitive {
        re.push_str("(?i)");
    }
    re.push('^');
    let mut literal = [0u8; 4];
    for c in pattern.chars() {
        match c {
            '%' => re.push_str(".*"),
            '_' => re.push('.'),
            other => re.push_str(&regex::escape(other.encode_utf8(&mut literal))),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|_| AuditError::InvalidAccount(account.to_string()))
}

/// A parsed, comma separated account list.
#[derive(Debug, Clone, Default)]
pub struct AccountList {
    patterns: Vec<AccountPattern>,
}

impl AccountList {
    pub fn parse(list: &str) -> Result<Self, AuditError> {
        let patterns = list
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(AccountPattern::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn contains(&self, user: &str, host: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(user, host))
    }
}

impl fmt::Display for AccountList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, pattern) in self.patterns.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            f.write_str(pattern.as_str())?;
        }
        Ok(())
    }
}

/// At most one of an include or an exclude list.
#[derive(Debug, Clone, Default)]
pub enum AccountFilter {
    #[default]
    Unrestricted,
    Include(AccountList),
    Exclude(AccountList),
}

impl AccountFilter {
    /// Build from the two configured lists. Both non-empty is rejected.
    pub fn from_lists(include: &str, exclude: &str) -> Result<Self, AuditError> {
        Self::Unrestricted.with_include(include)?.with_exclude(exclude)
    }

    pub fn allows(&self, user: &str, host: &str) -> bool {
        match self {
            Self::Unrestricted => true,
            Self::Include(list) => list.contains(user, host),
            Self::Exclude(list) => !list.contains(user, host),
        }
    }

    /// Replace the include list. An empty list clears it.
    ///
    /// Fails, leaving `self` untouched, if a non-empty include list is
    /// requested while an exclude list is active.
    pub fn with_include(&self, list: &str) -> Result<Self, AuditError> {
        let parsed = AccountList::parse(list)?;
        match self {
            Self::Exclude(_) if !parsed.is_empty() => Err(AuditError::ConflictingAccountFilter {
                requested: "include_accounts",
                active: "exclude_accounts",
            }),
            Self::Exclude(_) => Ok(self.clone()),
            _ if parsed.is_empty() => Ok(Self::Unrestricted),
            _ => Ok(Self::Include(parsed)),
        }
    }

    /// Replace the exclude list. An empty list clears it.
    pub fn with_exclude(&self, list: &str) -> Result<Self, AuditError> {
        let parsed = AccountList::parse(list)?;
        match self {
            Self::Include(_) if !parsed.is_empty() => Err(AuditError::ConflictingAccountFilter {
                requested: "exclude_accounts",
                active: "include_accounts",
            }),
            Self::Include(_) => Ok(self.clone()),
            _ if parsed.is_empty() => Ok(Self::Unrestricted),
            _ => Ok(Self::Exclude(parsed)),
        }
    }

    pub fn include_list(&self) -> Option<&AccountList> {
        match self {
            Self::Include(list) => Some(list),
            _ => None,
        }
    }

    pub fn exclude_list(&self) -> Option<&AccountList> {
        match self {
            Self::Exclude(list) => Some(list),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_masks() {
        assert!(Policy::All.allows(EventClass::General));
        assert!(Policy::All.allows(EventClass::Connection));
        assert!(!Policy::None.allows(EventClass::General));
        assert!(!Policy::None.allows(EventClass::Connection));
        assert!(Policy::Logins.allows(EventClass::Connection));
        assert!(!Policy::Logins.allows(EventClass::General));
        assert!(Policy::Queries.allows(EventClass::General));
        assert!(!Policy::Queries.allows(EventClass::Connection));
    }

    #[test]
    fn test_include_list() {
        let filter = AccountFilter::Unrestricted.with_include("alice@%").unwrap();
        assert!(filter.allows("alice", "anyhost"));
        assert!(!filter.allows("bob", "anyhost"));
    }

    #[test]
    fn test_exclude_list() {
        let filter = AccountFilter::Unrestricted.with_exclude("bob@%").unwrap();
        assert!(!filter.allows("bob", "anyhost"));
        assert!(filter.allows("alice", "anyhost"));
    }

    #[test]
    fn test_both_lists_rejected() {
        let include = AccountFilter::Unrestricted.with_include("alice@%").unwrap();
        assert!(matches!(
            include.with_exclude("bob@%"),
            Err(AuditError::ConflictingAccountFilter { .. })
        ));
        assert!(AccountFilter::from_lists("alice@%", "bob@%").is_err());
    }

    #[test]
    fn test_empty_string_clears() {
        let filter = AccountFilter::Unrestricted.with_exclude("bob@%").unwrap();
        let cleared = filter.with_exclude("").unwrap();
        assert!(matches!(cleared, AccountFilter::Unrestricted));
        assert!(cleared.with_include("alice@%").is_ok());
    }

    #[test]
    fn test_clearing_other_list_is_noop() {
        let filter = AccountFilter::Unrestricted.with_exclude("bob@%").unwrap();
        let same = filter.with_include("").unwrap();
        assert!(!same.allows("bob", "h"));
    }

    #[test]
    fn test_pattern_syntax() {
        let list = AccountList::parse(" 'app'@'10.0.%' , backup@localhost,report").unwrap();
        assert_eq!(list.len(), 3);
        assert!(list.contains("app", "10.0.3.4"));
        assert!(!list.contains("app", "10.1.3.4"));
        assert!(list.contains("backup", "LOCALHOST"));
        assert!(!list.contains("Backup", "localhost"));
        assert!(list.contains("report", "anywhere"));
    }

    #[test]
    fn test_underscore_wildcard_and_literals() {
        let pattern = AccountPattern::parse("u_@db.example.com").unwrap();
        assert!(pattern.matches("u1", "db.example.com"));
        assert!(!pattern.matches("u12", "db.example.com"));
        // '.' is literal, not a regex wildcard
        assert!(!pattern.matches("u1", "dbxexample.com"));
    }

    #[test]
    fn test_list_display() {
        let list = AccountList::parse("a@%, b@h").unwrap();
        assert_eq!(list.to_string(), "a@%,b@h");
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(matches!(
            AccountPattern::parse("@"),
            Err(AuditError::InvalidAccount(_))
        ));
    }

    #[test]
    fn test_policy_from_yaml() {
        let policy: Policy = serde_yaml::from_str("queries").unwrap();
        assert_eq!(policy, Policy::Queries);
    }
}
