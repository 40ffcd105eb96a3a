use std::{collections::BTreeMap, str::FromStr};

use crate::error::CCMError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Rule {
    Equal(String, String),
    NotEqual(String, String),
    Exists(String),
    DoesNotExist(String),
}

impl Rule {
    fn check(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Self::Equal(key, value) => labels.get(key) == Some(value),
            Self::NotEqual(key, value) => labels.get(key) != Some(value),
            Self::Exists(key) => labels.contains_key(key),
            Self::DoesNotExist(key) => !labels.contains_key(key),
        }
    }
}

/// Node selector from the service annotation.
///
/// Comma separated rules, all of which must hold:
/// `key=value`, `key!=value`, `key` and `!key`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelFilter {
    rules: Vec<Rule>,
}

impl LabelFilter {
    #[must_use]
    pub fn check(&self, labels: &BTreeMap<String, String>) -> bool {
        self.rules.iter().all(|rule| rule.check(labels))
    }
}

impl FromStr for LabelFilter {
    type Err = CCMError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut rules = Vec::new();
        for rule in s.split(',').map(str::trim).filter(|rule| !rule.is_empty()) {
            let invalid = || CCMError::InvalidNodeFilter(rule.to_string());
            let parts = rule.split('=').map(str::trim).collect::<Vec<_>>();
            let parsed = match *parts.as_slice() {
                [key] => match key.strip_prefix('!') {
                    Some(key) => Rule::DoesNotExist(key.to_string()),
                    None => Rule::Exists(key.to_string()),
                },
                [key, value] => match key.strip_suffix('!') {
                    Some(key) => Rule::NotEqual(key.to_string(), value.to_string()),
                    None => Rule::Equal(key.to_string(), value.to_string()),
                },
                _ => return Err(invalid()),
            };
            let key = match &parsed {
                Rule::Equal(key, _)
                | Rule::NotEqual(key, _)
                | Rule::Exists(key)
                | Rule::DoesNotExist(key) => key,
            };
            if key.is_empty() {
                return Err(invalid());
            }
            rules.push(parsed);
        }
        Ok(Self { rules })
    }
}
