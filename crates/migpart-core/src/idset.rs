//! Sets of CPU / NUMA node ids in kernel list format (`0-3,8,10-11`)

use crate::PartitionError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Largest id accepted when parsing; kernel CPU and node ids stay far below it
pub const MAX_ID: u32 = u16::MAX as u32;

/// Ordered set of non-negative ids
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct IdSet(BTreeSet<u32>);

impl IdSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    /// Create a set holding the half-open range `start..end`
    pub fn range(start: u32, end: u32) -> Self {
        Self((start..end).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.0.contains(&id)
    }

    pub fn insert(&mut self, id: u32) -> bool {
        self.0.insert(id)
    }

    /// Ids in ascending order
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.iter().copied()
    }

    pub fn first(&self) -> Option<u32> {
        self.0.first().copied()
    }

    pub fn last(&self) -> Option<u32> {
        self.0.last().copied()
    }

    pub fn intersection(&self, other: &IdSet) -> IdSet {
        Self(self.0.intersection(&other.0).copied().collect())
    }

    pub fn is_disjoint(&self, other: &IdSet) -> bool {
        self.0.is_disjoint(&other.0)
    }

    /// Whether the ids form one run with no holes
    pub fn is_contiguous(&self) -> bool {
        match (self.first(), self.last()) {
            (Some(first), Some(last)) => (last - first) as usize + 1 == self.len(),
            _ => true,
        }
    }
}

impl FromIterator<u32> for IdSet {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl FromStr for IdSet {
    type Err = PartitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut ids = BTreeSet::new();
        for part in s.trim().split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match part.split_once('-') {
                Some((lo, hi)) => {
                    let lo = parse_id(lo, s)?;
                    let hi = parse_id(hi, s)?;
                    if lo > hi {
                        return Err(PartitionError::Parse(format!(
                            "descending range '{}' in id list '{}'",
                            part, s
                        )));
                    }
                    ids.extend(lo..=hi);
                }
                None => {
                    ids.insert(parse_id(part, s)?);
                }
            }
        }
        Ok(Self(ids))
    }
}

fn parse_id(token: &str, list: &str) -> Result<u32, PartitionError> {
    let id: u32 = token.trim().parse().map_err(|_| {
        PartitionError::Parse(format!("invalid id '{}' in id list '{}'", token, list))
    })?;
    if id > MAX_ID {
        return Err(PartitionError::Parse(format!(
            "id {} in id list '{}' exceeds {}",
            id, list, MAX_ID
        )));
    }
    Ok(id)
}

impl fmt::Display for IdSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids = self.iter().peekable();
        let mut first = true;
        while let Some(start) = ids.next() {
            let mut end = start;
            while ids.peek() == Some(&(end + 1)) {
                end += 1;
                ids.next();
            }
            if !first {
                f.write_str(",")?;
            }
            first = false;
            if start == end {
                write!(f, "{}", start)?;
            } else {
                write!(f, "{}-{}", start, end)?;
            }
        }
        Ok(())
    }
}

impl From<IdSet> for String {
    fn from(set: IdSet) -> Self {
        set.to_string()
    }
}

impl TryFrom<String> for IdSet {
    type Error = PartitionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kernel_list() {
        let set: IdSet = "0-3,8,10-11\n".parse().unwrap();
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 1, 2, 3, 8, 10, 11]);
    }

    #[test]
    fn test_parse_empty() {
        let set: IdSet = "\n".parse().unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("0-x".parse::<IdSet>().is_err());
        assert!("5-2".parse::<IdSet>().is_err());
    }

    #[test]
    fn test_parse_rejects_huge_ids() {
        let err = "0-4294967295".parse::<IdSet>().unwrap_err();
        assert!(matches!(err, PartitionError::Parse(_)));
        assert!("65536".parse::<IdSet>().is_err());
        assert_eq!("65535".parse::<IdSet>().unwrap().last(), Some(MAX_ID));

        let corrupt: Result<IdSet, _> = serde_json::from_str("\"0-4294967295\"");
        assert!(corrupt.is_err());
    }

    #[test]
    fn test_display_collapses_runs() {
        let set: IdSet = [0, 1, 2, 5, 7, 8].into_iter().collect();
        assert_eq!(set.to_string(), "0-2,5,7-8");
        assert_eq!(IdSet::range(61, 71).to_string(), "61-70");
        assert_eq!(IdSet::new().to_string(), "");
    }

    #[test]
    fn test_contiguous() {
        assert!(IdSet::range(0, 11).is_contiguous());
        assert!(!"0,2".parse::<IdSet>().unwrap().is_contiguous());
    }

    #[test]
    fn test_serde_as_string() {
        let set = IdSet::range(0, 4);
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, "\"0-3\"");
        let back: IdSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
    }
}
