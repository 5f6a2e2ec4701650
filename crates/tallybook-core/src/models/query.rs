use std::ops::Bound;

use super::IndexValue;

/// A contiguous range of index (or primary key) values.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyRange {
    pub lower: Bound<IndexValue>,
    pub upper: Bound<IndexValue>,
}

impl KeyRange {
    pub fn only(value: impl Into<IndexValue>) -> Self {
        let value = value.into();
        Self {
            lower: Bound::Included(value.clone()),
            upper: Bound::Included(value),
        }
    }

    pub fn lower_bound(value: impl Into<IndexValue>, open: bool) -> Self {
        Self {
            lower: bound(value.into(), open),
            upper: Bound::Unbounded,
        }
    }

    pub fn upper_bound(value: impl Into<IndexValue>, open: bool) -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: bound(value.into(), open),
        }
    }

    pub fn bound(lower: impl Into<IndexValue>, upper: impl Into<IndexValue>, lower_open: bool, upper_open: bool) -> Self {
        Self {
            lower: bound(lower.into(), lower_open),
            upper: bound(upper.into(), upper_open),
        }
    }

    pub fn contains(&self, value: &IndexValue) -> bool {
        let above = match &self.lower {
            Bound::Included(l) => value >= l,
            Bound::Excluded(l) => value > l,
            Bound::Unbounded => true,
        };
        let below = match &self.upper {
            Bound::Included(u) => value <= u,
            Bound::Excluded(u) => value < u,
            Bound::Unbounded => true,
        };
        above && below
    }

    /// True when `value` lies past the upper bound, so an ordered scan can
    /// stop.
    pub fn exceeds_upper(&self, value: &IndexValue) -> bool {
        match &self.upper {
            Bound::Included(u) => value > u,
            Bound::Excluded(u) => value >= u,
            Bound::Unbounded => false,
        }
    }

    /// True when no value can fall inside the range. `BTreeMap::range`
    /// panics on inverted bounds, so engines check this first.
    pub fn is_empty(&self) -> bool {
        match (&self.lower, &self.upper) {
            (Bound::Included(l), Bound::Included(u)) => l > u,
            (Bound::Included(l), Bound::Excluded(u))
            | (Bound::Excluded(l), Bound::Included(u))
            | (Bound::Excluded(l), Bound::Excluded(u)) => l >= u,
            _ => false,
        }
    }
}

fn bound(value: IndexValue, open: bool) -> Bound<IndexValue> {
    if open {
        Bound::Excluded(value)
    } else {
        Bound::Included(value)
    }
}

/// Selects records for `get_all` / `count`: either through a named secondary
/// index or over the primary key, optionally narrowed to a range.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexQuery {
    pub index: Option<String>,
    pub range: Option<KeyRange>,
}

impl IndexQuery {
    pub fn index(name: &str) -> Self {
        Self {
            index: Some(name.to_string()),
            range: None,
        }
    }

    pub fn primary(range: KeyRange) -> Self {
        Self {
            index: None,
            range: Some(range),
        }
    }

    pub fn with_range(mut self, range: KeyRange) -> Self {
        self.range = Some(range);
        self
    }

    pub fn matches(&self, value: &IndexValue) -> bool {
        match &self.range {
            Some(range) => range.contains(value),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_contains() {
        let r = KeyRange::bound(10.0, 20.0, false, true);
        assert!(r.contains(&IndexValue::from(10.0)));
        assert!(r.contains(&IndexValue::from(19.5)));
        assert!(!r.contains(&IndexValue::from(20.0)));
        assert!(!r.contains(&IndexValue::from("15")));
    }

    #[test]
    fn test_only_and_empty() {
        let r = KeyRange::only("paid");
        assert!(r.contains(&IndexValue::from("paid")));
        assert!(!r.contains(&IndexValue::from("unpaid")));
        assert!(!r.is_empty());
        assert!(KeyRange::bound(5.0, 1.0, false, false).is_empty());
        assert!(KeyRange::bound(1.0, 1.0, true, false).is_empty());
    }
}
