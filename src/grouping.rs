//! Shard grouping for qualified test identifiers.
//!
//! This module partitions a flat list of test identifiers into balanced
//! shard groups. Tests that target different SDK versions must run in
//! separate processes, and tests from the same class should run together
//! so they share fixture setup, so the grouping keeps an SDK bucket's
//! classes contiguous and only closes a group once it has reached the
//! configured size bound.

use regex::Regex;

/// Default cap on the number of tests assigned to one shard group.
///
/// Chosen after timing suite runs with different worker counts and
/// tests-per-job values.
pub const DEFAULT_MAX_TESTS_PER_GROUP: usize = 150;

/// Result type for grouping operations.
pub type GroupingResult<T> = Result<T, GroupingError>;

/// Errors that can occur while grouping tests.
#[derive(Debug, thiserror::Error)]
pub enum GroupingError {
    #[error("test identifier does not match `package.Class#method[sdk]`: {0}")]
    InvalidIdentifier(String),
}

/// A qualified test name of the form `package.Class#method[sdkVersion]`.
///
/// The SDK suffix is optional. Identifiers are produced by the listing
/// step; anything that does not match the fixed pattern is rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestIdentifier {
    raw: String,
    qualified_class: String,
    sdk_version: Option<u32>,
}

impl TestIdentifier {
    /// Parse an identifier, splitting it into its class and SDK parts.
    pub fn parse(raw: &str) -> GroupingResult<Self> {
        // e.g. org.chromium.default_browser_promo.PromoUtilsTest#testNoPromo[28]
        let pattern = identifier_pattern();
        let caps = pattern
            .captures(raw)
            .ok_or_else(|| GroupingError::InvalidIdentifier(raw.to_string()))?;

        let sdk_version = match caps.get(2) {
            Some(m) => Some(
                m.as_str()
                    .parse::<u32>()
                    .map_err(|_| GroupingError::InvalidIdentifier(raw.to_string()))?,
            ),
            None => None,
        };

        Ok(Self {
            raw: raw.to_string(),
            qualified_class: caps[1].to_string(),
            sdk_version,
        })
    }

    /// The full identifier as supplied by the listing step.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The fully qualified class name (everything before `#`).
    pub fn qualified_class(&self) -> &str {
        &self.qualified_class
    }

    /// The SDK version tag, if the identifier carries one.
    pub fn sdk_version(&self) -> Option<u32> {
        self.sdk_version
    }

    /// The identifier in filter form, with `#` replaced by `.`.
    pub fn filter_name(&self) -> String {
        self.raw.replace('#', ".")
    }
}

fn identifier_pattern() -> &'static Regex {
    // Matches a test name with an optional sdk version suffix.
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(.*\.\w+)#\w+(?:\[(\d+)\])?").expect("identifier pattern is valid")
    })
}

/// An ordered, non-overlapping subset of tests assigned to one shard.
///
/// Test names are stored in filter form (`#` replaced by `.`), ready to
/// be joined into a shard's test filter expression.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardGroup {
    tests: Vec<String>,
}

impl ShardGroup {
    /// The tests assigned to this group, in filter form.
    pub fn tests(&self) -> &[String] {
        &self.tests
    }

    /// Number of tests in this group.
    pub fn len(&self) -> usize {
        self.tests.len()
    }

    /// True if the group holds no tests.
    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    /// The group's tests joined into a `:`-separated filter expression.
    pub fn filter_expression(&self) -> String {
        self.tests.join(":")
    }
}

/// Partition `tests` into shard groups of at most `max_per_group` tests.
///
/// Identifiers are bucketed by SDK version (absent version is its own
/// bucket) so that no group mixes SDK versions. Within a bucket, tests
/// are sorted so that tests of the same class are contiguous, and whole
/// classes are packed into groups. A class is never split across groups;
/// if a single class alone exceeds `max_per_group` it becomes one
/// oversized group by itself.
///
/// Grouping an empty list yields exactly one empty group so that a
/// "no tests found" run flows through the normal job path downstream.
pub fn group_tests(tests: &[String], max_per_group: usize) -> GroupingResult<Vec<ShardGroup>> {
    // SDK buckets keep the insertion order of the first-seen SDK value.
    let mut buckets: Vec<(Option<u32>, Vec<TestIdentifier>)> = Vec::new();
    for raw in tests {
        let ident = TestIdentifier::parse(raw)?;
        match buckets.iter_mut().find(|(sdk, _)| *sdk == ident.sdk_version) {
            Some((_, bucket)) => bucket.push(ident),
            None => buckets.push((ident.sdk_version, vec![ident])),
        }
    }

    let mut groups = Vec::new();
    for (_, mut bucket) in buckets {
        bucket.sort_by(|a, b| {
            (a.qualified_class(), a.raw()).cmp(&(b.qualified_class(), b.raw()))
        });
        bucket.dedup_by(|a, b| a.raw() == b.raw());
        pack_bucket(&bucket, max_per_group, &mut groups);
    }

    if groups.is_empty() {
        groups.push(ShardGroup::default());
    }

    Ok(groups)
}

/// Pack one sorted SDK bucket into groups, keeping classes whole.
fn pack_bucket(bucket: &[TestIdentifier], max_per_group: usize, groups: &mut Vec<ShardGroup>) {
    let mut current = ShardGroup::default();

    let mut idx = 0;
    while idx < bucket.len() {
        let class = bucket[idx].qualified_class();
        let class_end = bucket[idx..]
            .iter()
            .position(|t| t.qualified_class() != class)
            .map(|off| idx + off)
            .unwrap_or(bucket.len());
        let class_tests = &bucket[idx..class_end];
        idx = class_end;

        // Close the running group rather than let a whole class push it
        // past the bound. A class bigger than the bound still stays
        // together as its own oversized group.
        if !current.is_empty() && current.len() + class_tests.len() > max_per_group {
            groups.push(std::mem::take(&mut current));
        }
        current
            .tests
            .extend(class_tests.iter().map(TestIdentifier::filter_name));
        if current.len() >= max_per_group {
            groups.push(std::mem::take(&mut current));
        }
    }

    if !current.is_empty() {
        groups.push(current);
    }
}
