//! Domain model and the posting normalization/matching engine.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "jobpulse-core";

/// One raw posting row as staged by the load stage. Immutable once staged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPosting {
    pub load_id: String,
    pub source_row_id: String,
    pub company: Option<String>,
    pub city: Option<String>,
    pub title: Option<String>,
    pub occupation: Option<String>,
    pub url: Option<String>,
    pub portal: Option<String>,
    pub experience_months: Option<f64>,
    pub date_created: NaiveDate,
    pub description: Option<String>,
    pub locale: Option<String>,
}

/// The retained representative of a fingerprint group, with derived labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalPosting {
    pub id: String,
    pub date_created: NaiveDate,
    pub company: Option<String>,
    pub portal: Option<String>,
    pub url: Option<String>,
    pub years_of_experience: Option<i32>,
    pub description: Option<String>,
    pub city_clusters: Vec<String>,
    pub positions: Vec<String>,
    pub skills: Vec<String>,
}

/// Exploded (posting, position label) row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRow {
    pub posting_id: String,
    pub title_raw: Option<String>,
    pub occupation_raw: Option<String>,
    pub position: String,
}

/// Exploded (posting, city cluster label) row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CityClusterRow {
    pub posting_id: String,
    pub city_raw: Option<String>,
    pub city_cluster: String,
}

/// Exploded (posting, skill label) row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillRow {
    pub posting_id: String,
    pub skill: String,
}

/// Maps a staged source row onto the posting fingerprint it resolved to.
/// Append-only; `is_source` marks the canonical representative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdMatch {
    pub source_row_id: String,
    pub posting_id: String,
    pub is_source: bool,
}

// ---------------------------------------------------------------------------
// Text normalization
// ---------------------------------------------------------------------------

/// Punctuation folded to a single space under space-sensitive normalization.
const PUNCTUATION_TO_SPACE: &[char] = &[
    '!', '"', '$', '%', '\'', '(', ')', '+', ',', '-', '.', '/', ':', ';', '?',
];

/// Canonicalize free text for keyword matching.
///
/// Case-insensitive mode lowercases. Space-insensitive mode strips all
/// whitespace so substring containment compares contiguous token strings.
/// Space-sensitive mode folds punctuation to spaces, collapses whitespace and
/// pads with one leading and one trailing space so keywords match on whole
/// token boundaries.
pub fn normalize(text: &str, case_sensitive: bool, spaces_sensitive: bool) -> String {
    let folded = if case_sensitive {
        text.to_string()
    } else {
        text.to_lowercase()
    };
    if spaces_sensitive {
        let replaced: String = folded
            .chars()
            .map(|c| if PUNCTUATION_TO_SPACE.contains(&c) { ' ' } else { c })
            .collect();
        let collapsed = replaced.split_whitespace().collect::<Vec<_>>().join(" ");
        format!(" {collapsed} ")
    } else {
        folded.chars().filter(|c| !c.is_whitespace()).collect()
    }
}

// ---------------------------------------------------------------------------
// Mapping rules
// ---------------------------------------------------------------------------

/// Raw rule row as parsed from the external rule feed. All fields optional so
/// that validation, not parsing, decides what is acceptable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleRow {
    pub keyword: Option<String>,
    pub result: Option<String>,
    pub case_sensitive: Option<bool>,
    pub spaces_sensitive: Option<bool>,
}

#[derive(Debug, Error)]
pub enum RuleSetError {
    #[error("rule set '{domain}' row {row}: missing required attribute '{attribute}'")]
    MissingAttribute {
        domain: String,
        row: usize,
        attribute: &'static str,
    },
    #[error("rule set '{domain}': keywords duplicated after normalization: {keywords:?}")]
    DuplicateKeywords {
        domain: String,
        keywords: Vec<String>,
    },
}

#[derive(Debug, Clone)]
struct PreparedRule {
    keyword: String,
    result: String,
}

#[derive(Debug, Clone)]
struct RuleGroup {
    case_sensitive: bool,
    spaces_sensitive: bool,
    rules: Vec<PreparedRule>,
}

/// A validated, immutable keyword-to-label rule set.
///
/// Rules are grouped by `(case_sensitive, spaces_sensitive)` in first-seen
/// order and their keywords pre-normalized once at construction. Lookups scan
/// groups in declaration order, then texts in the given order, then rules in
/// table order; the match test is normalized-keyword-in-normalized-text.
#[derive(Debug, Clone)]
pub struct MappingRuleSet {
    domain: String,
    groups: Vec<RuleGroup>,
    labels: BTreeSet<String>,
}

impl MappingRuleSet {
    pub fn from_rows(domain: &str, rows: &[RuleRow]) -> Result<Self, RuleSetError> {
        let missing = |row: usize, attribute: &'static str| RuleSetError::MissingAttribute {
            domain: domain.to_string(),
            row,
            attribute,
        };

        let mut groups: Vec<RuleGroup> = Vec::new();
        let mut labels = BTreeSet::new();
        let mut keyword_counts: BTreeMap<String, usize> = BTreeMap::new();

        for (idx, row) in rows.iter().enumerate() {
            let result = row.result.clone().ok_or_else(|| missing(idx, "result"))?;
            let case_sensitive = row.case_sensitive.ok_or_else(|| missing(idx, "case_sensitive"))?;
            let spaces_sensitive = row
                .spaces_sensitive
                .ok_or_else(|| missing(idx, "spaces_sensitive"))?;
            // A rule with no keyword matches on its own label.
            let keyword = row.keyword.clone().unwrap_or_else(|| result.clone());

            let prepared = normalize(&keyword, case_sensitive, spaces_sensitive);
            let case_folded = if case_sensitive {
                keyword.clone()
            } else {
                keyword.to_lowercase()
            };
            if spaces_sensitive && prepared.trim() != case_folded {
                warn!(
                    domain,
                    keyword = %keyword,
                    prepared = prepared.trim(),
                    "rule keyword altered by normalization"
                );
            }
            *keyword_counts.entry(prepared.clone()).or_default() += 1;
            labels.insert(result.clone());

            let group = groups
                .iter_mut()
                .find(|g| g.case_sensitive == case_sensitive && g.spaces_sensitive == spaces_sensitive);
            let rule = PreparedRule {
                keyword: prepared,
                result,
            };
            match group {
                Some(group) => group.rules.push(rule),
                None => groups.push(RuleGroup {
                    case_sensitive,
                    spaces_sensitive,
                    rules: vec![rule],
                }),
            }
        }

        let duplicates: Vec<String> = keyword_counts
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(keyword, _)| keyword)
            .collect();
        if !duplicates.is_empty() {
            return Err(RuleSetError::DuplicateKeywords {
                domain: domain.to_string(),
                keywords: duplicates,
            });
        }

        Ok(Self {
            domain: domain.to_string(),
            groups,
            labels,
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Every result label the rule set can produce.
    pub fn labels(&self) -> &BTreeSet<String> {
        &self.labels
    }

    /// First matching label, or `None`. Callers supply defaults with
    /// `unwrap_or` at the call site.
    pub fn find_any(&self, texts: &[Option<&str>]) -> Option<String> {
        let texts = self.present_texts(texts);
        for group in &self.groups {
            for text in &texts {
                let haystack = normalize(text, group.case_sensitive, group.spaces_sensitive);
                for rule in &group.rules {
                    if haystack.contains(&rule.keyword) {
                        return Some(rule.result.clone());
                    }
                }
            }
        }
        None
    }

    /// Every matching label across all groups and texts.
    pub fn find_all(&self, texts: &[Option<&str>]) -> BTreeSet<String> {
        let texts = self.present_texts(texts);
        let mut found = BTreeSet::new();
        for group in &self.groups {
            for text in &texts {
                let haystack = normalize(text, group.case_sensitive, group.spaces_sensitive);
                for rule in &group.rules {
                    if haystack.contains(&rule.keyword) {
                        found.insert(rule.result.clone());
                    }
                }
            }
        }
        found
    }

    fn present_texts<'a>(&self, texts: &[Option<&'a str>]) -> Vec<&'a str> {
        texts
            .iter()
            .filter_map(|text| match text {
                Some(text) => Some(*text),
                None => {
                    warn!(domain = %self.domain, "null text skipped in rule lookup");
                    None
                }
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Fingerprinting
// ---------------------------------------------------------------------------

/// Character windows sampled from each field; negative offsets count from the
/// end with saturating clamping, so short fields contribute what they have.
const FINGERPRINT_WINDOWS: [(isize, isize); 4] = [(0, 100), (500, 550), (1500, 1550), (-300, -250)];

fn char_window(chars: &[char], start: isize, stop: isize) -> String {
    let len = chars.len() as isize;
    let resolve = |idx: isize| -> usize {
        if idx < 0 {
            (len + idx).max(0) as usize
        } else {
            idx.min(len) as usize
        }
    };
    let (start, stop) = (resolve(start), resolve(stop));
    if start >= stop {
        return String::new();
    }
    chars[start..stop].iter().collect()
}

/// Content-based dedup key over an ordered list of text fields.
///
/// Sampling fixed windows keeps long description fields cheap to compare, and
/// reducing to ASCII letters tolerates cosmetic reformatting between portals.
pub fn fingerprint(fields: &[Option<&str>]) -> String {
    let mut digest = Sha256::new();
    for field in fields {
        if let Some(text) = field {
            let chars: Vec<char> = text.chars().collect();
            let sampled: String = FINGERPRINT_WINDOWS
                .iter()
                .map(|&(start, stop)| char_window(&chars, start, stop))
                .collect();
            let fragment: String = sampled
                .to_lowercase()
                .chars()
                .filter(char::is_ascii_alphabetic)
                .collect();
            digest.update(fragment.as_bytes());
        }
    }
    hex::encode(digest.finalize())
}

/// Fingerprint a posting over the fields that define duplicate identity.
pub fn posting_fingerprint(posting: &RawPosting) -> String {
    fingerprint(&[
        posting.title.as_deref(),
        posting.company.as_deref(),
        posting.city.as_deref(),
        posting.description.as_deref(),
    ])
}

// ---------------------------------------------------------------------------
// Duplicate resolution
// ---------------------------------------------------------------------------

/// Canonical rows plus the complete old-id-to-fingerprint mapping.
#[derive(Debug, Clone)]
pub struct DedupResolution {
    pub canonical: Vec<(String, RawPosting)>,
    pub id_matches: Vec<IdMatch>,
}

/// Partition fingerprinted rows and keep the most recently created row of
/// each partition. Ties on `date_created` keep the first-encountered input
/// row (the sort is stable). Every input row lands in `id_matches` exactly
/// once.
pub fn resolve_duplicates(rows: Vec<(String, RawPosting)>) -> DedupResolution {
    let mut sorted = rows;
    sorted.sort_by(|(fp_a, row_a), (fp_b, row_b)| {
        fp_a.cmp(fp_b)
            .then(row_b.date_created.cmp(&row_a.date_created))
    });

    let mut canonical = Vec::new();
    let mut id_matches = Vec::with_capacity(sorted.len());
    let mut previous: Option<&str> = None;
    for (fingerprint, posting) in &sorted {
        let is_source = previous != Some(fingerprint.as_str());
        id_matches.push(IdMatch {
            source_row_id: posting.source_row_id.clone(),
            posting_id: fingerprint.clone(),
            is_source,
        });
        if is_source {
            canonical.push((fingerprint.clone(), posting.clone()));
        }
        previous = Some(fingerprint.as_str());
    }

    DedupResolution {
        canonical,
        id_matches,
    }
}

// ---------------------------------------------------------------------------
// Derived attributes
// ---------------------------------------------------------------------------

pub const FRANKFURT_AMBIGUOUS: &str = "Frankfurt";
pub const FRANKFURT_MAIN: &str = "Frankfurt (Main)";
pub const FRANKFURT_ODER: &str = "Frankfurt (Oder)";

/// Disambiguate a bare "Frankfurt" cluster label: unqualified matches default
/// to Frankfurt (Main); when a qualified label is already present the bare
/// label is noise and is dropped.
pub fn resolve_frankfurt_conflict(mut clusters: BTreeSet<String>) -> BTreeSet<String> {
    if !clusters.remove(FRANKFURT_AMBIGUOUS) {
        return clusters;
    }
    if !clusters.contains(FRANKFURT_MAIN) && !clusters.contains(FRANKFURT_ODER) {
        clusters.insert(FRANKFURT_MAIN.to_string());
    }
    clusters
}

pub const CLOUD_LABEL: &str = "Cloud";

const CLOUD_PROVIDERS: [(&str, &str); 3] = [
    ("Google", "Google Cloud Platform"),
    ("Azure", "Microsoft Azure"),
    ("Amazon", "Amazon Web Services"),
];

/// For each cloud provider, the subset of `labels` that implies it.
pub fn link_skills_to_clouds(labels: &BTreeSet<String>) -> BTreeMap<String, BTreeSet<String>> {
    CLOUD_PROVIDERS
        .iter()
        .map(|(needle, provider)| {
            let matching: BTreeSet<String> = labels
                .iter()
                .filter(|label| label.contains(needle))
                .cloned()
                .collect();
            (provider.to_string(), matching)
        })
        .collect()
}

/// Add the high-level provider labels implied by the matched skills, then the
/// generic "Cloud" label when any provider is present.
pub fn enrich_with_cloud_labels(
    mut skills: BTreeSet<String>,
    clouds: &BTreeMap<String, BTreeSet<String>>,
) -> BTreeSet<String> {
    for (provider, provider_skills) in clouds {
        if !skills.is_disjoint(provider_skills) {
            skills.insert(provider.clone());
        }
    }
    if clouds.keys().any(|provider| skills.contains(provider)) {
        skills.insert(CLOUD_LABEL.to_string());
    }
    skills
}

/// `ceil(months / 12)`, preserving null.
pub fn years_of_experience(months: Option<f64>) -> Option<i32> {
    months.map(|months| (months / 12.0).ceil() as i32)
}
