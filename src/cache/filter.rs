//! Search filter, ordering, and paging types for node-cache queries.
//!
//! A `NodeSearchFilter` travels into the SQL layer twice: cheap column
//! predicates (ancestor seeds, share masks, sensitivity pruning) are compiled
//! into the recursive query, and the row-level predicate is evaluated by the
//! `matchfilter` SQL function against the filter installed for the
//! statement's duration.

use crate::node::{Handle, MimeCategory, NodeType, TAG_DELIMITER, UNDEF};

/// Tri-state boolean predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BoolFilter {
    #[default]
    Any,
    OnlyTrue,
    OnlyFalse,
}

impl BoolFilter {
    fn admits(self, value: bool) -> bool {
        match self {
            BoolFilter::Any => true,
            BoolFilter::OnlyTrue => value,
            BoolFilter::OnlyFalse => !value,
        }
    }
}

/// Sensitivity policy of a search. `ExcludeSensitive` also prunes whole
/// subtrees below a sensitive folder during recursive descent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SensitivityPolicy {
    #[default]
    Any,
    ExcludeSensitive,
    OnlySensitive,
}

/// Sort orders a query may request. Each value maps to a stable ORDER BY
/// clause; prepared statements are cached per order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SearchOrder {
    #[default]
    DefaultAsc,
    DefaultDesc,
    SizeAsc,
    SizeDesc,
    CtimeAsc,
    CtimeDesc,
    MtimeAsc,
    MtimeDesc,
    LabelAsc,
    LabelDesc,
    FavAsc,
    FavDesc,
}

impl SearchOrder {
    /// ORDER BY clause for this order. Folders first, then the requested
    /// criterion, names compared naturally and case-insensitively.
    pub fn clause(self) -> &'static str {
        match self {
            SearchOrder::DefaultAsc => "type DESC, name COLLATE NATURALNOCASE",
            SearchOrder::DefaultDesc => "type DESC, name COLLATE NATURALNOCASE DESC",
            SearchOrder::SizeAsc => "type DESC, sizeVirtual, name COLLATE NATURALNOCASE",
            SearchOrder::SizeDesc => "type DESC, sizeVirtual DESC, name COLLATE NATURALNOCASE DESC",
            SearchOrder::CtimeAsc => "type DESC, ctime, name COLLATE NATURALNOCASE",
            SearchOrder::CtimeDesc => "type DESC, ctime DESC, name COLLATE NATURALNOCASE DESC",
            SearchOrder::MtimeAsc => "type DESC, mtime, name COLLATE NATURALNOCASE",
            SearchOrder::MtimeDesc => "type DESC, mtime DESC, name COLLATE NATURALNOCASE DESC",
            SearchOrder::LabelAsc => {
                "CASE WHEN label = 0 THEN 1 ELSE 0 END ASC, label ASC, type DESC, \
                 name COLLATE NATURALNOCASE"
            }
            SearchOrder::LabelDesc => "label DESC, type DESC, name COLLATE NATURALNOCASE",
            // favourites sort inverted so flagged nodes lead the ascending order
            SearchOrder::FavAsc => "fav DESC, type DESC, name COLLATE NATURALNOCASE",
            SearchOrder::FavDesc => "fav, type DESC, name COLLATE NATURALNOCASE",
        }
    }
}

/// Page window of a query; `size == 0` means "everything".
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeSearchPage {
    pub offset: u64,
    pub size: u64,
}

impl NodeSearchPage {
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// LIMIT value for the statement; SQLite treats -1 as unlimited.
    pub fn limit(&self) -> i64 {
        if self.size == 0 { -1 } else { self.size as i64 }
    }
}

/// Row predicate plus descent parameters for children and recursive search.
#[derive(Debug, Clone, Default)]
pub struct NodeSearchFilter {
    name: String,
    description: String,
    tag: String,
    node_types: Vec<NodeType>,
    creation_lower: Option<i64>,
    creation_upper: Option<i64>,
    modification_lower: Option<i64>,
    modification_upper: Option<i64>,
    category: Option<MimeCategory>,
    sensitivity: SensitivityPolicy,
    fav: BoolFilter,
    ancestors: [Handle; 3],
    included_shares: u8,
    use_and_for_text_query: bool,
}

impl NodeSearchFilter {
    pub fn new() -> Self {
        Self {
            ancestors: [UNDEF; 3],
            ..Default::default()
        }
    }

    pub fn by_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn by_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn by_tag(mut self, tag: &str) -> Self {
        self.tag = tag.to_string();
        self
    }

    pub fn by_node_types(mut self, types: &[NodeType]) -> Self {
        self.node_types = types.to_vec();
        self
    }

    pub fn by_creation_time(mut self, lower: Option<i64>, upper: Option<i64>) -> Self {
        self.creation_lower = lower;
        self.creation_upper = upper;
        self
    }

    pub fn by_modification_time(mut self, lower: Option<i64>, upper: Option<i64>) -> Self {
        self.modification_lower = lower;
        self.modification_upper = upper;
        self
    }

    pub fn by_category(mut self, category: MimeCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn by_sensitivity(mut self, policy: SensitivityPolicy) -> Self {
        self.sensitivity = policy;
        self
    }

    pub fn by_fav(mut self, fav: BoolFilter) -> Self {
        self.fav = fav;
        self
    }

    /// Seeds of the recursive descent; at most three are honored.
    pub fn by_ancestors(mut self, ancestors: &[Handle]) -> Self {
        let mut seeds = [UNDEF; 3];
        for (slot, &handle) in seeds.iter_mut().zip(ancestors) {
            *slot = handle;
        }
        self.ancestors = seeds;
        self
    }

    /// Restrict to a single parent (used by the children query).
    pub fn by_parent(self, parent: Handle) -> Self {
        self.by_ancestors(&[parent])
    }

    pub fn by_included_shares(mut self, mask: u8) -> Self {
        self.included_shares = mask;
        self
    }

    /// Combine name/description/tag substring checks with AND instead of OR.
    pub fn use_and_for_text_query(mut self, yes: bool) -> Self {
        self.use_and_for_text_query = yes;
        self
    }

    pub fn ancestors(&self) -> &[Handle; 3] {
        &self.ancestors
    }

    pub fn parent(&self) -> Handle {
        self.ancestors[0]
    }

    pub fn included_shares(&self) -> u8 {
        self.included_shares
    }

    pub fn sensitivity(&self) -> SensitivityPolicy {
        self.sensitivity
    }

    pub fn has_node_type(&self) -> bool {
        !self.node_types.is_empty()
    }

    fn has_name(&self) -> bool {
        !self.name.is_empty()
    }

    fn has_description(&self) -> bool {
        !self.description.is_empty()
    }

    fn has_tag(&self) -> bool {
        !self.tag.is_empty()
    }

    fn is_valid_node_type(&self, node_type: i64) -> bool {
        NodeType::from_raw(node_type).is_some_and(|t| self.node_types.contains(&t))
    }

    fn is_valid_creation_time(&self, ctime: i64) -> bool {
        self.creation_lower.is_none_or(|lower| ctime >= lower)
            && self.creation_upper.is_none_or(|upper| ctime < upper)
    }

    fn is_valid_modification_time(&self, mtime: i64) -> bool {
        self.modification_lower.is_none_or(|lower| mtime >= lower)
            && self.modification_upper.is_none_or(|upper| mtime < upper)
    }

    fn is_valid_category(&self, mime: i64, node_type: i64) -> bool {
        // categories only ever match file nodes
        node_type == NodeType::File as i64
            && self.category.is_some_and(|c| c as i64 == mime)
    }

    fn is_valid_sensitivity(&self, sensitive: bool) -> bool {
        match self.sensitivity {
            SensitivityPolicy::Any => true,
            SensitivityPolicy::ExcludeSensitive => !sensitive,
            SensitivityPolicy::OnlySensitive => sensitive,
        }
    }

    fn is_valid_name(&self, name: &str) -> bool {
        contains_nocase(name, &self.name)
    }

    fn is_valid_description(&self, description: &str) -> bool {
        contains_nocase(description, &self.description)
    }

    /// Any tag of the comma-delimited sequence may match.
    fn is_valid_tag_sequence(&self, tags: &str) -> bool {
        tags.split(TAG_DELIMITER)
            .any(|tag| contains_nocase(tag, &self.tag))
    }

    /// Row predicate evaluated by the `matchfilter` SQL function. Column
    /// values arrive in declaration order; text columns may be NULL.
    pub fn matches_row(&self, row: &FilterRow<'_>) -> bool {
        if row.flags & crate::node::flags::IS_VERSION != 0 {
            return false;
        }
        if self.has_node_type() && !self.is_valid_node_type(row.node_type) {
            return false;
        }
        if !self.is_valid_creation_time(row.ctime) {
            return false;
        }
        if !self.is_valid_modification_time(row.mtime) {
            return false;
        }
        if self.category.is_some() && !self.is_valid_category(row.mime, row.node_type) {
            return false;
        }
        if !self.fav.admits(row.fav) {
            return false;
        }
        let sensitive = row.flags & crate::node::flags::IS_MARKED_SENSITIVE != 0;
        if !self.is_valid_sensitivity(sensitive) {
            return false;
        }

        let mut checks: Vec<bool> = Vec::new();
        if self.has_name() {
            checks.push(self.is_valid_name(row.name.unwrap_or("")));
        }
        if self.has_description() {
            checks.push(self.is_valid_description(row.description.unwrap_or("")));
        }
        if self.has_tag() {
            checks.push(self.is_valid_tag_sequence(row.tags.unwrap_or("")));
        }

        if checks.is_empty() {
            true
        } else if self.use_and_for_text_query {
            checks.iter().all(|&c| c)
        } else {
            checks.iter().any(|&c| c)
        }
    }
}

/// Column values `matchfilter` receives for one candidate row.
pub struct FilterRow<'a> {
    pub flags: u64,
    pub node_type: i64,
    pub ctime: i64,
    pub mtime: i64,
    pub mime: i64,
    pub name: Option<&'a str>,
    pub description: Option<&'a str>,
    pub tags: Option<&'a str>,
    pub fav: bool,
}

fn contains_nocase(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// Wildcard match with `*` matching any run of characters, case-insensitive.
/// Backs the `regexp` SQL function the tag query uses.
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    fn inner(p: &[char], t: &[char]) -> bool {
        match p.first() {
            None => t.is_empty(),
            Some('*') => {
                (0..=t.len()).any(|skip| inner(&p[1..], &t[skip..]))
            }
            Some(&c) => t
                .first()
                .is_some_and(|&tc| tc == c)
                .then(|| inner(&p[1..], &t[1..]))
                .unwrap_or(false),
        }
    }
    let p: Vec<char> = pattern.to_lowercase().chars().collect();
    let t: Vec<char> = text.to_lowercase().chars().collect();
    inner(&p, &t)
}

/// Surrounds a pattern with `*` unless already wildcarded at the edges.
pub fn ensure_asterisk_surround(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 2);
    if !pattern.starts_with('*') {
        out.push('*');
    }
    out.push_str(pattern);
    if !pattern.ends_with('*') {
        out.push('*');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row<'a>(name: &'a str, fav: bool) -> FilterRow<'a> {
        FilterRow {
            flags: 0,
            node_type: NodeType::File as i64,
            ctime: 1000,
            mtime: 1000,
            mime: MimeCategory::Document as i64,
            name: Some(name),
            description: None,
            tags: None,
            fav,
        }
    }

    #[test]
    fn name_substring_is_case_insensitive() {
        let filter = NodeSearchFilter::new()
            .by_name("budget")
            .use_and_for_text_query(true);
        assert!(filter.matches_row(&row("Budget 2023.pdf", true)));
        assert!(filter.matches_row(&row("budget 2024.pdf", false)));
        assert!(!filter.matches_row(&row("notes.txt", false)));
    }

    #[test]
    fn fav_only_narrows() {
        let filter = NodeSearchFilter::new()
            .by_name("budget")
            .by_fav(BoolFilter::OnlyTrue);
        assert!(filter.matches_row(&row("Budget 2023.pdf", true)));
        assert!(!filter.matches_row(&row("budget 2024.pdf", false)));
    }

    #[test]
    fn versions_never_match() {
        let filter = NodeSearchFilter::new();
        let mut r = row("anything", false);
        r.flags = crate::node::flags::IS_VERSION;
        assert!(!filter.matches_row(&r));
    }

    #[test]
    fn or_vs_and_for_text_checks() {
        let or_filter = NodeSearchFilter::new().by_name("zzz").by_tag("work");
        let and_filter = or_filter.clone().use_and_for_text_query(true);
        let mut r = row("notes.txt", false);
        r.tags = Some("work,home");
        assert!(or_filter.matches_row(&r));
        assert!(!and_filter.matches_row(&r));
    }

    #[test]
    fn time_windows_are_half_open() {
        let filter = NodeSearchFilter::new().by_creation_time(Some(1000), Some(2000));
        let mut r = row("x", false);
        assert!(filter.matches_row(&r));
        r.ctime = 2000;
        assert!(!filter.matches_row(&r));
        r.ctime = 999;
        assert!(!filter.matches_row(&r));
    }

    #[test]
    fn sensitivity_policies() {
        let mut r = row("x", false);
        r.flags = crate::node::flags::IS_MARKED_SENSITIVE;
        assert!(NodeSearchFilter::new().matches_row(&r));
        assert!(
            !NodeSearchFilter::new()
                .by_sensitivity(SensitivityPolicy::ExcludeSensitive)
                .matches_row(&r)
        );
        assert!(
            NodeSearchFilter::new()
                .by_sensitivity(SensitivityPolicy::OnlySensitive)
                .matches_row(&r)
        );
    }

    #[test]
    fn category_only_matches_files() {
        let filter = NodeSearchFilter::new().by_category(MimeCategory::Document);
        let mut r = row("notes.txt", false);
        assert!(filter.matches_row(&r));
        r.node_type = NodeType::Folder as i64;
        assert!(!filter.matches_row(&r));
    }

    #[test]
    fn wildcard_matching() {
        assert!(wildcard_match("*work*", "homework"));
        assert!(wildcard_match("*Work*", "WORKER"));
        assert!(!wildcard_match("*work*", "home"));
        assert!(wildcard_match("*", ""));
    }

    #[test]
    fn asterisk_surround() {
        assert_eq!(ensure_asterisk_surround("tag"), "*tag*");
        assert_eq!(ensure_asterisk_surround("*tag*"), "*tag*");
    }
}
