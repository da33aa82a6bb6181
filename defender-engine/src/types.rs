use regex::Regex;
use std::collections::HashMap;
use std::fmt;

/// Reserved rule id for a request the engine could not make sense of
pub const WEIRD_REQUEST_ID: u32 = 1;
/// Reserved rule id for a request body over the configured limit
pub const BIG_REQUEST_ID: u32 = 2;
/// Reserved rule id backing the SQL injection oracle
pub const SQLI_RULE_ID: u32 = 17;
/// Reserved rule id backing the XSS oracle
pub const XSS_RULE_ID: u32 = 18;

/// Region of an HTTP request a rule is allowed to inspect
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum MatchZone {
    Url,
    Args,
    Body,
    Headers,
    /// Marker for body rules that target uploaded file names
    FileExt,
    #[default]
    Unknown,
}

impl MatchZone {
    /// FILE_EXT rules really target the body; fold for whitelist lookups
    pub fn fold(self) -> MatchZone {
        match self {
            MatchZone::FileExt => MatchZone::Body,
            other => other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchZone::Url => "URL",
            MatchZone::Args => "ARGS",
            MatchZone::Body => "BODY",
            MatchZone::Headers => "HEADERS",
            MatchZone::FileExt => "FILE_EXT",
            MatchZone::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for MatchZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rule's match pattern: literal substring or compiled regex
#[derive(Debug, Clone)]
pub enum Pattern {
    /// Lowercased literal, matched by case-insensitive containment
    Literal(String),
    Regex(Regex),
}

impl Pattern {
    pub fn matches(&self, haystack: &str) -> bool {
        match self {
            Pattern::Literal(lit) => haystack.to_lowercase().contains(lit.as_str()),
            Pattern::Regex(re) => re.is_match(haystack),
        }
    }
}

/// Which request component a custom location names
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationKind {
    ArgsVar,
    HeadersVar,
    BodyVar,
    Url,
}

/// Custom location target: lowercased literal or anchored regex
#[derive(Debug, Clone)]
pub enum LocationTarget {
    Literal(String),
    Regex(Regex),
}

/// A finer-grained match-zone restriction naming a specific variable or URL
#[derive(Debug, Clone)]
pub struct CustomLocation {
    pub kind: LocationKind,
    pub target: LocationTarget,
}

impl CustomLocation {
    pub fn is_regex(&self) -> bool {
        matches!(self.target, LocationTarget::Regex(_))
    }

    /// Literal target for hashtable keying; None for regex locations
    pub fn literal(&self) -> Option<&str> {
        match &self.target {
            LocationTarget::Literal(lit) => Some(lit),
            LocationTarget::Regex(_) => None,
        }
    }

    /// Case-insensitive equality for literals, whole-string match for regexes
    pub fn matches(&self, candidate: &str) -> bool {
        match &self.target {
            LocationTarget::Literal(lit) => *lit == candidate.to_lowercase(),
            // targets are compiled with ^(?:...)$ anchors
            LocationTarget::Regex(re) => re.is_match(candidate),
        }
    }
}

/// Match-zone block attached to a rule (the `mz:` directive field)
#[derive(Debug, Clone, Default)]
pub struct MatchZoneSpec {
    pub args: bool,
    pub headers: bool,
    pub body: bool,
    pub url: bool,
    pub file_ext: bool,

    /// Derived flags set when a custom location of that kind is present
    pub args_var: bool,
    pub headers_var: bool,
    pub body_var: bool,
    pub specific_url: bool,

    /// Test the pattern against the variable's name rather than its value
    pub target_name: bool,
    /// At least one custom location is a regex (`_X` form)
    pub rx_mz: bool,

    pub locations: Vec<CustomLocation>,

    /// Single zone resolved by the whitelist indexer
    pub zone: MatchZone,
}

impl MatchZoneSpec {
    /// Does this spec cover the given scan zone?
    pub fn targets_zone(&self, zone: MatchZone) -> bool {
        match zone {
            MatchZone::Args => self.args || self.args_var,
            MatchZone::Headers => self.headers || self.headers_var,
            MatchZone::Body => self.body || self.body_var,
            MatchZone::Url => self.url,
            MatchZone::FileExt => self.file_ext,
            MatchZone::Unknown => false,
        }
    }

    /// True when any coarse zone flag is set; a zone block with none
    /// restricts nothing
    pub fn has_coarse_zone(&self) -> bool {
        self.args || self.headers || self.body || self.url || self.file_ext
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Main,
    Basic,
}

/// One compiled rule: an attack pattern (MainRule) or a whitelist (BasicRule)
#[derive(Debug, Clone)]
pub struct HttpRule {
    pub id: u32,
    pub kind: RuleKind,
    pub log_msg: String,
    /// MainRules carry a pattern; BasicRules never do
    pub pattern: Option<Pattern>,
    /// Invert the match sense: a pattern that does not appear is a hit
    pub negative: bool,
    pub mz: MatchZoneSpec,
    /// False for whitelists declared without any `mz:` block
    pub has_mz: bool,
    /// Score increments applied on a surviving hit, per tag
    pub scores: Vec<(String, i32)>,
    pub whitelist: bool,
    /// Rule IDs this whitelist excludes (0 = all, negative = all-but)
    pub wl_ids: Vec<i32>,
}

impl HttpRule {
    pub fn new(kind: RuleKind) -> Self {
        Self {
            id: 0,
            kind,
            log_msg: String::new(),
            pattern: None,
            negative: false,
            mz: MatchZoneSpec::default(),
            has_mz: true,
            scores: Vec::new(),
            whitelist: false,
            wl_ids: Vec::new(),
        }
    }
}

/// Score comparator in a CheckRule equation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    GreaterEqual,
    Greater,
    LessEqual,
    Less,
}

impl Comparator {
    pub fn eval(self, score: i32, limit: i32) -> bool {
        match self {
            Comparator::GreaterEqual => score >= limit,
            Comparator::Greater => score > limit,
            Comparator::LessEqual => score <= limit,
            Comparator::Less => score < limit,
        }
    }
}

/// Action taken when a check rule fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Block,
    Drop,
    Allow,
    Log,
}

/// Threshold rule mapping a tag's accumulated score to an action
#[derive(Debug, Clone)]
pub struct CheckRule {
    pub comparator: Comparator,
    pub limit: i32,
    pub action: RuleAction,
}

/// Aggregated whitelist hashtable entry
///
/// `name` is the composed lookup key (`[#]uri#name`, `[#]uri` or `[#]name`);
/// source whitelists sharing `(name, zone)` merge their `ids`.
#[derive(Debug, Clone)]
pub struct WhitelistEntry {
    pub name: String,
    pub zone: MatchZone,
    pub ids: Vec<i32>,
    /// The whitelist's only narrowing is a URL
    pub uri_only: bool,
    pub target_name: bool,
}

/// Compiled rule set: built once at startup, immutable and freely shared
#[derive(Debug, Default)]
pub struct RuleSet {
    /// Rules matching the URI itself
    pub generic_rules: Vec<HttpRule>,
    /// Rules matching query arguments
    pub args_rules: Vec<HttpRule>,
    pub header_rules: Vec<HttpRule>,
    /// Rules matching POST/PUT bodies (FILE_EXT rules included)
    pub body_rules: Vec<HttpRule>,

    pub wl_url: HashMap<String, WhitelistEntry>,
    pub wl_args: HashMap<String, WhitelistEntry>,
    pub wl_body: HashMap<String, WhitelistEntry>,
    pub wl_headers: HashMap<String, WhitelistEntry>,

    /// Whitelists with regex match zones, walked linearly at runtime
    pub rxmz_whitelists: Vec<HttpRule>,
    /// Whitelists with no custom location: their IDs are disabled wholesale
    pub disabled_rules: Vec<HttpRule>,

    /// Tag -> threshold rule
    pub check_rules: HashMap<String, CheckRule>,
    /// Synthetic rules backing the SQLi/XSS oracles (IDs 17 and 18)
    pub internal_rules: HashMap<u32, HttpRule>,
}

impl RuleSet {
    /// Rules scanned for a given zone (FILE_EXT candidates walk the body rules)
    pub fn zone_rules(&self, zone: MatchZone) -> &[HttpRule] {
        match zone {
            MatchZone::Url => &self.generic_rules,
            MatchZone::Args => &self.args_rules,
            MatchZone::Headers => &self.header_rules,
            MatchZone::Body | MatchZone::FileExt => &self.body_rules,
            MatchZone::Unknown => &[],
        }
    }

    /// Whitelist hashtable for a zone, with FILE_EXT folded to BODY
    pub fn whitelist_hash(&self, zone: MatchZone) -> Option<&HashMap<String, WhitelistEntry>> {
        match zone.fold() {
            MatchZone::Url => Some(&self.wl_url),
            MatchZone::Args => Some(&self.wl_args),
            MatchZone::Body => Some(&self.wl_body),
            MatchZone::Headers => Some(&self.wl_headers),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_pattern_is_case_insensitive() {
        let p = Pattern::Literal("union".to_string());
        assert!(p.matches("x UNION select"));
        assert!(p.matches("union"));
        assert!(!p.matches("uni on"));
    }

    #[test]
    fn test_regex_pattern_searches() {
        let p = Pattern::Regex(Regex::new(r"select\s+.*\s+from").unwrap());
        assert!(p.matches("select * from users"));
        assert!(!p.matches("selectfrom"));
    }

    #[test]
    fn test_file_ext_folds_to_body() {
        assert_eq!(MatchZone::FileExt.fold(), MatchZone::Body);
        assert_eq!(MatchZone::Args.fold(), MatchZone::Args);
    }

    #[test]
    fn test_literal_location_ignores_case() {
        let loc = CustomLocation {
            kind: LocationKind::ArgsVar,
            target: LocationTarget::Literal("password".to_string()),
        };
        assert!(loc.matches("PassWord"));
        assert!(!loc.matches("passwords"));
    }

    #[test]
    fn test_comparator_eval() {
        assert!(Comparator::GreaterEqual.eval(8, 8));
        assert!(!Comparator::Greater.eval(8, 8));
        assert!(Comparator::LessEqual.eval(0, 0));
        assert!(Comparator::Less.eval(-1, 0));
    }
}
