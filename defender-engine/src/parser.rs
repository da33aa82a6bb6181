//! Directive compiler: turns the flat `MainRule`/`CheckRule`/`BasicRule`
//! token streams into an immutable [`RuleSet`].
//!
//! Per-rule errors are logged and the rule skipped; compilation always
//! runs to completion so one bad directive cannot take the server down.

use regex::Regex;
use std::collections::HashMap;
use tracing::{info, warn};

use crate::types::{
    CheckRule, Comparator, CustomLocation, HttpRule, LocationKind, LocationTarget, Pattern,
    RuleAction, RuleKind, RuleSet, SQLI_RULE_ID, XSS_RULE_ID,
};
use crate::whitelist;

/// Compiles directive streams; consumed by [`RuleCompiler::finalize`]
pub struct RuleCompiler {
    generic_rules: Vec<HttpRule>,
    args_rules: Vec<HttpRule>,
    header_rules: Vec<HttpRule>,
    body_rules: Vec<HttpRule>,
    whitelist_rules: Vec<HttpRule>,
    check_rules: HashMap<String, CheckRule>,
    internal_rules: HashMap<u32, HttpRule>,
}

impl RuleCompiler {
    /// Create a compiler with the synthetic oracle rules (17, 18) preloaded
    /// so whitelists on them behave like any pattern rule.
    pub fn new() -> Self {
        let mut internal_rules = HashMap::new();

        let mut libsqli = HttpRule::new(RuleKind::Main);
        libsqli.id = SQLI_RULE_ID;
        libsqli.log_msg = "libinjection_sql".to_string();
        libsqli.scores.push(("$SQL".to_string(), 8));
        internal_rules.insert(libsqli.id, libsqli);

        let mut libxss = HttpRule::new(RuleKind::Main);
        libxss.id = XSS_RULE_ID;
        libxss.log_msg = "libinjection_xss".to_string();
        libxss.scores.push(("$XSS".to_string(), 8));
        internal_rules.insert(libxss.id, libxss);

        Self {
            generic_rules: Vec::new(),
            args_rules: Vec::new(),
            header_rules: Vec::new(),
            body_rules: Vec::new(),
            whitelist_rules: Vec::new(),
            check_rules: HashMap::new(),
            internal_rules,
        }
    }

    /// Parse the MainRule token stream
    ///
    /// Stride 5 per rule, plus an optional leading `negative` and an
    /// optional trailing `;` (nginx-style configs keep the semicolon,
    /// Apache-style ones do not).
    pub fn parse_main_rules<S: AsRef<str>>(&mut self, tokens: &[S]) {
        let mut loaded = 0usize;
        let mut i = 0usize;

        while i < tokens.len() {
            if tokens[i].as_ref() == ";" {
                i += 1;
                continue;
            }

            let mut rule = HttpRule::new(RuleKind::Main);
            let mut error = false;

            if tokens[i].as_ref() == "negative" {
                rule.negative = true;
                i += 1;
            }

            if i + 5 > tokens.len() {
                warn!(position = i, "Truncated MainRule directive, remainder ignored");
                break;
            }

            let pattern_tok = tokens[i].as_ref();
            if let Some(src) = pattern_tok.strip_prefix("rx:") {
                match Regex::new(src) {
                    Ok(re) => rule.pattern = Some(Pattern::Regex(re)),
                    Err(e) => {
                        warn!(pattern = src, error = %e, "regex_error in MainRule pattern");
                        error = true;
                    }
                }
            } else if let Some(lit) = pattern_tok.strip_prefix("str:") {
                rule.pattern = Some(Pattern::Literal(lit.to_lowercase()));
            } else {
                warn!(token = pattern_tok, "MainRule pattern must be rx: or str:");
                error = true;
            }

            match tokens[i + 1].as_ref().strip_prefix("msg:") {
                Some(msg) => rule.log_msg = msg.to_string(),
                None => {
                    warn!(token = tokens[i + 1].as_ref(), "MainRule missing msg: field");
                    error = true;
                }
            }

            match tokens[i + 2].as_ref().strip_prefix("mz:") {
                Some(raw) => Self::parse_match_zone(&mut rule, raw.trim_end_matches(';')),
                None => {
                    warn!(token = tokens[i + 2].as_ref(), "MainRule missing mz: field");
                    error = true;
                }
            }

            match tokens[i + 3].as_ref().strip_prefix("s:") {
                Some(raw) => {
                    if !Self::parse_scores(&mut rule, raw) {
                        error = true;
                    }
                }
                None => {
                    warn!(token = tokens[i + 3].as_ref(), "MainRule missing s: field");
                    error = true;
                }
            }

            let id_tok = tokens[i + 4].as_ref().trim_end_matches(';');
            match id_tok.strip_prefix("id:").and_then(|v| v.parse::<u32>().ok()) {
                Some(id) => rule.id = id,
                None => {
                    warn!(token = id_tok, "MainRule missing or invalid id: field");
                    error = true;
                }
            }

            i += 5;
            if tokens.get(i).map(|t| t.as_ref()) == Some(";") {
                i += 1;
            }

            if error {
                warn!(rule_id = rule.id, "MainRule skipped");
                continue;
            }

            self.insert_main_rule(rule);
            loaded += 1;
        }

        info!(count = loaded, "MainRules loaded");
    }

    /// Parse the CheckRule token stream: `["<tag> <cmp> <limit>", "<ACTION>;"]`
    pub fn parse_check_rules<S: AsRef<str>>(&mut self, tokens: &[S]) {
        let mut loaded = 0usize;

        for chunk in tokens.chunks(2) {
            if chunk.len() < 2 {
                warn!("Truncated CheckRule directive, remainder ignored");
                break;
            }

            let equation = chunk[0].as_ref();
            let parts: Vec<&str> = equation.split_whitespace().collect();
            if parts.len() != 3 {
                warn!(equation, "CheckRule equation must be '<tag> <cmp> <limit>'");
                continue;
            }

            let comparator = match parts[1] {
                ">=" => Comparator::GreaterEqual,
                ">" => Comparator::Greater,
                "<=" => Comparator::LessEqual,
                "<" => Comparator::Less,
                other => {
                    warn!(comparator = other, "CheckRule skipped: unknown comparator");
                    continue;
                }
            };

            let limit = match parts[2].parse::<i32>() {
                Ok(limit) => limit,
                Err(_) => {
                    warn!(limit = parts[2], "CheckRule skipped: invalid limit");
                    continue;
                }
            };

            let action_tok = chunk[1].as_ref().trim_end_matches(';');
            let action = match action_tok {
                "BLOCK" => RuleAction::Block,
                "DROP" => RuleAction::Drop,
                "ALLOW" => RuleAction::Allow,
                "LOG" => RuleAction::Log,
                other => {
                    warn!(action = other, "CheckRule skipped: unknown action");
                    continue;
                }
            };

            self.check_rules.insert(
                parts[0].to_string(),
                CheckRule {
                    comparator,
                    limit,
                    action,
                },
            );
            loaded += 1;
        }

        info!(count = loaded, "CheckRules loaded");
    }

    /// Parse the BasicRule (whitelist) token stream
    ///
    /// `wl:<idlist>` alone (trailing `;`) disables the listed IDs with no
    /// zone restriction; otherwise an `mz:` token follows.
    pub fn parse_basic_rules<S: AsRef<str>>(&mut self, tokens: &[S]) {
        let mut loaded = 0usize;
        let mut i = 0usize;

        while i < tokens.len() {
            let tok = tokens[i].as_ref();
            if tok == ";" {
                i += 1;
                continue;
            }

            let raw_wl = match tok.strip_prefix("wl:") {
                Some(raw) => raw,
                None => {
                    warn!(token = tok, "BasicRule must start with wl:");
                    i += 1;
                    continue;
                }
            };

            let no_mz = raw_wl.ends_with(';');
            let ids = Self::parse_id_list(raw_wl.trim_end_matches(';'));

            let mut rule = HttpRule::new(RuleKind::Basic);
            rule.whitelist = true;

            if no_mz {
                if let Some(ids) = ids {
                    rule.wl_ids = ids;
                    rule.has_mz = false;
                    self.whitelist_rules.push(rule);
                    loaded += 1;
                } else {
                    warn!(ids = raw_wl, "BasicRule skipped: invalid id list");
                }
                i += 1;
                continue;
            }

            let mz_tok = tokens.get(i + 1).map(|t| t.as_ref());
            let raw_mz = match mz_tok.and_then(|t| t.strip_prefix("mz:")) {
                Some(raw) => raw.trim_end_matches(';'),
                None => {
                    warn!(ids = raw_wl, "BasicRule skipped: missing match zone");
                    i += 1;
                    continue;
                }
            };

            match ids {
                Some(ids) => {
                    rule.wl_ids = ids;
                    Self::parse_match_zone(&mut rule, raw_mz);
                    self.whitelist_rules.push(rule);
                    loaded += 1;
                }
                None => warn!(ids = raw_wl, "BasicRule skipped: invalid id list"),
            }

            i += 2;
            if tokens.get(i).map(|t| t.as_ref()) == Some(";") {
                i += 1;
            }
        }

        info!(count = loaded, "BasicRules loaded");
    }

    /// Seal the rule set: build the whitelist indexes and hand everything over.
    pub fn finalize(self) -> RuleSet {
        let mut rules = RuleSet {
            generic_rules: self.generic_rules,
            args_rules: self.args_rules,
            header_rules: self.header_rules,
            body_rules: self.body_rules,
            check_rules: self.check_rules,
            internal_rules: self.internal_rules,
            ..Default::default()
        };

        whitelist::build_index(self.whitelist_rules, &mut rules);

        info!(
            generic = rules.generic_rules.len(),
            args = rules.args_rules.len(),
            headers = rules.header_rules.len(),
            body = rules.body_rules.len(),
            whitelisted = rules.wl_url.len()
                + rules.wl_args.len()
                + rules.wl_body.len()
                + rules.wl_headers.len(),
            rx_whitelists = rules.rxmz_whitelists.len(),
            disabled = rules.disabled_rules.len(),
            "Rule set sealed"
        );

        rules
    }

    /// Parse an `mz:` value: `|`-separated coarse zones and custom locations.
    fn parse_match_zone(rule: &mut HttpRule, raw: &str) {
        for mz in raw.split('|') {
            if !mz.starts_with('$') {
                match mz {
                    "ARGS" => rule.mz.args = true,
                    "HEADERS" => rule.mz.headers = true,
                    "URL" => rule.mz.url = true,
                    "BODY" => rule.mz.body = true,
                    // a body rule that only ever sees uploaded file names
                    "FILE_EXT" => rule.mz.file_ext = true,
                    "NAME" => rule.mz.target_name = true,
                    "" => {}
                    other => warn!(zone = other, "Unknown match zone ignored"),
                }
                continue;
            }

            let (kind_tok, target) = match mz.split_once(':') {
                Some(split) => split,
                None => {
                    warn!(token = mz, "Custom location missing target, ignored");
                    continue;
                }
            };

            let (kind, is_rx) = match kind_tok {
                "$ARGS_VAR" => (LocationKind::ArgsVar, false),
                "$HEADERS_VAR" => (LocationKind::HeadersVar, false),
                "$URL" => (LocationKind::Url, false),
                "$BODY_VAR" => (LocationKind::BodyVar, false),
                "$ARGS_VAR_X" => (LocationKind::ArgsVar, true),
                "$HEADERS_VAR_X" => (LocationKind::HeadersVar, true),
                "$URL_X" => (LocationKind::Url, true),
                "$BODY_VAR_X" => (LocationKind::BodyVar, true),
                other => {
                    warn!(kind = other, "Unknown custom location kind ignored");
                    continue;
                }
            };

            match kind {
                LocationKind::ArgsVar => rule.mz.args_var = true,
                LocationKind::HeadersVar => rule.mz.headers_var = true,
                LocationKind::BodyVar => rule.mz.body_var = true,
                LocationKind::Url => rule.mz.specific_url = true,
            }

            let target = if is_rx {
                rule.mz.rx_mz = true;
                // anchored: a regex location must cover the whole candidate
                match Regex::new(&format!("^(?:{target})$")) {
                    Ok(re) => LocationTarget::Regex(re),
                    Err(e) => {
                        warn!(pattern = target, error = %e, "regex_error in custom location");
                        continue;
                    }
                }
            } else {
                LocationTarget::Literal(target.to_lowercase())
            };

            rule.mz.locations.push(CustomLocation { kind, target });
        }
    }

    fn parse_scores(rule: &mut HttpRule, raw: &str) -> bool {
        for sc in raw.split(',') {
            let (tag, points) = match sc.split_once(':') {
                Some(split) => split,
                None => {
                    warn!(score = sc, "Score must be '<tag>:<points>'");
                    return false;
                }
            };
            match points.parse::<i32>() {
                Ok(points) => rule.scores.push((tag.to_string(), points)),
                Err(_) => {
                    warn!(score = sc, "Invalid score value");
                    return false;
                }
            }
        }
        true
    }

    fn parse_id_list(raw: &str) -> Option<Vec<i32>> {
        if raw.is_empty() {
            return None;
        }
        raw.split(',')
            .map(|id| id.trim().parse::<i32>().ok())
            .collect()
    }

    /// Push the rule into every zone vector its match-zone flags dictate,
    /// once per vector.
    fn insert_main_rule(&mut self, rule: HttpRule) {
        let mz = &rule.mz;
        if mz.headers || mz.headers_var {
            self.header_rules.push(rule.clone());
        }
        if mz.body || mz.body_var || mz.file_ext {
            self.body_rules.push(rule.clone());
        }
        if mz.url {
            self.generic_rules.push(rule.clone());
        }
        if mz.args || mz.args_var {
            self.args_rules.push(rule);
        }
    }
}

impl Default for RuleCompiler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MatchZone;

    fn toks(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_main_rule_lands_in_each_flagged_zone() {
        let mut compiler = RuleCompiler::new();
        compiler.parse_main_rules(&toks(&[
            "str:union",
            "msg:sql keyword",
            "mz:BODY|URL|ARGS",
            "s:$SQL:4",
            "id:1000",
        ]));
        let rules = compiler.finalize();

        assert_eq!(rules.args_rules.len(), 1);
        assert_eq!(rules.body_rules.len(), 1);
        assert_eq!(rules.generic_rules.len(), 1);
        assert!(rules.header_rules.is_empty());
        assert_eq!(rules.args_rules[0].id, 1000);
        assert_eq!(rules.args_rules[0].scores, vec![("$SQL".to_string(), 4)]);
    }

    #[test]
    fn test_custom_location_routes_rule() {
        let mut compiler = RuleCompiler::new();
        compiler.parse_main_rules(&toks(&[
            "str:x",
            "msg:m",
            "mz:$HEADERS_VAR:cookie",
            "s:$T:1",
            "id:1001",
        ]));
        let rules = compiler.finalize();

        assert_eq!(rules.header_rules.len(), 1);
        assert!(rules.args_rules.is_empty());
        let rule = &rules.header_rules[0];
        assert!(rule.mz.headers_var);
        assert_eq!(rule.mz.locations.len(), 1);
        assert_eq!(rule.mz.locations[0].literal(), Some("cookie"));
    }

    #[test]
    fn test_negative_and_semicolon_tokens() {
        let mut compiler = RuleCompiler::new();
        compiler.parse_main_rules(&toks(&[
            "negative",
            "rx:multipart/form-data|application/x-www-form-urlencoded",
            "msg:content-type check",
            "mz:$HEADERS_VAR:content-type",
            "s:$EVADE:4",
            "id:1002",
            ";",
            "str:zzz",
            "msg:second",
            "mz:ARGS",
            "s:$T:1",
            "id:1003",
        ]));
        let rules = compiler.finalize();

        assert_eq!(rules.header_rules.len(), 1);
        assert!(rules.header_rules[0].negative);
        assert_eq!(rules.args_rules.len(), 1);
        assert_eq!(rules.args_rules[0].id, 1003);
    }

    #[test]
    fn test_bad_regex_skips_rule_keeps_rest() {
        let mut compiler = RuleCompiler::new();
        compiler.parse_main_rules(&toks(&[
            "rx:+[invalid",
            "msg:broken",
            "mz:ARGS",
            "s:$T:1",
            "id:1004",
            "str:ok",
            "msg:fine",
            "mz:ARGS",
            "s:$T:1",
            "id:1005",
        ]));
        let rules = compiler.finalize();

        assert_eq!(rules.args_rules.len(), 1);
        assert_eq!(rules.args_rules[0].id, 1005);
    }

    #[test]
    fn test_file_ext_implies_body() {
        let mut compiler = RuleCompiler::new();
        compiler.parse_main_rules(&toks(&[
            "rx:\\.ph.?$",
            "msg:php upload",
            "mz:FILE_EXT",
            "s:$UPLOAD:8",
            "id:1006",
        ]));
        let rules = compiler.finalize();

        assert_eq!(rules.body_rules.len(), 1);
        assert!(rules.body_rules[0].mz.file_ext);
        // FILE_EXT candidates walk the body vector but plain body values
        // must not trip the rule
        assert!(!rules.body_rules[0].mz.targets_zone(MatchZone::Body));
        assert!(rules.body_rules[0].mz.targets_zone(MatchZone::FileExt));
    }

    #[test]
    fn test_check_rule_parsing() {
        let mut compiler = RuleCompiler::new();
        compiler.parse_check_rules(&toks(&[
            "$SQL >= 8",
            "BLOCK;",
            "$XSS > 4",
            "LOG;",
            "$BAD ~ 1",
            "BLOCK;",
        ]));
        let rules = compiler.finalize();

        assert_eq!(rules.check_rules.len(), 2);
        let sql = &rules.check_rules["$SQL"];
        assert_eq!(sql.comparator, Comparator::GreaterEqual);
        assert_eq!(sql.limit, 8);
        assert_eq!(sql.action, RuleAction::Block);
        assert!(!rules.check_rules.contains_key("$BAD"));
    }

    #[test]
    fn test_basic_rule_without_zone_disables_globally() {
        let mut compiler = RuleCompiler::new();
        compiler.parse_basic_rules(&toks(&["wl:1000,1001;"]));
        let rules = compiler.finalize();

        assert_eq!(rules.disabled_rules.len(), 1);
        assert!(!rules.disabled_rules[0].has_mz);
        assert_eq!(rules.disabled_rules[0].wl_ids, vec![1000, 1001]);
    }

    #[test]
    fn test_basic_rule_with_zone() {
        let mut compiler = RuleCompiler::new();
        compiler.parse_basic_rules(&toks(&["wl:1000", "mz:$ARGS_VAR:x;"]));
        let rules = compiler.finalize();

        assert_eq!(rules.wl_args.len(), 1);
        let wl = rules.wl_args.get("x").expect("keyed by var name");
        assert_eq!(wl.zone, MatchZone::Args);
        assert_eq!(wl.ids, vec![1000]);
        assert!(!wl.uri_only);
    }

    #[test]
    fn test_bad_id_list_skips_whitelist() {
        let mut compiler = RuleCompiler::new();
        compiler.parse_basic_rules(&toks(&["wl:10a0;", "wl:2000;"]));
        let rules = compiler.finalize();

        assert_eq!(rules.disabled_rules.len(), 1);
        assert_eq!(rules.disabled_rules[0].wl_ids, vec![2000]);
    }

    #[test]
    fn test_internal_rules_present() {
        let rules = RuleCompiler::new().finalize();
        assert_eq!(rules.internal_rules[&17].scores, vec![("$SQL".to_string(), 8)]);
        assert_eq!(rules.internal_rules[&18].scores, vec![("$XSS".to_string(), 8)]);
    }
}
