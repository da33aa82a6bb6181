//! Per-request runtime scanner.
//!
//! Walks every zone of one request against the sealed [`RuleSet`],
//! consults the whitelist resolver on each hit, accumulates per-tag
//! scores, and turns the check rules into a final disposition. One
//! scanner instance lives and dies with one request.

use chrono::Utc;
use metrics::counter;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::events::{MatchEvent, MatchedRule};
use crate::libinjection::InjectionOracle;
use crate::request::{self, HttpRequest};
use crate::types::{
    HttpRule, LocationKind, MatchZone, RuleAction, RuleSet, BIG_REQUEST_ID, SQLI_RULE_ID,
    WEIRD_REQUEST_ID, XSS_RULE_ID,
};
use crate::whitelist;

/// Final decision for a scanned request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Hand the request to the application
    Pass,
    /// Answer 403 Forbidden
    Block,
    /// Terminate the connection without a response
    Drop,
    /// No rule set compiled yet; answer 503
    Unavailable,
}

/// Scans one request against a compiled rule set
pub struct RuntimeScanner<'a> {
    rules: &'a RuleSet,
    config: &'a EngineConfig,
    oracle: Option<&'a dyn InjectionOracle>,

    /// Percent-decoded request path
    uri: String,
    match_scores: HashMap<String, i32>,
    rules_matched: u32,
    matched: Vec<MatchedRule>,

    block: bool,
    drop: bool,
    allow: bool,
    log: bool,
}

impl<'a> RuntimeScanner<'a> {
    pub fn new(
        rules: &'a RuleSet,
        config: &'a EngineConfig,
        oracle: Option<&'a dyn InjectionOracle>,
    ) -> Self {
        Self {
            rules,
            config,
            oracle,
            uri: String::new(),
            match_scores: HashMap::new(),
            rules_matched: 0,
            matched: Vec::new(),
            block: false,
            drop: false,
            allow: false,
            log: false,
        }
    }

    /// Run the full zone walk and return the disposition.
    pub fn scan(&mut self, req: &HttpRequest) -> Disposition {
        self.uri = request::percent_decode(&req.uri);

        let mut body_over_limit = false;
        if self.config.request_body_limit > 0 {
            if let Some(body) = &req.body {
                if body.len() as u64 > self.config.request_body_limit {
                    warn!(
                        size = body.len(),
                        limit = self.config.request_body_limit,
                        "Request body over limit"
                    );
                    counter!("defender_body_limit_exceeded", 1);
                    self.block = true;
                    self.rules_matched += 1;
                    self.matched.push(MatchedRule {
                        zone: MatchZone::Body.as_str().to_string(),
                        rule_id: BIG_REQUEST_ID,
                        var_name: String::new(),
                        content: "big request".to_string(),
                    });
                    body_over_limit = true;
                }
            }
        }

        self.scan_url();
        self.scan_args(req);
        self.scan_headers(req);
        if !body_over_limit {
            self.scan_body(req);
        }

        self.apply_check_rules();
        self.disposition()
    }

    /// Build the audit record, if this scan produced anything worth logging.
    pub fn event(&self, req: &HttpRequest) -> Option<MatchEvent> {
        if self.matched.is_empty() || !(self.block || self.drop || self.log) {
            return None;
        }

        let mut scores: Vec<(String, i32)> = self
            .match_scores
            .iter()
            .map(|(tag, score)| (tag.clone(), *score))
            .collect();
        scores.sort();

        Some(MatchEvent {
            timestamp: Utc::now(),
            client_ip: req.client_ip.clone(),
            uri: req.uri.clone(),
            learning: self.config.learning_mode,
            blocked: self.block,
            dropped: self.drop,
            scores,
            matched: self.matched.clone(),
        })
    }

    /// Accumulated score for a tag (0 when the tag never matched)
    pub fn score(&self, tag: &str) -> i32 {
        self.match_scores.get(tag).copied().unwrap_or(0)
    }

    pub fn rules_matched(&self) -> u32 {
        self.rules_matched
    }

    fn scan_url(&mut self) {
        let rules = self.rules;
        let uri = self.uri.clone();
        for rule in &rules.generic_rules {
            self.check_candidate(rule, MatchZone::Url, "", &uri);
        }
        self.check_oracles(MatchZone::Url, "", &uri);
    }

    fn scan_args(&mut self, req: &HttpRequest) {
        let query = match &req.query_string {
            Some(query) => query,
            None => return,
        };
        for (name, value) in request::parse_query(query) {
            self.scan_pair(MatchZone::Args, &name, &value);
        }
    }

    fn scan_headers(&mut self, req: &HttpRequest) {
        let rules = self.rules;
        for (name, value) in &req.headers {
            for rule in &rules.header_rules {
                self.check_candidate(rule, MatchZone::Headers, name, value);
            }
        }
    }

    fn scan_body(&mut self, req: &HttpRequest) {
        if !req.has_scannable_method() {
            return;
        }
        let body = match &req.body {
            Some(body) if !body.is_empty() => body,
            _ => return,
        };
        let content_type = req.content_type().unwrap_or("").to_string();
        let text = String::from_utf8_lossy(body).into_owned();

        if content_type.starts_with("application/x-www-form-urlencoded") {
            for (name, value) in request::parse_query(&text) {
                self.scan_pair(MatchZone::Body, &name, &value);
            }
        } else if content_type.starts_with("multipart/form-data") {
            match request::multipart_boundary(&content_type) {
                Some(boundary) => {
                    let boundary = boundary.to_string();
                    for part in request::parse_multipart(&text, &boundary) {
                        match &part.filename {
                            Some(filename) => {
                                self.scan_pair(MatchZone::FileExt, &part.name, filename)
                            }
                            None => self.scan_pair(MatchZone::Body, &part.name, &part.value),
                        }
                    }
                }
                None => self.unparseable_body(&text),
            }
        } else {
            // opaque content type: the whole body is one unnamed value
            self.scan_pair(MatchZone::Body, "", &text);
        }
    }

    fn scan_pair(&mut self, zone: MatchZone, name: &str, value: &str) {
        let rules = self.rules;
        for rule in rules.zone_rules(zone) {
            self.check_candidate(rule, zone, name, value);
        }
        if matches!(zone, MatchZone::Args | MatchZone::Body | MatchZone::Url) {
            self.check_oracles(zone, name, value);
        }
    }

    /// Test one rule against one (name, value) candidate.
    fn check_candidate(&mut self, rule: &HttpRule, zone: MatchZone, name: &str, value: &str) {
        if !rule.mz.targets_zone(zone) {
            return;
        }

        // custom locations narrow the rule: at least one location relevant
        // to this zone must match (URL locations test the request path)
        if !rule.mz.locations.is_empty() {
            let mut relevant = false;
            let mut located = false;
            for loc in &rule.mz.locations {
                if !location_applies(loc.kind, zone) {
                    continue;
                }
                relevant = true;
                let candidate = match loc.kind {
                    LocationKind::Url => self.uri.as_str(),
                    _ => name,
                };
                if loc.matches(candidate) {
                    located = true;
                    break;
                }
            }
            if relevant && !located {
                return;
            }
        }

        let pattern = match &rule.pattern {
            Some(pattern) => pattern,
            None => return,
        };
        let subject = if rule.mz.target_name { name } else { value };
        let mut hit = pattern.matches(subject);
        if rule.negative {
            hit = !hit;
        }
        if !hit {
            return;
        }

        self.record_hit(rule, zone, name, value);
    }

    fn check_oracles(&mut self, zone: MatchZone, name: &str, value: &str) {
        let oracle = match self.oracle {
            Some(oracle) => oracle,
            None => return,
        };
        if self.config.libinjection_sql && oracle.is_sqli(value) {
            self.oracle_hit(SQLI_RULE_ID, zone, name, value);
        }
        if self.config.libinjection_xss && oracle.is_xss(value) {
            self.oracle_hit(XSS_RULE_ID, zone, name, value);
        }
    }

    fn oracle_hit(&mut self, rule_id: u32, zone: MatchZone, name: &str, value: &str) {
        let rules = self.rules;
        if let Some(rule) = rules.internal_rules.get(&rule_id) {
            self.record_hit(rule, zone, name, value);
        }
    }

    /// Score a pattern hit, unless the whitelist corpus excludes it.
    fn record_hit(&mut self, rule: &HttpRule, zone: MatchZone, name: &str, value: &str) {
        if whitelist::is_rule_whitelisted(
            self.rules,
            &self.uri,
            rule,
            name,
            zone,
            rule.mz.target_name,
        ) {
            debug!(rule_id = rule.id, zone = %zone, "Hit suppressed by whitelist");
            counter!("defender_hits_whitelisted", 1);
            return;
        }

        for (tag, points) in &rule.scores {
            *self.match_scores.entry(tag.clone()).or_insert(0) += points;
        }
        self.rules_matched += 1;
        counter!("defender_rules_matched", 1);

        debug!(
            rule_id = rule.id,
            zone = %zone,
            var = name,
            msg = %rule.log_msg,
            "Rule matched"
        );

        self.matched.push(MatchedRule {
            zone: zone.as_str().to_string(),
            rule_id: rule.id,
            var_name: name.to_string(),
            content: truncated(value),
        });
    }

    fn unparseable_body(&mut self, text: &str) {
        warn!("Body could not be parsed for its declared content type");
        if self.config.fail_closed {
            self.block = true;
            self.rules_matched += 1;
            self.matched.push(MatchedRule {
                zone: MatchZone::Body.as_str().to_string(),
                rule_id: WEIRD_REQUEST_ID,
                var_name: String::new(),
                content: "unparseable body".to_string(),
            });
        } else {
            // fail open: scan the raw bytes as one value
            self.scan_pair(MatchZone::Body, "", text);
        }
    }

    fn apply_check_rules(&mut self) {
        let rules = self.rules;
        for (tag, check) in &rules.check_rules {
            let score = self.score(tag);
            if check.comparator.eval(score, check.limit) {
                debug!(
                    tag = %tag,
                    score,
                    limit = check.limit,
                    action = ?check.action,
                    "Check rule fired"
                );
                match check.action {
                    RuleAction::Block => self.block = true,
                    RuleAction::Drop => self.drop = true,
                    RuleAction::Allow => self.allow = true,
                    RuleAction::Log => self.log = true,
                }
            }
        }
    }

    fn disposition(&mut self) -> Disposition {
        if self.allow {
            return Disposition::Pass;
        }
        if self.drop {
            if self.config.learning_mode {
                self.log = true;
                return Disposition::Pass;
            }
            counter!("defender_requests_dropped", 1);
            return Disposition::Drop;
        }
        if self.block {
            if self.config.learning_mode {
                self.log = true;
                return Disposition::Pass;
            }
            counter!("defender_requests_blocked", 1);
            return Disposition::Block;
        }
        Disposition::Pass
    }
}

/// Which custom-location kinds constrain a candidate in this zone
fn location_applies(kind: LocationKind, zone: MatchZone) -> bool {
    match kind {
        LocationKind::Url => true,
        LocationKind::ArgsVar => zone == MatchZone::Args,
        LocationKind::HeadersVar => zone == MatchZone::Headers,
        LocationKind::BodyVar => matches!(zone, MatchZone::Body | MatchZone::FileExt),
    }
}

fn truncated(value: &str) -> String {
    const MAX_CONTENT: usize = 128;
    value.chars().take(MAX_CONTENT).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::RuleCompiler;

    fn toks(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    fn strict_config() -> EngineConfig {
        EngineConfig {
            learning_mode: false,
            ..Default::default()
        }
    }

    fn get_request(uri: &str, query: &str) -> HttpRequest {
        HttpRequest {
            method: "GET".to_string(),
            uri: uri.to_string(),
            query_string: Some(query.to_string()),
            client_ip: "127.0.0.1".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_negative_rule_fires_on_absence() {
        let mut compiler = RuleCompiler::new();
        compiler.parse_main_rules(&toks(&[
            "negative",
            "str:expected-token",
            "msg:token missing",
            "mz:$ARGS_VAR:auth",
            "s:$MISS:8",
            "id:1100",
        ]));
        compiler.parse_check_rules(&toks(&["$MISS >= 8", "BLOCK;"]));
        let rules = compiler.finalize();
        let config = strict_config();

        let mut scanner = RuntimeScanner::new(&rules, &config, None);
        let verdict = scanner.scan(&get_request("/login", "auth=expected-token"));
        assert_eq!(verdict, Disposition::Pass);

        let mut scanner = RuntimeScanner::new(&rules, &config, None);
        let verdict = scanner.scan(&get_request("/login", "auth=nope"));
        assert_eq!(verdict, Disposition::Block);
    }

    #[test]
    fn test_custom_location_gates_other_variables() {
        let mut compiler = RuleCompiler::new();
        compiler.parse_main_rules(&toks(&[
            "str:union",
            "msg:sql",
            "mz:$ARGS_VAR:q",
            "s:$SQL:8",
            "id:1000",
        ]));
        compiler.parse_check_rules(&toks(&["$SQL >= 8", "BLOCK;"]));
        let rules = compiler.finalize();
        let config = strict_config();

        let mut scanner = RuntimeScanner::new(&rules, &config, None);
        assert_eq!(
            scanner.scan(&get_request("/", "q=union")),
            Disposition::Block
        );

        let mut scanner = RuntimeScanner::new(&rules, &config, None);
        assert_eq!(
            scanner.scan(&get_request("/", "other=union")),
            Disposition::Pass
        );
    }

    #[test]
    fn test_oracle_hit_scores_internal_rule() {
        let rules = RuleCompiler::new().finalize();
        let mut config = strict_config();
        config.libinjection_sql = true;
        let oracle = crate::libinjection::HeuristicOracle::new();

        let mut scanner = RuntimeScanner::new(&rules, &config, Some(&oracle));
        scanner.scan(&get_request("/", "q=1 union select 2"));
        assert_eq!(scanner.score("$SQL"), 8);
        assert_eq!(scanner.rules_matched(), 1);
    }

    #[test]
    fn test_body_limit_blocks_unscanned() {
        let rules = RuleCompiler::new().finalize();
        let mut config = strict_config();
        config.request_body_limit = 8;

        let mut req = get_request("/upload", "");
        req.method = "POST".to_string();
        req.body = Some(vec![b'a'; 64]);

        let mut scanner = RuntimeScanner::new(&rules, &config, None);
        assert_eq!(scanner.scan(&req), Disposition::Block);
        let event = scanner.event(&req).expect("audit record");
        assert_eq!(event.matched[0].rule_id, BIG_REQUEST_ID);
    }
}
