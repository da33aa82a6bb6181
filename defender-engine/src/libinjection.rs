//! SQLi/XSS oracles behind internal rules 17 and 18.
//!
//! The engine only needs a boolean answer per value; hosts that link a
//! real libinjection binding implement [`InjectionOracle`] over it. The
//! bundled [`HeuristicOracle`] is a regex approximation good enough for
//! default deployments and tests.

use regex::Regex;
use tracing::warn;

/// Boolean attack heuristic consulted once per scanned value
pub trait InjectionOracle: Send + Sync {
    fn is_sqli(&self, input: &str) -> bool;
    fn is_xss(&self, input: &str) -> bool;
}

/// Regex-based oracle standing in for libinjection
pub struct HeuristicOracle {
    sql_patterns: Vec<Regex>,
    xss_patterns: Vec<Regex>,
}

impl HeuristicOracle {
    pub fn new() -> Self {
        let sql_patterns = compile(&[
            "(?i)(union\\s+select)",
            "(?i)(select\\s+.*\\s+from)",
            "(?i)(insert\\s+into)",
            "(?i)(delete\\s+from)",
            "(?i)(drop\\s+table)",
            "(?i)('\\s*or\\s+\\d+\\s*=\\s*\\d+)",
            "(?i)(or\\s+1\\s*=\\s*1)",
            "(?i)(and\\s+1\\s*=\\s*1)",
            "(?i)(exec\\s*\\()",
            "(?i)(sp_executesql)",
            "(?i)(xp_cmdshell)",
            "(?i)(benchmark\\s*\\()",
            "(?i)(sleep\\s*\\()",
            "(?i)(waitfor\\s+delay)",
        ]);

        let xss_patterns = compile(&[
            "(?i)<script[^>]*>",
            "(?i)</script>",
            "(?i)<iframe[^>]*>",
            "(?i)<object[^>]*>",
            "(?i)<embed[^>]*>",
            "(?i)javascript:",
            "(?i)vbscript:",
            "(?i)onload\\s*=",
            "(?i)onerror\\s*=",
            "(?i)onclick\\s*=",
            "(?i)onmouseover\\s*=",
            "(?i)onfocus\\s*=",
            "(?i)expression\\s*\\(",
            "(?i)<img[^>]*src\\s*=\\s*['\"]?javascript:",
        ]);

        Self {
            sql_patterns,
            xss_patterns,
        }
    }
}

impl Default for HeuristicOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl InjectionOracle for HeuristicOracle {
    fn is_sqli(&self, input: &str) -> bool {
        self.sql_patterns.iter().any(|p| p.is_match(input))
    }

    fn is_xss(&self, input: &str) -> bool {
        self.xss_patterns.iter().any(|p| p.is_match(input))
    }
}

fn compile(sources: &[&str]) -> Vec<Regex> {
    let mut compiled = Vec::with_capacity(sources.len());
    for source in sources {
        match Regex::new(source) {
            Ok(regex) => compiled.push(regex),
            Err(e) => warn!(pattern = source, error = %e, "Failed to compile oracle pattern"),
        }
    }
    compiled
}
