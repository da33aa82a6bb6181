//! Defender Engine
//!
//! Naxsi-style WAF rule engine. Strictly two-phase: the directive
//! compiler runs once at server start and seals an immutable [`RuleSet`];
//! the runtime scanner then walks every request's zones against it and
//! yields an allow/log/block/drop disposition. The host HTTP server owns
//! request acquisition and response handling.

pub mod config;
pub mod error;
pub mod events;
pub mod libinjection;
pub mod parser;
pub mod request;
pub mod scanner;
pub mod types;
pub mod whitelist;

use std::sync::Arc;
use tracing::warn;

// Re-export commonly used types
pub use config::{EngineConfig, LogFormat, MatchLogConfig, RuleDirectives};
pub use error::{DefenderError, Result};
pub use events::{MatchEvent, MatchLog, MatchedRule};
pub use libinjection::{HeuristicOracle, InjectionOracle};
pub use parser::RuleCompiler;
pub use request::HttpRequest;
pub use scanner::{Disposition, RuntimeScanner};
pub use types::{CheckRule, HttpRule, MatchZone, Pattern, RuleSet, WhitelistEntry};

/// Engine facade tying configuration, compiled rules, oracles, and the
/// match log together the way a host server embeds them.
pub struct Defender {
    config: EngineConfig,
    rules: Option<Arc<RuleSet>>,
    match_log: Option<MatchLog>,
    oracle: Box<dyn InjectionOracle>,
}

impl Defender {
    /// Validate the configuration and open the match log. Rules are
    /// compiled separately via [`Defender::compile`]; until then every
    /// request is answered with [`Disposition::Unavailable`].
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate().map_err(DefenderError::Config)?;
        let match_log = MatchLog::open(&config.match_log)?;

        Ok(Self {
            config,
            rules: None,
            match_log,
            oracle: Box::new(HeuristicOracle::new()),
        })
    }

    /// Replace the bundled heuristic oracle, e.g. with a libinjection binding.
    pub fn with_oracle(mut self, oracle: Box<dyn InjectionOracle>) -> Self {
        self.oracle = oracle;
        self
    }

    /// Compile the directive streams into the sealed rule set.
    ///
    /// Broken directives are logged and skipped; compilation itself
    /// cannot fail.
    pub fn compile(&mut self, directives: &RuleDirectives) {
        let mut compiler = RuleCompiler::new();
        compiler.parse_main_rules(&directives.main_rules);
        compiler.parse_check_rules(&directives.check_rules);
        compiler.parse_basic_rules(&directives.basic_rules);
        self.rules = Some(Arc::new(compiler.finalize()));
    }

    /// The sealed rule set, shareable across request workers.
    pub fn rule_set(&self) -> Option<Arc<RuleSet>> {
        self.rules.clone()
    }

    /// Scan one request and write the audit record if it matched.
    /// Always yields a disposition; engine errors never cross the
    /// request boundary.
    pub fn handle(&self, req: &HttpRequest) -> Disposition {
        let rules = match &self.rules {
            Some(rules) => rules,
            None => return Disposition::Unavailable,
        };

        let oracle = if self.config.libinjection_enabled() {
            Some(self.oracle.as_ref())
        } else {
            None
        };

        let mut scanner = RuntimeScanner::new(rules, &self.config, oracle);
        let disposition = scanner.scan(req);

        if let Some(event) = scanner.event(req) {
            if let Some(log) = &self.match_log {
                if let Err(e) = log.write(&event) {
                    warn!(error = %e, "Failed to write match log record");
                }
            }
        }

        disposition
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_imports() {
        // Simple test to ensure all public types resolve
        let _ = std::any::type_name::<EngineConfig>();
        let _ = std::any::type_name::<RuleSet>();
        let _ = std::any::type_name::<RuntimeScanner<'static>>();
        let _ = std::any::type_name::<Disposition>();
    }

    #[test]
    fn test_unconfigured_engine_is_unavailable() {
        let defender = Defender::new(EngineConfig::default()).unwrap();
        let req = HttpRequest {
            method: "GET".to_string(),
            uri: "/".to_string(),
            ..Default::default()
        };
        assert_eq!(defender.handle(&req), Disposition::Unavailable);
    }
}
