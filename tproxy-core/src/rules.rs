use regex::Regex;
use tproxy_config::Rule;
use tracing::warn;

/// Port used for an upstream proxy action written without one.
pub const DEFAULT_PROXY_PORT: u16 = 3128;

/// What to do with a flow once its host name is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Connect straight to the host on the destination port
    Direct,
    /// Close the client connection without forwarding
    Drop,
    /// Tunnel through an upstream HTTP CONNECT proxy
    Proxy { host: String, port: u16 },
}

impl Action {
    /// Parses a raw action string from configuration.
    ///
    /// `DIRECT` and `DROP` are matched case-sensitively; anything else is an
    /// upstream address `host[:port]`, split on the last colon so bracketed
    /// IPv6 hosts with an explicit port survive intact. A missing, empty, or
    /// unparseable port falls back to 3128.
    pub fn parse(raw: &str) -> Action {
        match raw {
            "DIRECT" => Action::Direct,
            "DROP" => Action::Drop,
            _ => {
                let (host, port) = match raw.rfind(':') {
                    Some(colon) => {
                        let port = raw[colon + 1..]
                            .parse::<u16>()
                            .ok()
                            .filter(|p| *p > 0)
                            .unwrap_or(DEFAULT_PROXY_PORT);
                        (raw[..colon].to_string(), port)
                    }
                    None => (raw.to_string(), DEFAULT_PROXY_PORT),
                };
                Action::Proxy { host, port }
            }
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Direct => write!(f, "DIRECT"),
            Action::Drop => write!(f, "DROP"),
            Action::Proxy { host, port } => write!(f, "{}:{}", host, port),
        }
    }
}

struct CompiledRule {
    pattern: Regex,
    action: Action,
}

/// The ordered rule list, compiled once at startup and shared read-only by
/// every connection handler.
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    /// Compiles the configured rules, preserving their order.
    ///
    /// A pattern that fails to compile is logged and dropped; the remaining
    /// rules stay live. An empty result (no rules configured, or none
    /// compiled) gets the `.* -> DIRECT` fallback so resolution always has
    /// at least one rule to consult.
    pub fn compile(rules: &[Rule]) -> Self {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            match Regex::new(&rule.pattern) {
                Ok(pattern) => compiled.push(CompiledRule {
                    pattern,
                    action: Action::parse(&rule.proxy),
                }),
                Err(e) => {
                    warn!(pattern = %rule.pattern, "Skipping unparseable rule pattern: {}", e);
                }
            }
        }

        if compiled.is_empty() {
            compiled.push(CompiledRule {
                pattern: Regex::new(".*").expect("fallback pattern"),
                action: Action::Direct,
            });
        }

        Self { rules: compiled }
    }

    /// Resolves a host name to an action: first matching rule wins, no match
    /// means `Direct`. Numeric hosts (the original-destination-IP fallback)
    /// match like any other string.
    pub fn resolve(&self, host: &str) -> Action {
        for rule in &self.rules {
            if rule.pattern.is_match(host) {
                return rule.action.clone();
            }
        }
        Action::Direct
    }

    /// Human-readable rule list for the startup log.
    pub fn describe(&self) -> Vec<String> {
        self.rules
            .iter()
            .enumerate()
            .map(|(i, r)| format!("rule {}: {} => {}", i, r.pattern.as_str(), r.action))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
