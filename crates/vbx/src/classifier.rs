//! 🕵️ Retry classifier: is this server-side error a vectorizer provider asking us to
//! slow down, or is it the record's own fault?
//!
//! The server relays whatever the embedding provider said, verbatim. So we sniff the
//! message against a `provider -> [regex]` table. Match = rate limit = retry later.
//! No match = terminal = the record goes to the failure map and stays there.

use std::collections::BTreeMap;

use regex::Regex;

/// 🏷️ What the classifier thinks of an error message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorClass {
    /// 🐢 A provider throttled us. Carries the provider name for the logs.
    RateLimited { provider: String },
    /// 💀 Not retryable.
    Terminal,
}

#[derive(Debug, Clone)]
pub struct RetryClassifier {
    providers: Vec<(String, Vec<Regex>)>,
}

const GENERIC: &str = "generic";

fn builtin_table() -> BTreeMap<String, Vec<String>> {
    let table: &[(&str, &[&str])] = &[
        ("openai", &[r"(?i)rate limit reached", r"(?i)rate_limit_exceeded"]),
        ("cohere", &[r"(?i)trial key", r"(?i)too many requests"]),
        ("google", &[r"RESOURCE_EXHAUSTED", r"(?i)quota exceeded"]),
        (GENERIC, &[r"(?i)rate[ _-]?limit", r"\b429\b"]),
    ];
    table
        .iter()
        .map(|(provider, patterns)| {
            (
                provider.to_string(),
                patterns.iter().map(|p| p.to_string()).collect(),
            )
        })
        .collect()
}

impl RetryClassifier {
    /// 🏗️ The built-in table plus `extra`. Extra patterns for a known provider are added
    /// next to the built-in ones, never instead of them.
    pub fn new(extra: &BTreeMap<String, Vec<String>>) -> Result<Self, regex::Error> {
        let mut table = builtin_table();
        for (provider, patterns) in extra {
            table
                .entry(provider.clone())
                .or_default()
                .extend(patterns.iter().cloned());
        }
        let mut providers = table
            .into_iter()
            .map(|(provider, patterns)| {
                let compiled = patterns
                    .iter()
                    .map(|pattern| Regex::new(pattern))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok((provider, compiled))
            })
            .collect::<Result<Vec<_>, regex::Error>>()?;
        // -- catch-all goes last so the logs name the real provider when there is one
        providers.sort_by_key(|(provider, _)| provider == GENERIC);
        Ok(Self { providers })
    }

    pub fn classify(&self, message: &str) -> ErrorClass {
        self.providers
            .iter()
            .find(|(_, patterns)| patterns.iter().any(|pattern| pattern.is_match(message)))
            .map(|(provider, _)| ErrorClass::RateLimited {
                provider: provider.clone(),
            })
            .unwrap_or(ErrorClass::Terminal)
    }

    pub fn is_retryable(&self, message: &str) -> bool {
        self.classify(message) != ErrorClass::Terminal
    }
}
