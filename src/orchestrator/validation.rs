//! Per-phase configuration validation and canonicalization.
//!
//! The API accepts free-form JSON with either camelCase or snake_case
//! keys. Validation resolves defaults, coerces JSON floats into integers,
//! normalizes tlds and keyword lists, and produces both a typed config for
//! the phase service and a canonical camelCase snapshot for storage.

use serde_json::{Map, Value, json};
use tracing::warn;
use uuid::Uuid;

use crate::allocator::{PatternParams, PatternType};
use crate::errors::CoreError;
use crate::phase::Phase;

// ── Raw-JSON field helpers ───────────────────────────────────────────

fn field<'a>(raw: &'a Value, camel: &str, snake: &str) -> Option<&'a Value> {
    raw.get(camel).or_else(|| raw.get(snake))
}

fn str_field(raw: &Value, camel: &str, snake: &str) -> Option<String> {
    field(raw, camel, snake)
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Integer field that also accepts integral JSON floats (`3.0` → 3).
fn int_field(raw: &Value, camel: &str, snake: &str) -> Result<Option<i64>, CoreError> {
    match field(raw, camel, snake) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => {
            if let Some(i) = value.as_i64() {
                return Ok(Some(i));
            }
            if let Some(f) = value.as_f64() {
                if f.fract() == 0.0 {
                    return Ok(Some(f as i64));
                }
            }
            Err(CoreError::InvalidConfig(format!(
                "field {} must be an integer",
                camel
            )))
        }
    }
}

/// String list: trimmed, empties dropped, order-preserving dedupe.
fn str_list_field(raw: &Value, camel: &str, snake: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    field(raw, camel, snake)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .filter(|s| seen.insert(s.clone()))
                .collect()
        })
        .unwrap_or_default()
}

/// UUID list; malformed entries are dropped and counted.
fn uuid_list_field(raw: &Value, camel: &str, snake: &str) -> (Vec<Uuid>, usize) {
    let mut invalid = 0;
    let ids = field(raw, camel, snake)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| {
                    let parsed = v.as_str().and_then(|s| Uuid::parse_str(s.trim()).ok());
                    if parsed.is_none() {
                        invalid += 1;
                    }
                    parsed
                })
                .collect()
        })
        .unwrap_or_default();
    (ids, invalid)
}

fn uuid_strings(ids: &[Uuid]) -> Vec<String> {
    ids.iter().map(|id| id.to_string()).collect()
}

// ── Typed configs ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    pub pattern: PatternParams,
    pub num_domains: i64,
    pub batch_size: i64,
    pub offset_start: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DnsConfig {
    pub persona_ids: Vec<Uuid>,
    pub batch_size: i64,
    pub timeout_secs: i64,
    pub max_retries: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpConfig {
    pub persona_ids: Vec<Uuid>,
    pub keywords: Vec<String>,
    pub keyword_set_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnrichmentConfig {}

#[derive(Debug, Clone, PartialEq)]
pub struct KeywordRule {
    pub keyword: String,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisConfig {
    pub persona_ids: Vec<Uuid>,
    pub keyword_rules: Vec<KeywordRule>,
}

/// Validated, canonicalized configuration for one phase.
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseConfig {
    Generation(GenerationConfig),
    Dns(DnsConfig),
    Http(HttpConfig),
    Enrichment(EnrichmentConfig),
    Analysis(AnalysisConfig),
}

impl PhaseConfig {
    /// Run the phase-specific validator over raw JSON.
    pub fn validate(phase: Phase, raw: &Value) -> Result<Self, CoreError> {
        if !raw.is_object() {
            return Err(CoreError::InvalidConfig(
                "configuration must be a JSON object".into(),
            ));
        }
        match phase {
            Phase::DomainGeneration => validate_generation(raw).map(Self::Generation),
            Phase::DnsValidation => validate_dns(raw).map(Self::Dns),
            Phase::HttpKeywordValidation => validate_http(raw).map(Self::Http),
            Phase::Enrichment => Ok(Self::Enrichment(EnrichmentConfig::default())),
            Phase::Analysis => validate_analysis(raw).map(Self::Analysis),
        }
    }

    pub fn phase(&self) -> Phase {
        match self {
            Self::Generation(_) => Phase::DomainGeneration,
            Self::Dns(_) => Phase::DnsValidation,
            Self::Http(_) => Phase::HttpKeywordValidation,
            Self::Enrichment(_) => Phase::Enrichment,
            Self::Analysis(_) => Phase::Analysis,
        }
    }

    /// Canonical camelCase snapshot stored in `phase_configurations` and on
    /// the execution row.
    pub fn canonical_json(&self) -> Value {
        match self {
            Self::Generation(c) => json!({
                "patternType": c.pattern.pattern_type.as_str(),
                "prefixVariableLength": c.pattern.prefix_variable_length,
                "suffixVariableLength": c.pattern.suffix_variable_length,
                "characterSet": c.pattern.character_set,
                "constantString": c.pattern.constant_string,
                "tld": c.pattern.tld,
                "numDomains": c.num_domains,
                "batchSize": c.batch_size,
                "offsetStart": c.offset_start,
            }),
            Self::Dns(c) => json!({
                "personaIds": uuid_strings(&c.persona_ids),
                "batchSize": c.batch_size,
                "timeoutSecs": c.timeout_secs,
                "maxRetries": c.max_retries,
            }),
            Self::Http(c) => json!({
                "personaIds": uuid_strings(&c.persona_ids),
                "keywords": c.keywords,
                "keywordSetIds": uuid_strings(&c.keyword_set_ids),
            }),
            Self::Enrichment(_) => Value::Object(Map::new()),
            Self::Analysis(c) => json!({
                "personaIds": uuid_strings(&c.persona_ids),
                "keywordRules": c.keyword_rules.iter().map(|r| json!({
                    "keyword": r.keyword,
                    "weight": r.weight,
                })).collect::<Vec<_>>(),
            }),
        }
    }
}

fn validate_generation(raw: &Value) -> Result<GenerationConfig, CoreError> {
    let character_set = str_field(raw, "characterSet", "character_set")
        .ok_or_else(|| CoreError::InvalidConfig("character_set must not be empty".into()))?;
    let tld = str_field(raw, "tld", "tld")
        .ok_or_else(|| CoreError::InvalidConfig("tld must not be empty".into()))?
        .trim_start_matches('.')
        .to_lowercase();
    if tld.is_empty() {
        return Err(CoreError::InvalidConfig("tld must not be empty".into()));
    }

    let num_domains = int_field(raw, "numDomains", "num_domains")?
        .ok_or_else(|| CoreError::InvalidConfig("num_domains is required".into()))?;
    if num_domains <= 0 {
        return Err(CoreError::InvalidConfig(
            "num_domains must be greater than zero".into(),
        ));
    }

    let pattern_type = match str_field(raw, "patternType", "pattern_type") {
        Some(s) => PatternType::from_str(&s).map_err(CoreError::InvalidConfig)?,
        None => PatternType::Prefix,
    };

    // `variable_length` is the shared fallback for the side-specific lengths.
    let variable_length = int_field(raw, "variableLength", "variable_length")?.unwrap_or(0);
    let prefix_variable_length =
        int_field(raw, "prefixVariableLength", "prefix_variable_length")?
            .unwrap_or(variable_length);
    let suffix_variable_length =
        int_field(raw, "suffixVariableLength", "suffix_variable_length")?
            .unwrap_or(variable_length);

    match pattern_type {
        PatternType::Prefix if prefix_variable_length <= 0 => {
            return Err(CoreError::InvalidConfig(
                "prefix_variable_length must be greater than zero for the prefix pattern".into(),
            ));
        }
        PatternType::Suffix if suffix_variable_length <= 0 => {
            return Err(CoreError::InvalidConfig(
                "suffix_variable_length must be greater than zero for the suffix pattern".into(),
            ));
        }
        PatternType::Both if prefix_variable_length <= 0 || suffix_variable_length <= 0 => {
            return Err(CoreError::InvalidConfig(
                "the both pattern needs prefix_variable_length and suffix_variable_length".into(),
            ));
        }
        _ => {}
    }

    let batch_size = int_field(raw, "batchSize", "batch_size")?.unwrap_or(1000);
    if batch_size <= 0 {
        return Err(CoreError::InvalidConfig(
            "batch_size must be greater than zero".into(),
        ));
    }
    let offset_start = int_field(raw, "offsetStart", "offset_start")?.unwrap_or(0);
    if offset_start < 0 {
        return Err(CoreError::InvalidConfig(
            "offset_start must not be negative".into(),
        ));
    }

    Ok(GenerationConfig {
        pattern: PatternParams {
            pattern_type,
            prefix_variable_length: prefix_variable_length.max(0),
            suffix_variable_length: suffix_variable_length.max(0),
            character_set,
            constant_string: str_field(raw, "constantString", "constant_string")
                .unwrap_or_default(),
            tld,
        },
        num_domains,
        batch_size,
        offset_start,
    })
}

fn validate_dns(raw: &Value) -> Result<DnsConfig, CoreError> {
    let (persona_ids, _invalid) = uuid_list_field(raw, "personaIds", "persona_ids");
    if persona_ids.is_empty() {
        return Err(CoreError::InvalidConfig(
            "persona_ids must contain at least one valid persona".into(),
        ));
    }
    Ok(DnsConfig {
        persona_ids,
        batch_size: int_field(raw, "batchSize", "batch_size")?.unwrap_or(100),
        timeout_secs: int_field(raw, "timeoutSecs", "timeout_secs")?.unwrap_or(30),
        max_retries: int_field(raw, "maxRetries", "max_retries")?.unwrap_or(2),
    })
}

fn validate_http(raw: &Value) -> Result<HttpConfig, CoreError> {
    let (persona_ids, _invalid) = uuid_list_field(raw, "personaIds", "persona_ids");
    if persona_ids.is_empty() {
        return Err(CoreError::InvalidConfig(
            "persona_ids must contain at least one valid persona".into(),
        ));
    }
    let keywords = str_list_field(raw, "keywords", "keywords");
    let (keyword_set_ids, _) = uuid_list_field(raw, "keywordSetIds", "keyword_set_ids");
    if keywords.is_empty() && keyword_set_ids.is_empty() {
        return Err(CoreError::InvalidConfig(
            "at least one keyword or keyword set is required".into(),
        ));
    }
    Ok(HttpConfig {
        persona_ids,
        keywords,
        keyword_set_ids,
    })
}

fn validate_analysis(raw: &Value) -> Result<AnalysisConfig, CoreError> {
    let (persona_ids, _invalid) = uuid_list_field(raw, "personaIds", "persona_ids");
    if persona_ids.is_empty() {
        return Err(CoreError::InvalidConfig(
            "persona_ids must contain at least one valid persona".into(),
        ));
    }

    let raw_rules = field(raw, "keywordRules", "keyword_rules")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut keyword_rules = Vec::new();
    for rule in &raw_rules {
        let keyword = rule
            .get("keyword")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        match keyword {
            Some(keyword) => keyword_rules.push(KeywordRule {
                keyword,
                weight: rule.get("weight").and_then(Value::as_f64).unwrap_or(1.0),
            }),
            None => warn!(rule = %rule, "skipping keyword rule without a keyword"),
        }
    }
    // Rules were supplied but none survived: that is a config error, not a
    // silently empty rule set.
    if !raw_rules.is_empty() && keyword_rules.is_empty() {
        return Err(CoreError::InvalidConfig(
            "keyword_rules must contain at least one valid rule".into(),
        ));
    }

    Ok(AnalysisConfig {
        persona_ids,
        keyword_rules,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn persona() -> String {
        Uuid::new_v4().to_string()
    }

    #[test]
    fn test_generation_minimal_with_defaults() {
        let config = PhaseConfig::validate(
            Phase::DomainGeneration,
            &json!({"characterSet": "abc", "tld": "com", "numDomains": 3, "variableLength": 1}),
        )
        .unwrap();
        let PhaseConfig::Generation(c) = &config else {
            panic!("wrong variant");
        };
        assert_eq!(c.pattern.pattern_type, PatternType::Prefix);
        assert_eq!(c.pattern.prefix_variable_length, 1);
        assert_eq!(c.batch_size, 1000);
        assert_eq!(c.offset_start, 0);

        let canonical = config.canonical_json();
        assert_eq!(canonical["patternType"], "prefix");
        assert_eq!(canonical["numDomains"], 3);
        assert_eq!(canonical["batchSize"], 1000);
    }

    #[test]
    fn test_generation_accepts_snake_case_and_floats() {
        let config = PhaseConfig::validate(
            Phase::DomainGeneration,
            &json!({
                "character_set": "ab",
                "tld": ".COM",
                "num_domains": 5.0,
                "pattern_type": "suffix",
                "suffix_variable_length": 2.0,
                "constant_string": "shop"
            }),
        )
        .unwrap();
        let PhaseConfig::Generation(c) = config else {
            panic!("wrong variant");
        };
        assert_eq!(c.pattern.tld, "com"); // leading dot stripped, lowercased
        assert_eq!(c.num_domains, 5);
        assert_eq!(c.pattern.pattern_type, PatternType::Suffix);
        assert_eq!(c.pattern.suffix_variable_length, 2);
    }

    #[test]
    fn test_generation_rejections() {
        let base = json!({"characterSet": "abc", "tld": "com", "numDomains": 3, "variableLength": 1});

        for (key, value) in [
            ("characterSet", json!("")),
            ("tld", json!("  ")),
            ("numDomains", json!(0)),
            ("numDomains", json!(2.5)),
            ("patternType", json!("infix")),
        ] {
            let mut raw = base.clone();
            raw[key] = value;
            assert!(
                PhaseConfig::validate(Phase::DomainGeneration, &raw).is_err(),
                "expected rejection for {}",
                key
            );
        }

        // prefix pattern without any usable variable length
        let raw = json!({"characterSet": "abc", "tld": "com", "numDomains": 3});
        let err = PhaseConfig::validate(Phase::DomainGeneration, &raw).unwrap_err();
        assert!(err.to_string().contains("prefix_variable_length"));

        // both pattern missing the suffix side
        let raw = json!({
            "characterSet": "abc", "tld": "com", "numDomains": 3,
            "patternType": "both", "prefixVariableLength": 1
        });
        assert!(PhaseConfig::validate(Phase::DomainGeneration, &raw).is_err());
    }

    #[test]
    fn test_dns_defaults_and_persona_requirement() {
        let err =
            PhaseConfig::validate(Phase::DnsValidation, &json!({"personaIds": []})).unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfig(_)));

        // Invalid UUIDs are dropped; all-invalid means no valid personas.
        let err = PhaseConfig::validate(
            Phase::DnsValidation,
            &json!({"personaIds": ["not-a-uuid"]}),
        )
        .unwrap_err();
        assert!(err.to_string().contains("persona"));

        let config = PhaseConfig::validate(
            Phase::DnsValidation,
            &json!({"persona_ids": [persona(), "garbage", persona()]}),
        )
        .unwrap();
        let PhaseConfig::Dns(c) = config else {
            panic!("wrong variant");
        };
        assert_eq!(c.persona_ids.len(), 2);
        assert_eq!(c.batch_size, 100);
        assert_eq!(c.timeout_secs, 30);
        assert_eq!(c.max_retries, 2);
    }

    #[test]
    fn test_http_requires_keywords_or_sets() {
        let err = PhaseConfig::validate(
            Phase::HttpKeywordValidation,
            &json!({"personaIds": [persona()], "keywords": []}),
        )
        .unwrap_err();
        assert!(
            err.to_string()
                .contains("at least one keyword or keyword set is required")
        );

        let config = PhaseConfig::validate(
            Phase::HttpKeywordValidation,
            &json!({"personaIds": [persona()], "keywords": [" crm ", "crm", "", "erp"]}),
        )
        .unwrap();
        let PhaseConfig::Http(c) = config else {
            panic!("wrong variant");
        };
        // trimmed, deduped, empties dropped
        assert_eq!(c.keywords, vec!["crm", "erp"]);
    }

    #[test]
    fn test_enrichment_accepts_empty_object() {
        let config = PhaseConfig::validate(Phase::Enrichment, &json!({})).unwrap();
        assert_eq!(config.canonical_json(), json!({}));
        assert!(PhaseConfig::validate(Phase::Enrichment, &json!([])).is_err());
    }

    #[test]
    fn test_analysis_skips_bad_rules_but_not_all_bad() {
        let config = PhaseConfig::validate(
            Phase::Analysis,
            &json!({
                "personaIds": [persona()],
                "keywordRules": [
                    {"keyword": "pricing", "weight": 2.0},
                    {"weight": 1.0},
                    {"keyword": "   "}
                ]
            }),
        )
        .unwrap();
        let PhaseConfig::Analysis(c) = &config else {
            panic!("wrong variant");
        };
        assert_eq!(c.keyword_rules.len(), 1);
        assert_eq!(c.keyword_rules[0].keyword, "pricing");

        // All-invalid rule set is fatal.
        let err = PhaseConfig::validate(
            Phase::Analysis,
            &json!({"personaIds": [persona()], "keywordRules": [{"weight": 1.0}]}),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfig(_)));

        // No rules at all is fine.
        assert!(
            PhaseConfig::validate(Phase::Analysis, &json!({"personaIds": [persona()]})).is_ok()
        );
    }

    #[test]
    fn test_validate_then_revalidate_is_stable() {
        let raw = json!({
            "character_set": "xyz", "tld": ".Net", "num_domains": 10.0,
            "prefix_variable_length": 2
        });
        let first = PhaseConfig::validate(Phase::DomainGeneration, &raw).unwrap();
        let canonical = first.canonical_json();
        // Canonical output re-validates to the same config and snapshot.
        let second = PhaseConfig::validate(Phase::DomainGeneration, &canonical).unwrap();
        assert_eq!(first, second);
        assert_eq!(canonical, second.canonical_json());
    }
}
