//! Age-out expression parsing and evaluation.
//!
//! An expression has the shape `<base>+<duration>`, e.g. `last_seen+30d` or
//! `90d` (bare duration, base defaults to `first_seen`). A missing/null
//! expression means "never age out".

use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::NodeError;
use crate::record::{AgeOutBase, IndicatorRecord, MAX_AGE_OUT};

/// A parsed age-out expression: a base timestamp plus a millisecond offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgeOutExpr {
    pub base: AgeOutBase,
    pub offset_ms: i64,
}

impl AgeOutExpr {
    /// Parse `<base>+<duration>` or a bare `<duration>` (base defaults to
    /// `first_seen`). Duration is an integer followed by `d`, `h`, `m`, or no
    /// suffix (bare seconds).
    pub fn parse(expr: &str) -> Result<Self, NodeError> {
        let (base_str, duration_str) = match expr.split_once('+') {
            Some((b, d)) => (Some(b), d),
            None => (None, expr),
        };

        let base = match base_str {
            None | Some("first_seen") => AgeOutBase::FirstSeen,
            Some("last_seen") => AgeOutBase::LastSeen,
            Some(other) => {
                return Err(NodeError::InvalidAgeOut(
                    expr.to_string(),
                    format!("unknown base {other:?}"),
                ));
            }
        };

        let offset_ms = parse_duration_ms(duration_str)
            .ok_or_else(|| NodeError::InvalidAgeOut(expr.to_string(), "malformed duration".to_string()))?;

        Ok(AgeOutExpr { base, offset_ms })
    }

    /// Absolute age-out deadline for `record` under this expression.
    pub fn evaluate(&self, record: &IndicatorRecord) -> i64 {
        record.base_timestamp(self.base) + self.offset_ms
    }
}

fn parse_duration_ms(s: &str) -> Option<i64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let (digits, unit_secs) = match s.chars().last().unwrap() {
        'd' => (&s[..s.len() - 1], 86_400),
        'h' => (&s[..s.len() - 1], 3_600),
        'm' => (&s[..s.len() - 1], 60),
        _ => (s, 1),
    };
    let n: i64 = digits.parse().ok()?;
    Some(n * unit_secs * 1000)
}

/// The parsed `age_out` config block: scan cadence, sudden-death flag, a
/// default expression (`None` means never), and per-indicator-type
/// overrides.
#[derive(Debug, Clone)]
pub struct AgeOutPolicy {
    pub interval: Duration,
    pub sudden_death: bool,
    pub default: Option<AgeOutExpr>,
    pub by_type: BTreeMap<String, AgeOutExpr>,
}

impl AgeOutPolicy {
    /// Build a policy from raw config strings (as deserialized from YAML —
    /// see [`crate::config`]).
    pub fn from_config(
        interval_secs: u64,
        sudden_death: bool,
        default: Option<&str>,
        by_type: &BTreeMap<String, String>,
    ) -> Result<Self, NodeError> {
        let default = default.map(AgeOutExpr::parse).transpose()?;
        let mut parsed = BTreeMap::new();
        for (ty, expr) in by_type {
            parsed.insert(ty.clone(), AgeOutExpr::parse(expr)?);
        }
        Ok(AgeOutPolicy {
            interval: Duration::from_secs(interval_secs),
            sudden_death,
            default,
            by_type: parsed,
        })
    }

    /// Compute `_age_out` for `record`, preferring a per-type override keyed
    /// by the record's `type` attribute, falling back to the default
    /// expression, and finally to "never" (`MAX_AGE_OUT`).
    pub fn evaluate(&self, record: &IndicatorRecord) -> i64 {
        let expr = record
            .indicator_type()
            .and_then(|ty| self.by_type.get(ty))
            .or(self.default.as_ref());

        match expr {
            Some(expr) => expr.evaluate(record),
            None => MAX_AGE_OUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Attributes;
    use serde_json::json;

    fn rec(first_seen: i64, last_seen: i64, ty: Option<&str>) -> IndicatorRecord {
        let mut attributes = Attributes::new();
        if let Some(ty) = ty {
            attributes.insert("type".to_string(), json!(ty));
        }
        IndicatorRecord {
            sources: vec![],
            first_seen,
            last_seen,
            last_run: last_seen,
            age_out: 0,
            withdrawn: None,
            attributes,
        }
    }

    #[test]
    fn bare_duration_defaults_to_first_seen_in_days() {
        let expr = AgeOutExpr::parse("30d").unwrap();
        assert_eq!(expr.base, AgeOutBase::FirstSeen);
        assert_eq!(expr.offset_ms, 30 * 86_400 * 1000);
    }

    #[test]
    fn explicit_base_and_hour_suffix() {
        let expr = AgeOutExpr::parse("last_seen+6h").unwrap();
        assert_eq!(expr.base, AgeOutBase::LastSeen);
        assert_eq!(expr.offset_ms, 6 * 3_600 * 1000);
        let r = rec(0, 1_000_000, None);
        assert_eq!(expr.evaluate(&r), 1_000_000 + 6 * 3_600 * 1000);
    }

    #[test]
    fn unknown_base_is_rejected() {
        assert!(AgeOutExpr::parse("weird+10d").is_err());
    }

    #[test]
    fn policy_prefers_type_override_over_default() {
        let mut by_type = BTreeMap::new();
        by_type.insert("IPv4".to_string(), "first_seen+1d".to_string());
        let policy = AgeOutPolicy::from_config(300, false, Some("first_seen+30d"), &by_type).unwrap();

        let r = rec(0, 0, Some("IPv4"));
        assert_eq!(policy.evaluate(&r), 86_400 * 1000);

        let r = rec(0, 0, Some("URL"));
        assert_eq!(policy.evaluate(&r), 30 * 86_400 * 1000);
    }

    #[test]
    fn no_default_and_no_override_never_ages_out() {
        let policy = AgeOutPolicy::from_config(300, false, None, &BTreeMap::new()).unwrap();
        let r = rec(0, 0, None);
        assert_eq!(policy.evaluate(&r), MAX_AGE_OUT);
    }
}
