//! Rollup Time Series Policy
//!
//! Per-series rollup policies: the timezone used for calendar buckets, the
//! aggregation method, and the retention of each granularity. Policies are
//! kept in a pluggable directory and resolved through [`PolicyResolver`],
//! which can create defaults for series seen for the first time.
//!
//! Key Features:
//! - Wire-compatible policy document
//! - Default policy with aggregation taken from the series name
//! - Directory CRUD with an in-memory implementation
//! - Configurable create-or-fail handling of unknown series
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::aggregation::AggregationMethod;
use crate::bucketing::parse_timezone;
use async_trait::async_trait;
use parking_lot::RwLock;
use rollup_common::{DefaultPolicyMode, Granularity, Result, RollupError, SECONDS_IN_DAY};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub const DEFAULT_TIMEZONE: &str = "Europe/Madrid";

/// Separates a series name from an aggregation method suffix,
/// e.g. `building-7____max`.
pub const AGGREGATION_SEPARATOR: &str = "____";

pub type Retentions = BTreeMap<Granularity, i64>;

/// Retention applied when a policy does not specify one, in seconds.
pub fn default_retentions() -> Retentions {
    [
        (Granularity::Second, 3 * SECONDS_IN_DAY),
        (Granularity::Minute, 31 * SECONDS_IN_DAY),
        (Granularity::Hour, 6 * 31 * SECONDS_IN_DAY),
        (Granularity::Day, 12 * 31 * SECONDS_IN_DAY),
        (Granularity::Month, 3 * 12 * 31 * SECONDS_IN_DAY),
        (Granularity::Year, 10 * 12 * 31 * SECONDS_IN_DAY),
    ]
    .into_iter()
    .collect()
}

/// Aggregation method named by the suffix of a series, if any.
pub fn aggregation_from_series_name(series: &str) -> Option<AggregationMethod> {
    let (_, suffix) = series.rsplit_once(AGGREGATION_SEPARATOR)?;
    suffix.parse().ok()
}

// =============================================================================
// Series Policy
// =============================================================================

/// Rollup configuration of one series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesPolicy {
    pub timezone: String,
    pub aggregation: AggregationMethod,
    pub retentions: Retentions,
    /// True when the policy was created implicitly.
    #[serde(default)]
    pub default: bool,
    #[serde(rename = "timeserie", default, skip_serializing_if = "Option::is_none")]
    pub series: Option<String>,
}

impl SeriesPolicy {
    pub fn new(
        timezone: impl Into<String>,
        aggregation: AggregationMethod,
        retentions: Retentions,
    ) -> Self {
        Self {
            timezone: timezone.into(),
            aggregation,
            retentions,
            default: false,
            series: None,
        }
    }

    /// The policy created for a series without one.
    pub fn default_for(series: &str) -> Self {
        let aggregation = match series.rsplit_once(AGGREGATION_SEPARATOR) {
            Some((_, suffix)) => suffix.parse().unwrap_or_else(|_| {
                tracing::warn!(
                    "Series {} names unknown aggregation {}, using {}",
                    series,
                    suffix,
                    AggregationMethod::default()
                );
                AggregationMethod::default()
            }),
            None => AggregationMethod::default(),
        };
        Self {
            timezone: DEFAULT_TIMEZONE.to_string(),
            aggregation,
            retentions: default_retentions(),
            default: true,
            series: Some(series.to_string()),
        }
    }

    pub fn with_aggregation(mut self, aggregation: AggregationMethod) -> Self {
        self.aggregation = aggregation;
        self
    }

    /// Retention of a granularity in seconds.
    pub fn retention(&self, granularity: Granularity) -> Result<i64> {
        self.retentions
            .get(&granularity)
            .copied()
            .ok_or_else(|| RollupError::MissingRetention {
                series: self.series.clone().unwrap_or_default(),
                granularity,
            })
    }

    /// Expiry of a record stored at `time` in the `granularity` table.
    pub fn ttl(&self, granularity: Granularity, time: i64) -> Result<i64> {
        Ok(time + self.retention(granularity)?)
    }

    pub fn validate(&self) -> Result<()> {
        parse_timezone(&self.timezone)?;
        Ok(())
    }
}

// =============================================================================
// Policy Directory
// =============================================================================

/// Persistent store of series policies.
#[async_trait]
pub trait PolicyDirectory: Send + Sync {
    async fn get(&self, series: &str) -> Result<Option<SeriesPolicy>>;

    /// Insert or replace the policy of `series`.
    async fn put(&self, series: &str, policy: SeriesPolicy) -> Result<()>;

    async fn list(&self) -> Result<Vec<SeriesPolicy>>;

    /// Remove policies, returning how many existed.
    async fn delete(&self, series: &[String]) -> Result<usize>;
}

/// In-memory policy directory.
#[derive(Default)]
pub struct MemoryPolicyDirectory {
    policies: RwLock<BTreeMap<String, SeriesPolicy>>,
}

impl MemoryPolicyDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PolicyDirectory for MemoryPolicyDirectory {
    async fn get(&self, series: &str) -> Result<Option<SeriesPolicy>> {
        Ok(self.policies.read().get(series).cloned())
    }

    async fn put(&self, series: &str, mut policy: SeriesPolicy) -> Result<()> {
        policy.series = Some(series.to_string());
        self.policies.write().insert(series.to_string(), policy);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SeriesPolicy>> {
        Ok(self.policies.read().values().cloned().collect())
    }

    async fn delete(&self, series: &[String]) -> Result<usize> {
        let mut policies = self.policies.write();
        Ok(series.iter().filter(|s| policies.remove(*s).is_some()).count())
    }
}

// =============================================================================
// Policy Resolver
// =============================================================================

/// Looks up series policies, creating defaults when configured to.
#[derive(Clone)]
pub struct PolicyResolver {
    directory: Arc<dyn PolicyDirectory>,
    mode: DefaultPolicyMode,
}

impl PolicyResolver {
    pub fn new(directory: Arc<dyn PolicyDirectory>, mode: DefaultPolicyMode) -> Self {
        Self { directory, mode }
    }

    pub fn mode(&self) -> DefaultPolicyMode {
        self.mode
    }

    pub fn directory(&self) -> &Arc<dyn PolicyDirectory> {
        &self.directory
    }

    /// Policy of `series`, creating and persisting a default one if allowed.
    pub async fn resolve(&self, series: &str) -> Result<SeriesPolicy> {
        if let Some(policy) = self.directory.get(series).await? {
            return Ok(policy);
        }
        match self.mode {
            DefaultPolicyMode::Fail => Err(RollupError::PolicyNotFound(series.to_string())),
            DefaultPolicyMode::Create => {
                tracing::info!("Creating default configuration for {}", series);
                self.directory.put(series, SeriesPolicy::default_for(series)).await?;
                self.directory
                    .get(series)
                    .await?
                    .ok_or_else(|| RollupError::Internal(format!("policy for {} was not stored", series)))
            }
        }
    }

    /// Resolve every distinct series once. Fails on the first series that
    /// cannot be resolved.
    pub async fn resolve_many<'a, I>(&self, series: I) -> Result<HashMap<String, SeriesPolicy>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut resolved = HashMap::new();
        for name in series {
            if !resolved.contains_key(name) {
                let policy = self.resolve(name).await?;
                resolved.insert(name.to_string(), policy);
            }
        }
        Ok(resolved)
    }

    /// Store an explicit policy. Missing retentions fall back to the defaults.
    pub async fn update_policy(
        &self,
        series: &str,
        timezone: &str,
        aggregation: &str,
        retentions: Option<Retentions>,
    ) -> Result<SeriesPolicy> {
        let aggregation: AggregationMethod = aggregation.parse()?;
        let retentions = match retentions {
            Some(retentions) if !retentions.is_empty() => retentions,
            _ => {
                tracing::info!("Setting default retentions for {}", series);
                default_retentions()
            }
        };
        let policy = SeriesPolicy::new(timezone, aggregation, retentions);
        policy.validate()?;

        tracing::info!("Setting configuration {:?} for {}", policy, series);
        self.directory.put(series, policy).await?;
        self.resolve(series).await
    }

    /// Policies of the named series, or every stored policy when `None`.
    /// Named series are resolved, so defaults may be created.
    pub async fn policies(&self, series: Option<&[String]>) -> Result<Vec<SeriesPolicy>> {
        match series {
            None => self.directory.list().await,
            Some(names) => {
                let mut policies = Vec::with_capacity(names.len());
                for name in names {
                    match self.resolve(name).await {
                        Ok(policy) => policies.push(policy),
                        Err(RollupError::PolicyNotFound(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
                Ok(policies)
            }
        }
    }

    pub async fn delete(&self, series: &[String]) -> Result<usize> {
        tracing::info!("Deleting configuration {:?}", series);
        self.directory.delete(series).await
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(mode: DefaultPolicyMode) -> PolicyResolver {
        PolicyResolver::new(Arc::new(MemoryPolicyDirectory::new()), mode)
    }

    #[test]
    fn test_default_policy() {
        let policy = SeriesPolicy::default_for("meter");
        assert_eq!(policy.timezone, DEFAULT_TIMEZONE);
        assert_eq!(policy.aggregation, AggregationMethod::Sum);
        assert!(policy.default);
        assert_eq!(policy.retention(Granularity::Second).unwrap(), 259200);
        assert_eq!(policy.retention(Granularity::Year).unwrap(), 321408000);

        let policy = SeriesPolicy::default_for("meter____abs_max");
        assert_eq!(policy.aggregation, AggregationMethod::AbsMax);

        let policy = SeriesPolicy::default_for("meter____median");
        assert_eq!(policy.aggregation, AggregationMethod::Sum);
    }

    #[test]
    fn test_aggregation_from_series_name() {
        assert_eq!(
            aggregation_from_series_name("a____b____last"),
            Some(AggregationMethod::Last)
        );
        assert_eq!(aggregation_from_series_name("plain"), None);
        assert_eq!(aggregation_from_series_name("x____unknown"), None);
    }

    #[test]
    fn test_missing_retention() {
        let mut retentions = default_retentions();
        retentions.remove(&Granularity::Month);
        let policy = SeriesPolicy::new("UTC", AggregationMethod::Max, retentions);
        assert!(matches!(
            policy.ttl(Granularity::Month, 0),
            Err(RollupError::MissingRetention { granularity: Granularity::Month, .. })
        ));
        assert_eq!(policy.ttl(Granularity::Minute, 60).unwrap(), 60 + 31 * 86400);
    }

    #[test]
    fn test_wire_format() {
        let json = r#"{
            "timezone": "UTC",
            "aggregation": "average_zero",
            "retentions": {"second": 10, "minute": 20},
            "default": false,
            "timeserie": "s1"
        }"#;
        let policy: SeriesPolicy = serde_json::from_str(json).unwrap();
        assert_eq!(policy.aggregation, AggregationMethod::AverageWithoutZeroes);
        assert_eq!(policy.retention(Granularity::Minute).unwrap(), 20);
        assert_eq!(policy.series.as_deref(), Some("s1"));

        let back = serde_json::to_value(&policy).unwrap();
        assert_eq!(back["retentions"]["second"], 10);
        assert_eq!(back["aggregation"], "average_without_zeroes");
    }

    #[tokio::test]
    async fn test_resolve_fail_mode() {
        let resolver = resolver(DefaultPolicyMode::Fail);
        assert!(matches!(
            resolver.resolve("unknown").await,
            Err(RollupError::PolicyNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_resolve_creates_default() {
        let resolver = resolver(DefaultPolicyMode::Create);
        let policy = resolver.resolve("fresh____count").await.expect("resolve should succeed");
        assert!(policy.default);
        assert_eq!(policy.aggregation, AggregationMethod::Count);
        assert_eq!(policy.series.as_deref(), Some("fresh____count"));
        assert_eq!(resolver.policies(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_policy() {
        let resolver = resolver(DefaultPolicyMode::Fail);
        let policy = resolver
            .update_policy("s1", "America/New_York", "max", None)
            .await
            .expect("update_policy should succeed");
        assert!(!policy.default);
        assert_eq!(policy.aggregation, AggregationMethod::Max);
        assert_eq!(policy.retentions, default_retentions());

        assert!(matches!(
            resolver.update_policy("s1", "UTC", "median", None).await,
            Err(RollupError::UnsupportedAggregation(_))
        ));
        assert!(matches!(
            resolver.update_policy("s1", "Nowhere/City", "max", None).await,
            Err(RollupError::InvalidTimezone(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_and_recreate() {
        let resolver = resolver(DefaultPolicyMode::Create);
        resolver.update_policy("s1", "UTC", "last", None).await.unwrap();
        resolver.update_policy("s2", "UTC", "sum", None).await.unwrap();

        let deleted = resolver.delete(&["s1".to_string()]).await.unwrap();
        assert_eq!(deleted, 1);

        let listed = resolver.policies(None).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].series.as_deref(), Some("s2"));

        let recreated = resolver.policies(Some(&["s1".to_string()])).await.unwrap();
        assert_eq!(recreated.len(), 1);
        assert!(recreated[0].default);
    }

    #[tokio::test]
    async fn test_resolve_many_fails_fast() {
        let resolver = resolver(DefaultPolicyMode::Fail);
        resolver.update_policy("known", "UTC", "sum", None).await.unwrap();

        let ok = resolver.resolve_many(["known", "known"]).await.unwrap();
        assert_eq!(ok.len(), 1);

        assert!(resolver.resolve_many(["known", "missing"]).await.is_err());
    }
}
