//! Query classification.
//!
//! `QueryAnalyzer::analyze` inspects an OpenSearch-style JSON body and reports
//! every planning-relevant fact it finds: tenant key, bounded time range,
//! requested window and the terms aggregation whose buckets need a global
//! top-k. It has no side effects and never consults topology.
//!
//! Only constraining clauses are walked: the top-level `query`, `bool.must`,
//! `bool.filter` and `constant_score.filter`. A `should` or `must_not` clause
//! never narrows the result set, so terms found there are ignored.

use std::collections::BTreeMap;

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use shardwise_common::config::PlannerConfig;
use shardwise_common::error::{ShardwiseError, ShardwiseResult};
use shardwise_common::search::SearchQuery;

pub const DEFAULT_SIZE: usize = 10;
pub const DEFAULT_AGG_SIZE: usize = 10;

/// Partition key carried by a tenant-scoped query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantKey {
    pub field: String,
    pub value: String,
}

/// Inclusive epoch-millisecond bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub from_ms: i64,
    pub to_ms: i64,
}

impl TimeRange {
    pub fn new(from_ms: i64, to_ms: i64) -> Self {
        Self { from_ms, to_ms }
    }

    /// No instant satisfies the range.
    pub fn is_empty(&self) -> bool {
        self.from_ms > self.to_ms
    }

    pub fn overlaps(&self, from_ms: i64, to_ms: i64) -> bool {
        self.from_ms <= to_ms && from_ms <= self.to_ms
    }

    fn intersect(self, other: TimeRange) -> TimeRange {
        TimeRange {
            from_ms: self.from_ms.max(other.from_ms),
            to_ms: self.to_ms.min(other.to_ms),
        }
    }
}

/// The terms aggregation a query asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermsAggRequest {
    /// Aggregation names from the root `aggs` object down to this one.
    pub path: Vec<String>,
    pub field: String,
    /// Requested bucket count.
    pub size: usize,
}

impl TermsAggRequest {
    pub fn name(&self) -> &str {
        self.path.last().map(String::as_str).unwrap_or_default()
    }
}

/// Everything the planner needs to know about a query's shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryClassification {
    pub tenant: Option<TenantKey>,
    pub time_range: Option<TimeRange>,
    pub needs_global_topk: bool,
    pub size: usize,
    pub from: usize,
    pub terms_agg: Option<TermsAggRequest>,
}

impl QueryClassification {
    pub fn is_tenant_scoped(&self) -> bool {
        self.tenant.is_some()
    }

    pub fn is_time_series(&self) -> bool {
        self.time_range.is_some()
    }

    /// Hits the merged response must be able to rank: `from + size`.
    pub fn hit_window(&self) -> usize {
        self.from.saturating_add(self.size)
    }

    pub fn agg_size(&self) -> Option<usize> {
        self.terms_agg.as_ref().map(|a| a.size)
    }
}

#[derive(Default)]
struct Facts<'a> {
    /// Tenant field → values seen, in clause order.
    tenant_terms: BTreeMap<&'a str, Vec<String>>,
    time_range: Option<TimeRange>,
}

/// Stateless classifier configured with the partition and timestamp fields.
#[derive(Debug, Clone)]
pub struct QueryAnalyzer {
    tenant_fields: Vec<String>,
    timestamp_field: String,
}

impl QueryAnalyzer {
    pub fn new(config: &PlannerConfig) -> Self {
        Self {
            tenant_fields: config.tenant_fields.clone(),
            timestamp_field: config.timestamp_field.clone(),
        }
    }

    pub fn analyze(&self, query: &SearchQuery) -> ShardwiseResult<QueryClassification> {
        let body = query
            .body
            .as_object()
            .ok_or_else(|| ShardwiseError::planning("query body must be a JSON object"))?;

        let size = read_count(body.get("size"), "size")?.unwrap_or(DEFAULT_SIZE);
        let from = read_count(body.get("from"), "from")?.unwrap_or(0);

        let mut facts = Facts::default();
        if let Some(clause) = body.get("query") {
            self.walk(clause, &mut facts);
        }

        let tenant = self.pick_tenant(&facts);
        let terms_agg = body
            .get("aggs")
            .or_else(|| body.get("aggregations"))
            .and_then(|aggs| find_terms_agg(aggs, &mut Vec::new()));

        Ok(QueryClassification {
            tenant,
            time_range: facts.time_range,
            needs_global_topk: size > 0 || terms_agg.is_some(),
            size,
            from,
            terms_agg,
        })
    }

    fn walk<'a>(&'a self, clause: &Value, facts: &mut Facts<'a>) {
        let Some(obj) = clause.as_object() else {
            return;
        };
        for (kind, inner) in obj {
            match kind.as_str() {
                "term" => self.collect_term(inner, facts),
                "range" => self.collect_range(inner, facts),
                "bool" => {
                    for key in ["must", "filter"] {
                        match inner.get(key) {
                            Some(Value::Array(items)) => {
                                for item in items {
                                    self.walk(item, facts);
                                }
                            }
                            Some(item) => self.walk(item, facts),
                            None => {}
                        }
                    }
                }
                "constant_score" => {
                    if let Some(filter) = inner.get("filter") {
                        self.walk(filter, facts);
                    }
                }
                _ => {}
            }
        }
    }

    fn collect_term<'a>(&'a self, inner: &Value, facts: &mut Facts<'a>) {
        let Some(obj) = inner.as_object() else {
            return;
        };
        for (field, raw) in obj {
            let Some(tenant_field) = self.tenant_fields.iter().find(|f| *f == field) else {
                continue;
            };
            let value = match raw {
                Value::Object(o) => o.get("value"),
                v => Some(v),
            };
            if let Some(value) = value.and_then(scalar_to_string) {
                facts
                    .tenant_terms
                    .entry(tenant_field.as_str())
                    .or_default()
                    .push(value);
            }
        }
    }

    fn collect_range(&self, inner: &Value, facts: &mut Facts<'_>) {
        let Some(bounds) = inner.get(&self.timestamp_field).and_then(Value::as_object) else {
            return;
        };
        let lower = match (bounds.get("gte"), bounds.get("gt")) {
            (Some(v), _) => parse_instant(v),
            (None, Some(v)) => parse_instant(v).map(|ms| ms.saturating_add(1)),
            (None, None) => None,
        };
        let upper = match (bounds.get("lte"), bounds.get("lt")) {
            (Some(v), _) => parse_instant(v),
            (None, Some(v)) => parse_instant(v).map(|ms| ms.saturating_sub(1)),
            (None, None) => None,
        };
        // Half-open and date-math ranges do not bound the query.
        if let (Some(from_ms), Some(to_ms)) = (lower, upper) {
            let range = TimeRange { from_ms, to_ms };
            facts.time_range = Some(match facts.time_range {
                Some(prev) => prev.intersect(range),
                None => range,
            });
        }
    }

    /// First configured tenant field that appears; conflicting values on it
    /// leave the query unscoped.
    fn pick_tenant(&self, facts: &Facts<'_>) -> Option<TenantKey> {
        let (field, values) = self
            .tenant_fields
            .iter()
            .find_map(|f| facts.tenant_terms.get_key_value(f.as_str()))?;
        let first = values.first()?;
        if values.iter().any(|v| v != first) {
            tracing::debug!(field = %field, "conflicting tenant terms; query not tenant-scoped");
            return None;
        }
        Some(TenantKey {
            field: field.to_string(),
            value: first.clone(),
        })
    }
}

fn read_count(value: Option<&Value>, name: &str) -> ShardwiseResult<Option<usize>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| {
                ShardwiseError::planning(format!(
                    "`{}` must be a non-negative integer, got {}",
                    name, v
                ))
            }),
    }
}

fn scalar_to_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Epoch milliseconds from a number, a numeric string or an RFC 3339 string.
fn parse_instant(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.parse::<i64>().ok().or_else(|| {
            DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.timestamp_millis())
        }),
        _ => None,
    }
}

/// Depth-first search for the first `terms` aggregation, visiting sibling
/// aggregations in name order.
fn find_terms_agg(aggs: &Value, path: &mut Vec<String>) -> Option<TermsAggRequest> {
    let obj = aggs.as_object()?;
    let mut names: Vec<&String> = obj.keys().collect();
    names.sort();
    for name in names {
        let def = &obj[name.as_str()];
        path.push(name.clone());
        if let Some(terms) = def.get("terms").and_then(Value::as_object) {
            if let Some(field) = terms.get("field").and_then(Value::as_str) {
                let size = terms
                    .get("size")
                    .and_then(Value::as_u64)
                    .and_then(|n| usize::try_from(n).ok())
                    .unwrap_or(DEFAULT_AGG_SIZE);
                return Some(TermsAggRequest {
                    path: path.clone(),
                    field: field.to_string(),
                    size,
                });
            }
        }
        if let Some(found) = def
            .get("aggs")
            .or_else(|| def.get("aggregations"))
            .and_then(|sub| find_terms_agg(sub, path))
        {
            return Some(found);
        }
        path.pop();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn analyzer() -> QueryAnalyzer {
        QueryAnalyzer::new(&PlannerConfig::default())
    }

    fn classify(body: Value) -> QueryClassification {
        analyzer().analyze(&SearchQuery::new("logs", body)).unwrap()
    }

    #[test]
    fn test_defaults_for_empty_body() {
        let c = classify(json!({}));
        assert_eq!(c.size, 10);
        assert_eq!(c.from, 0);
        assert!(c.needs_global_topk);
        assert!(!c.is_tenant_scoped());
        assert!(!c.is_time_series());
    }

    #[test]
    fn test_size_zero_without_aggs_is_not_topk() {
        let c = classify(json!({"size": 0}));
        assert!(!c.needs_global_topk);
    }

    #[test]
    fn test_tenant_term_in_filter() {
        let c = classify(json!({
            "query": {"bool": {"filter": [
                {"term": {"tenant_id": "acme"}},
                {"match": {"message": "error"}}
            ]}}
        }));
        assert_eq!(
            c.tenant,
            Some(TenantKey {
                field: "tenant_id".into(),
                value: "acme".into()
            })
        );
    }

    #[test]
    fn test_tenant_value_object_and_number() {
        let c = classify(json!({"query": {"term": {"tenant_id": {"value": 42}}}}));
        assert_eq!(c.tenant.unwrap().value, "42");
    }

    #[test]
    fn test_should_clause_does_not_scope() {
        let c = classify(json!({
            "query": {"bool": {"should": [{"term": {"tenant_id": "acme"}}]}}
        }));
        assert!(c.tenant.is_none());
    }

    #[test]
    fn test_conflicting_tenants_not_scoped() {
        let c = classify(json!({
            "query": {"bool": {"must": [
                {"term": {"tenant_id": "acme"}},
                {"constant_score": {"filter": {"term": {"tenant_id": "globex"}}}}
            ]}}
        }));
        assert!(c.tenant.is_none());
    }

    #[test]
    fn test_bounded_range_is_time_series() {
        let c = classify(json!({
            "query": {"bool": {"filter": {"range": {"@timestamp": {
                "gte": "2024-01-01T00:00:00Z",
                "lt": 1704153600000i64
            }}}}}
        }));
        assert_eq!(
            c.time_range,
            Some(TimeRange::new(1_704_067_200_000, 1_704_153_599_999))
        );
    }

    #[test]
    fn test_half_open_or_date_math_range_is_unbounded() {
        let c = classify(json!({"query": {"range": {"@timestamp": {"gte": 1000}}}}));
        assert!(c.time_range.is_none());
        let c = classify(json!({"query": {"range": {"@timestamp": {"gte": "now-1h", "lte": "now"}}}}));
        assert!(c.time_range.is_none());
    }

    #[test]
    fn test_ranges_intersect() {
        let c = classify(json!({"query": {"bool": {"filter": [
            {"range": {"@timestamp": {"gte": 100, "lte": 500}}},
            {"range": {"@timestamp": {"gte": 300, "lte": 900}}}
        ]}}}));
        assert_eq!(c.time_range, Some(TimeRange::new(300, 500)));
    }

    #[test]
    fn test_all_facts_reported_together() {
        let c = classify(json!({
            "size": 5,
            "from": 20,
            "query": {"bool": {"filter": [
                {"term": {"tenant_id": "acme"}},
                {"range": {"@timestamp": {"gte": 0, "lte": 10}}}
            ]}},
            "aggs": {"by_host": {"terms": {"field": "host", "size": 3}}}
        }));
        assert!(c.is_tenant_scoped());
        assert!(c.is_time_series());
        assert!(c.needs_global_topk);
        assert_eq!(c.hit_window(), 25);
        assert_eq!(c.agg_size(), Some(3));
    }

    #[test]
    fn test_first_terms_agg_by_name_depth_first() {
        let c = classify(json!({
            "size": 0,
            "aggregations": {
                "z_hosts": {"terms": {"field": "host"}},
                "a_outer": {
                    "date_histogram": {"field": "@timestamp"},
                    "aggs": {"inner": {"terms": {"field": "level", "size": 4}}}
                }
            }
        }));
        let agg = c.terms_agg.unwrap();
        assert_eq!(agg.path, vec!["a_outer".to_string(), "inner".to_string()]);
        assert_eq!(agg.field, "level");
        assert_eq!(agg.size, 4);
        assert!(c.needs_global_topk);
    }

    #[test]
    fn test_terms_agg_default_size() {
        let c = classify(json!({"size": 0, "aggs": {"hosts": {"terms": {"field": "host"}}}}));
        assert_eq!(c.agg_size(), Some(DEFAULT_AGG_SIZE));
        assert_eq!(c.terms_agg.unwrap().name(), "hosts");
    }

    #[test]
    fn test_invalid_shapes_rejected() {
        let a = analyzer();
        for body in [json!([]), json!({"size": -1}), json!({"from": "ten"}), json!({"size": 1.5})] {
            let err = a.analyze(&SearchQuery::new("logs", body)).unwrap_err();
            assert!(matches!(err, ShardwiseError::Planning(_)));
        }
    }
}
