// Tiered search over live vehicles.
//
// Tiers, best first: exact route, exact id, id substring, route substring.
// The best tier that matches anything decides the result set, so a query
// like "7" shows route 7 and not every fleet number containing a 7.

use serde::Serialize;

use crate::models::VehicleRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MatchTier {
    ExactRoute,
    ExactId,
    IdContains,
    RouteContains,
}

/// Best tier at which `record` matches `query`, ignoring case and surrounding blanks.
///
/// An empty query matches everything at [`MatchTier::ExactRoute`].
pub fn matches(record: &VehicleRecord, query: &str) -> Option<MatchTier> {
    let query = normalize_query(query);
    let query = query.as_str();
    if query.is_empty() {
        return Some(MatchTier::ExactRoute);
    }

    let route = record.route_id.to_lowercase();
    let id = record.id.to_lowercase();

    if route == query {
        Some(MatchTier::ExactRoute)
    } else if id == query {
        Some(MatchTier::ExactId)
    } else if id.contains(query) {
        Some(MatchTier::IdContains)
    } else if route.contains(query) {
        Some(MatchTier::RouteContains)
    } else {
        None
    }
}

pub fn normalize_query(raw: &str) -> String {
    raw.trim().to_lowercase()
}

#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    query: String,
}

impl SearchFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the normalised query changed.
    pub fn set_query(&mut self, raw: &str) -> bool {
        let query = normalize_query(raw);
        if query == self.query {
            return false;
        }
        self.query = query;
        true
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn is_active(&self) -> bool {
        !self.query.is_empty()
    }

    /// Records matching at the best tier any record reaches, input order kept.
    pub fn apply(&self, records: Vec<VehicleRecord>) -> Vec<VehicleRecord> {
        if !self.is_active() {
            return records;
        }

        let tiered: Vec<(MatchTier, VehicleRecord)> = records
            .into_iter()
            .filter_map(|record| matches(&record, &self.query).map(|tier| (tier, record)))
            .collect();

        let Some(best) = tiered.iter().map(|(tier, _)| *tier).min() else {
            return Vec::new();
        };

        tiered
            .into_iter()
            .filter(|(tier, _)| *tier == best)
            .map(|(_, record)| record)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceTag;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn bus(id: &str, route: &str) -> VehicleRecord {
        VehicleRecord {
            id: id.to_string(),
            route_id: route.to_string(),
            lat: 43.59,
            lon: -79.64,
            occupancy_or_status: String::new(),
            trip_id: String::new(),
            source_tag: SourceTag::Snapshot,
            last_seen_at: Utc::now(),
        }
    }

    fn ids(records: &[VehicleRecord]) -> Vec<&str> {
        records.iter().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn exact_route_outranks_id_substring() {
        let mut filter = SearchFilter::new();
        filter.set_query("7");

        let result = filter.apply(vec![bus("1234", "7"), bus("7007", "12")]);
        assert_eq!(ids(&result), vec!["1234"]);
    }

    #[test]
    fn tier_per_record() {
        assert_eq!(matches(&bus("1234", "7"), "7"), Some(MatchTier::ExactRoute));
        assert_eq!(matches(&bus("7", "12"), "7"), Some(MatchTier::ExactId));
        assert_eq!(matches(&bus("7007", "12"), "7"), Some(MatchTier::IdContains));
        assert_eq!(matches(&bus("1804", "107"), "7"), Some(MatchTier::RouteContains));
        assert_eq!(matches(&bus("1804", "12"), "7"), None);
    }

    #[test]
    fn tier_ignores_query_case_and_padding() {
        assert_eq!(matches(&bus("1804", "7A"), "7A"), Some(MatchTier::ExactRoute));
        assert_eq!(matches(&bus("1804", "7a"), " 7A "), Some(MatchTier::ExactRoute));
        assert_eq!(matches(&bus("1234", "7"), "7 "), Some(MatchTier::ExactRoute));
        assert_eq!(matches(&bus("AB12", "109"), "ab"), Some(MatchTier::IdContains));
        assert_eq!(matches(&bus("1804", "12"), "   "), Some(MatchTier::ExactRoute));
    }

    #[test]
    fn falls_through_to_substring_tiers() {
        let mut filter = SearchFilter::new();
        filter.set_query("18");

        let result = filter.apply(vec![bus("1804", "7"), bus("1805", "1"), bus("2001", "18X")]);
        assert_eq!(ids(&result), vec!["1804", "1805"]);
    }

    #[test]
    fn query_is_trimmed_and_case_insensitive() {
        let mut filter = SearchFilter::new();
        assert!(filter.set_query("  109x "));
        assert_eq!(filter.query(), "109x");
        assert!(!filter.set_query("109X"));

        let result = filter.apply(vec![bus("1804", "109X"), bus("1805", "109")]);
        assert_eq!(ids(&result), vec!["1804"]);
    }

    #[test]
    fn blank_query_matches_everything() {
        let mut filter = SearchFilter::new();
        filter.set_query("   ");
        assert!(!filter.is_active());

        let result = filter.apply(vec![bus("1804", "7"), bus("1805", "1")]);
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn no_match_is_empty() {
        let mut filter = SearchFilter::new();
        filter.set_query("zzz");
        assert!(filter.apply(vec![bus("1804", "7")]).is_empty());
    }
}
